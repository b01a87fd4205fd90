//! Parser for the gst-launch subset understood by the loopback engine.
//!
//! ```text
//! appsrc name=src caps=other/tensor,dimension=4,type=uint8 ! tee name=t
//! t. ! queue ! appsink name=a
//! t. ! valve name=v drop=true ! tensor_sink name=b
//! ```

use crate::engine::EngineError;
use std::collections::HashMap;

/// One element declared in a description.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct ElementDecl {
    pub factory: String,
    pub name: String,
    pub properties: Vec<(String, String)>,
}

/// One link between two declared elements, pads optional.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct LinkDecl {
    pub from: usize,
    pub from_pad: Option<String>,
    pub to: usize,
    pub to_pad: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(super) struct GraphDecl {
    pub elements: Vec<ElementDecl>,
    pub links: Vec<LinkDecl>,
}

#[derive(Debug, Clone)]
enum Endpoint {
    Element(usize),
    Reference(String),
}

#[derive(Debug, Clone)]
struct PendingLink {
    from: Endpoint,
    from_pad: Option<String>,
    to: Endpoint,
    to_pad: Option<String>,
}

fn tokenize(description: &str) -> Result<Vec<String>, EngineError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = description.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '!' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push("!".to_string());
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(EngineError::Parse("unterminated quote".to_string()));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn as_property(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || key.contains(['/', ',', '.']) {
        return None;
    }
    Some((key, value))
}

fn is_caps(token: &str) -> bool {
    token.split(',').next().is_some_and(|mime| mime.contains('/'))
}

fn as_reference(token: &str) -> Option<(&str, Option<&str>)> {
    let (name, pad) = token.split_once('.')?;
    if name.is_empty() || token.contains(['=', '/']) {
        return None;
    }
    Some((name, (!pad.is_empty()).then_some(pad)))
}

/// Parse `description` into element declarations and links.
pub(super) fn parse(description: &str) -> Result<GraphDecl, EngineError> {
    let tokens = tokenize(description)?;
    if tokens.is_empty() {
        return Err(EngineError::Parse("empty pipeline description".to_string()));
    }

    let mut decl = GraphDecl::default();
    let mut pending = Vec::new();
    let mut counters: HashMap<String, usize> = HashMap::new();
    // Upstream end of the chain being built, with its source pad
    let mut previous: Option<(Endpoint, Option<String>)> = None;
    let mut linking = false;
    // Element that trailing `key=value` tokens apply to
    let mut open_element: Option<usize> = None;

    for token in &tokens {
        if token == "!" {
            if previous.is_none() || linking {
                return Err(EngineError::Parse(
                    "'!' must follow an element or reference".to_string(),
                ));
            }
            linking = true;
            open_element = None;
            continue;
        }

        if let Some((key, value)) = as_property(token) {
            let Some(index) = open_element else {
                return Err(EngineError::Parse(format!(
                    "property '{}' does not follow an element",
                    token
                )));
            };
            decl.elements[index]
                .properties
                .push((key.to_string(), value.to_string()));
            continue;
        }

        if let Some((name, pad)) = as_reference(token) {
            let endpoint = Endpoint::Reference(name.to_string());
            if linking {
                if let Some((from, from_pad)) = previous.take() {
                    pending.push(PendingLink {
                        from,
                        from_pad,
                        to: endpoint.clone(),
                        to_pad: pad.map(str::to_string),
                    });
                }
                linking = false;
                previous = Some((endpoint, None));
            } else {
                previous = Some((endpoint, pad.map(str::to_string)));
            }
            open_element = None;
            continue;
        }

        let (factory, properties) = if is_caps(token) {
            ("capsfilter".to_string(), vec![("caps".to_string(), token.clone())])
        } else {
            (token.clone(), Vec::new())
        };
        let counter = counters.entry(factory.clone()).or_default();
        let name = format!("{}{}", factory, counter);
        *counter += 1;

        let index = decl.elements.len();
        decl.elements.push(ElementDecl {
            factory,
            name,
            properties,
        });
        if linking {
            if let Some((from, from_pad)) = previous.take() {
                pending.push(PendingLink {
                    from,
                    from_pad,
                    to: Endpoint::Element(index),
                    to_pad: None,
                });
            }
            linking = false;
        }
        previous = Some((Endpoint::Element(index), None));
        open_element = Some(index);
    }

    if linking {
        return Err(EngineError::Parse(
            "description ends with a dangling link".to_string(),
        ));
    }

    // `name=` overrides the automatic name
    let mut names = HashMap::new();
    for (index, element) in decl.elements.iter_mut().enumerate() {
        if let Some(pos) = element.properties.iter().rposition(|(k, _)| k == "name") {
            let (_, name) = element.properties.remove(pos);
            element.properties.retain(|(k, _)| k != "name");
            element.name = name;
        }
        if element.name.is_empty() {
            return Err(EngineError::Parse(format!(
                "empty name on {}",
                element.factory
            )));
        }
        if names.insert(element.name.clone(), index).is_some() {
            return Err(EngineError::Parse(format!(
                "duplicate element name '{}'",
                element.name
            )));
        }
    }

    let resolve = |endpoint: &Endpoint| -> Result<usize, EngineError> {
        match endpoint {
            Endpoint::Element(index) => Ok(*index),
            Endpoint::Reference(name) => names
                .get(name)
                .copied()
                .ok_or_else(|| EngineError::Parse(format!("no element named '{}'", name))),
        }
    };
    for link in pending {
        decl.links.push(LinkDecl {
            from: resolve(&link.from)?,
            from_pad: link.from_pad,
            to: resolve(&link.to)?,
            to_pad: link.to_pad,
        });
    }

    Ok(decl)
}
