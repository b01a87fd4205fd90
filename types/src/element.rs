//! Controllable element kinds and property values.

use serde::{Deserialize, Serialize};

/// What the control layer can do with a named node of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementKind {
    /// Tensor sink delivering buffers through its `new-data` signal
    Sink,
    /// Application source accepting pushed buffers
    AppSrc,
    /// Application sink delivering pulled samples
    AppSink,
    /// Valve that can drop or pass the stream
    Valve,
    /// Input selector (N:1 switch)
    SwitchInput,
    /// Output selector (1:N switch)
    SwitchOutput,
    /// Any other named element, controlled through its properties only
    Common,
}

impl ElementKind {
    /// Classify a node by the factory that created it.
    pub fn from_factory(factory: &str) -> Self {
        match factory {
            "tensor_sink" => Self::Sink,
            "appsrc" => Self::AppSrc,
            "appsink" => Self::AppSink,
            "valve" => Self::Valve,
            "input-selector" => Self::SwitchInput,
            "output-selector" => Self::SwitchOutput,
            _ => Self::Common,
        }
    }

    /// Whether the registry builds a handle for this kind while constructing
    /// the pipeline. Common elements get one lazily on first lookup.
    pub fn is_discovered(self) -> bool {
        !matches!(self, Self::Common)
    }

    /// Kinds that deliver data to sink callbacks.
    pub fn is_sink(self) -> bool {
        matches!(self, Self::Sink | Self::AppSink)
    }

    /// Kinds that accept pushed data.
    pub fn is_source(self) -> bool {
        matches!(self, Self::AppSrc)
    }

    /// Kinds that select between branches.
    pub fn is_switch(self) -> bool {
        matches!(self, Self::SwitchInput | Self::SwitchOutput)
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sink => "sink",
            Self::AppSrc => "app-src",
            Self::AppSink => "app-sink",
            Self::Valve => "valve",
            Self::SwitchInput => "switch-input",
            Self::SwitchOutput => "switch-output",
            Self::Common => "common",
        };
        f.write_str(name)
    }
}

/// Property value that can be various types.
///
/// Element properties can be strings, numbers, booleans, enums, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl PropertyValue {
    /// Parse the textual form used in pipeline descriptions.
    ///
    /// Booleans and numbers are recognised, everything else stays a string.
    pub fn parse(text: &str) -> Self {
        match text {
            "true" | "TRUE" => return PropertyValue::Bool(true),
            "false" | "FALSE" => return PropertyValue::Bool(false),
            _ => {}
        }
        if let Ok(v) = text.parse::<i64>() {
            return PropertyValue::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return PropertyValue::Float(v);
        }
        PropertyValue::String(text.to_string())
    }

    /// Interpret the value as a boolean flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::Int(v) => Some(*v != 0),
            PropertyValue::UInt(v) => Some(*v != 0),
            PropertyValue::String(s) => match s.as_str() {
                "true" | "TRUE" | "1" => Some(true),
                "false" | "FALSE" | "0" => Some(false),
                _ => None,
            },
            PropertyValue::Float(_) => None,
        }
    }

    /// Interpret the value as an unsigned integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(v) => Some(*v),
            PropertyValue::Int(v) => u64::try_from(*v).ok(),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::String(v) => f.write_str(v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<u64> for PropertyValue {
    fn from(u: u64) -> Self {
        PropertyValue::UInt(u)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}
