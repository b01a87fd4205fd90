//! Conversion of [`PropertyValue`]s against GObject property specs.

use crate::engine::EngineError;
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use streamctl_types::PropertyValue;
use tracing::debug;

fn invalid(node: &str, property: &str, reason: String) -> EngineError {
    EngineError::InvalidProperty {
        node: node.to_string(),
        property: property.to_string(),
        reason,
    }
}

fn find_pspec(
    element: &gst::Element,
    node: &str,
    property: &str,
) -> Result<glib::ParamSpec, EngineError> {
    element
        .find_property(property)
        .ok_or_else(|| EngineError::UnknownProperty {
            node: node.to_string(),
            property: property.to_string(),
        })
}

/// Set a property, converting the value to the type the element expects.
pub(super) fn set_property(
    element: &gst::Element,
    node: &str,
    property: &str,
    value: &PropertyValue,
) -> Result<(), EngineError> {
    debug!("Setting property: {}.{} = {:?}", node, property, value);

    let pspec = find_pspec(element, node, property)?;
    if !pspec.flags().contains(glib::ParamFlags::WRITABLE) {
        return Err(invalid(node, property, "property is read-only".to_string()));
    }
    let type_name = pspec.value_type().name();
    let out_of_range = |v: &dyn std::fmt::Display| {
        invalid(
            node,
            property,
            format!("Value {} doesn't fit in {}", v, type_name),
        )
    };

    match (value, type_name) {
        (PropertyValue::Bool(v), "gboolean") => element.set_property(property, *v),
        (PropertyValue::Int(v), "gint") => {
            element.set_property(property, i32::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::Int(v), "gint64") => element.set_property(property, *v),
        (PropertyValue::Int(v), "guint") => {
            element.set_property(property, u32::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::Int(v), "guint64") => {
            element.set_property(property, u64::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::UInt(v), "guint") => {
            element.set_property(property, u32::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::UInt(v), "guint64") => element.set_property(property, *v),
        (PropertyValue::UInt(v), "gint") => {
            element.set_property(property, i32::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::UInt(v), "gint64") => {
            element.set_property(property, i64::try_from(*v).map_err(|_| out_of_range(v))?)
        }
        (PropertyValue::Float(v), "gfloat") => element.set_property(property, *v as f32),
        (PropertyValue::Float(v), "gdouble") => element.set_property(property, *v),
        // Strings, enums, flags, caps and any remaining mismatch go through
        // GStreamer's own deserializer
        (value, _) => {
            let text = value.to_string();
            let parsed = glib::Value::deserialize_with_pspec(&text, &pspec).map_err(|e| {
                invalid(
                    node,
                    property,
                    format!("cannot convert '{}' to {}: {}", text, type_name, e),
                )
            })?;
            element.set_property_from_value(property, &parsed);
        }
    }
    Ok(())
}

/// Read a property as a [`PropertyValue`].
pub(super) fn property(
    element: &gst::Element,
    node: &str,
    property: &str,
) -> Result<PropertyValue, EngineError> {
    let pspec = find_pspec(element, node, property)?;
    if !pspec.flags().contains(glib::ParamFlags::READABLE) {
        return Err(invalid(node, property, "property is write-only".to_string()));
    }

    let value = match pspec.value_type().name() {
        "gchararray" => PropertyValue::String(
            element
                .property::<Option<String>>(property)
                .unwrap_or_default(),
        ),
        "gboolean" => PropertyValue::Bool(element.property::<bool>(property)),
        "gint" => PropertyValue::Int(element.property::<i32>(property) as i64),
        "gint64" => PropertyValue::Int(element.property::<i64>(property)),
        "guint" => PropertyValue::UInt(element.property::<u32>(property) as u64),
        "guint64" => PropertyValue::UInt(element.property::<u64>(property)),
        "gfloat" => PropertyValue::Float(element.property::<f32>(property) as f64),
        "gdouble" => PropertyValue::Float(element.property::<f64>(property)),
        "GstPad" => PropertyValue::String(
            element
                .property::<Option<gst::Pad>>(property)
                .map(|pad| pad.name().to_string())
                .unwrap_or_default(),
        ),
        type_name => {
            let value = element.property_value(property);
            if let Some((_, enum_value)) = glib::EnumValue::from_value(&value) {
                PropertyValue::String(enum_value.nick().to_string())
            } else {
                let text = value.serialize().map_err(|_| {
                    invalid(
                        node,
                        property,
                        format!("Unsupported property type: {}", type_name),
                    )
                })?;
                PropertyValue::String(text.to_string())
            }
        }
    };
    Ok(value)
}
