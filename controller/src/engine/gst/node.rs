use super::properties;
use crate::engine::{EngineBuffer, EngineError, FeedEvent, Node, NodeHooks, PushMode};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use std::sync::Arc;
use streamctl_types::{PropertyValue, StreamCaps};
use tracing::{debug, trace};

enum Role {
    AppSrc(gst_app::AppSrc),
    AppSink(gst_app::AppSink),
    /// NNStreamer `tensor_sink`, delivering through its `new-data` signal
    TensorSink,
    Other,
}

/// A GStreamer element behind the [`Node`] trait.
pub struct GstNode {
    element: gst::Element,
    name: String,
    factory: String,
    role: Role,
    new_data_handler: Mutex<Option<glib::SignalHandlerId>>,
}

impl GstNode {
    pub(super) fn new(element: gst::Element) -> Self {
        let name = element.name().to_string();
        let factory = element
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default();
        let role = match factory.as_str() {
            "appsrc" => element
                .clone()
                .dynamic_cast::<gst_app::AppSrc>()
                .map_or(Role::Other, Role::AppSrc),
            "appsink" => element
                .clone()
                .dynamic_cast::<gst_app::AppSink>()
                .map_or(Role::Other, Role::AppSink),
            "tensor_sink" => Role::TensorSink,
            _ => Role::Other,
        };
        Self {
            element,
            name,
            factory,
            role,
            new_data_handler: Mutex::new(None),
        }
    }

    fn appsrc(&self) -> Result<&gst_app::AppSrc, EngineError> {
        match &self.role {
            Role::AppSrc(appsrc) => Ok(appsrc),
            _ => Err(EngineError::Unsupported(format!(
                "{} is not an application source",
                self.name
            ))),
        }
    }

    fn require_factory(&self, factories: &[&str], what: &str) -> Result<(), EngineError> {
        if factories.contains(&self.factory.as_str()) {
            Ok(())
        } else {
            Err(EngineError::Unsupported(format!("{} is not a {}", self.name, what)))
        }
    }

    fn flow_error(&self, err: gst::FlowError) -> EngineError {
        EngineError::Flow {
            node: self.name.clone(),
            reason: format!("{:?}", err),
        }
    }
}

fn to_engine_buffer(buffer: &gst::BufferRef) -> EngineBuffer {
    let memories = buffer
        .iter_memories()
        .filter_map(|memory| memory.map_readable().ok().map(|map| map.as_slice().to_vec()))
        .collect();
    EngineBuffer {
        memories,
        info: None,
    }
}

impl Node for GstNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &str {
        &self.factory
    }

    fn caps(&self) -> Option<StreamCaps> {
        let caps = match &self.role {
            Role::AppSrc(appsrc) => appsrc.caps(),
            _ => ["sink", "src"]
                .iter()
                .filter_map(|pad| self.element.static_pad(pad))
                .find_map(|pad| pad.current_caps()),
        }?;
        StreamCaps::parse(&caps.to_string()).ok()
    }

    fn connect(&self, hooks: NodeHooks) {
        let hooks = Arc::new(hooks);
        match &self.role {
            Role::AppSrc(appsrc) => {
                let need = hooks.clone();
                let enough = hooks.clone();
                let seek = hooks;
                appsrc.set_callbacks(
                    gst_app::AppSrcCallbacks::builder()
                        .need_data(move |_, length| {
                            if let Some(on_feed) = &need.on_feed {
                                on_feed(FeedEvent::NeedData(length));
                            }
                        })
                        .enough_data(move |_| {
                            if let Some(on_feed) = &enough.on_feed {
                                on_feed(FeedEvent::EnoughData);
                            }
                        })
                        .seek_data(move |_, offset| {
                            if let Some(on_feed) = &seek.on_feed {
                                on_feed(FeedEvent::SeekData(offset));
                            }
                            true
                        })
                        .build(),
                );
            }
            Role::AppSink(appsink) => {
                appsink.set_callbacks(
                    gst_app::AppSinkCallbacks::builder()
                        .new_sample(move |sink| {
                            let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                            let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                            if let Some(on_buffer) = &hooks.on_buffer {
                                on_buffer(to_engine_buffer(buffer));
                            }
                            Ok(gst::FlowSuccess::Ok)
                        })
                        .build(),
                );
            }
            Role::TensorSink => {
                let id = self.element.connect("new-data", false, move |values| {
                    let buffer = values.get(1)?.get::<gst::Buffer>().ok()?;
                    if let Some(on_buffer) = &hooks.on_buffer {
                        on_buffer(to_engine_buffer(&buffer));
                    }
                    None
                });
                if let Some(old) = self.new_data_handler.lock().replace(id) {
                    self.element.disconnect(old);
                }
            }
            Role::Other => trace!("{} has no dispatch hooks", self.name),
        }
        debug!("Connected dispatch hooks on {}", self.name);
    }

    fn disconnect(&self) {
        match &self.role {
            Role::AppSrc(appsrc) => {
                appsrc.set_callbacks(gst_app::AppSrcCallbacks::builder().build())
            }
            Role::AppSink(appsink) => {
                appsink.set_callbacks(gst_app::AppSinkCallbacks::builder().build())
            }
            Role::TensorSink => {
                if let Some(id) = self.new_data_handler.lock().take() {
                    self.element.disconnect(id);
                }
            }
            Role::Other => {}
        }
    }

    fn push_buffer(&self, buffer: EngineBuffer, mode: PushMode) -> Result<(), EngineError> {
        let appsrc = self.appsrc()?;
        match mode {
            PushMode::Block => appsrc.set_block(true),
            PushMode::FailFast => {
                appsrc.set_block(false);
                let max = appsrc.max_bytes();
                if max > 0 && appsrc.current_level_bytes() >= max {
                    return Err(EngineError::QueueFull(self.name.clone()));
                }
            }
        }

        let mut gst_buffer = gst::Buffer::new();
        {
            let buffer_mut = gst_buffer.make_mut();
            for memory in buffer.memories {
                buffer_mut.append_memory(gst::Memory::from_slice(memory));
            }
        }
        appsrc
            .push_buffer(gst_buffer)
            .map(|_| ())
            .map_err(|e| self.flow_error(e))
    }

    fn end_of_stream(&self) -> Result<(), EngineError> {
        self.appsrc()?
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| self.flow_error(e))
    }

    fn set_valve_open(&self, open: bool) -> Result<(), EngineError> {
        self.require_factory(&["valve"], "valve")?;
        self.element.set_property("drop", !open);
        Ok(())
    }

    fn is_valve_open(&self) -> Result<bool, EngineError> {
        self.require_factory(&["valve"], "valve")?;
        Ok(!self.element.property::<bool>("drop"))
    }

    fn pads(&self) -> Vec<String> {
        let pads = match self.factory.as_str() {
            "input-selector" => self.element.sink_pads(),
            "output-selector" => self.element.src_pads(),
            _ => Vec::new(),
        };
        pads.iter().map(|pad| pad.name().to_string()).collect()
    }

    fn active_pad(&self) -> Option<String> {
        self.require_factory(&["input-selector", "output-selector"], "stream switch")
            .ok()?;
        self.element
            .property::<Option<gst::Pad>>("active-pad")
            .map(|pad| pad.name().to_string())
    }

    fn select_pad(&self, pad: &str) -> Result<(), EngineError> {
        self.require_factory(&["input-selector", "output-selector"], "stream switch")?;
        let target = self
            .element
            .static_pad(pad)
            .ok_or_else(|| EngineError::UnknownPad {
                node: self.name.clone(),
                pad: pad.to_string(),
            })?;
        self.element.set_property("active-pad", &target);
        Ok(())
    }

    fn set_property(&self, property: &str, value: &PropertyValue) -> Result<(), EngineError> {
        if property == "active-pad" {
            return self.select_pad(&value.to_string());
        }
        properties::set_property(&self.element, &self.name, property, value)
    }

    fn property(&self, property: &str) -> Result<PropertyValue, EngineError> {
        properties::property(&self.element, &self.name, property)
    }
}

impl Drop for GstNode {
    fn drop(&mut self) {
        if let Some(id) = self.new_data_handler.lock().take() {
            self.element.disconnect(id);
        }
    }
}
