//! GStreamer engine.
//!
//! Graphs are built with `gst::parse::launch`; bus messages are translated
//! in a bus sync handler and forwarded to the subscriber channel, so no
//! GLib main loop is needed.
//!
//! Custom filters and conditions from the process registry cannot be bound
//! into GStreamer elements. Descriptions using `tensor_filter
//! framework=custom-easy` or `tensor_if compared-value=CUSTOM` are refused
//! with `Unsupported`; run them on the loopback engine.

mod node;
mod properties;

pub use node::GstNode;

use crate::engine::{
    Engine, EngineError, EngineMessage, Graph, MessageSender, Node, StateChangeOutcome,
};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use streamctl_types::PipelineState;
use tracing::{debug, error, info, trace, warn};

pub struct GstEngine;

impl GstEngine {
    /// Initialize GStreamer. Safe to call more than once.
    pub fn new() -> Result<Self, EngineError> {
        gst::init().map_err(|e| {
            EngineError::Unsupported(format!("GStreamer initialization failed: {}", e))
        })?;
        info!("GStreamer {} initialized", gst::version_string());
        Ok(Self)
    }
}

fn map_parse_error(err: glib::Error) -> EngineError {
    let message = err.message().to_string();
    match err.kind::<gst::ParseError>() {
        Some(gst::ParseError::NoSuchElement) => EngineError::NoSuchElement(message),
        Some(gst::ParseError::Link) => EngineError::Link(message),
        _ => EngineError::Parse(message),
    }
}

fn from_gst_state(state: gst::State) -> Option<PipelineState> {
    match state {
        gst::State::Null => Some(PipelineState::Null),
        gst::State::Ready => Some(PipelineState::Ready),
        gst::State::Paused => Some(PipelineState::Paused),
        gst::State::Playing => Some(PipelineState::Playing),
        _ => None,
    }
}

fn to_gst_state(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

/// Translate the bus messages the control layer cares about.
fn translate(msg: &gst::Message, pipeline_name: &str) -> Option<EngineMessage> {
    use gst::MessageView;

    trace!("Bus message type: {:?}", msg.type_());
    match msg.view() {
        MessageView::StateChanged(state_changed) => {
            let source = msg.src()?;
            if source.type_() != gst::Pipeline::static_type()
                || source.name().as_str() != pipeline_name
            {
                return None;
            }
            Some(EngineMessage::StateChanged {
                old: from_gst_state(state_changed.old()).unwrap_or_default(),
                current: from_gst_state(state_changed.current()).unwrap_or_default(),
                pending: from_gst_state(state_changed.pending()),
            })
        }
        MessageView::Eos(_) => Some(EngineMessage::Eos),
        MessageView::Error(err) => {
            let source = err.src().map(|s| s.name().to_string());
            error!(
                "Pipeline error: {} (debug: {:?}, source: {:?})",
                err.error(),
                err.debug(),
                source
            );
            Some(EngineMessage::Error {
                message: err.error().to_string(),
                source,
            })
        }
        MessageView::Warning(w) => {
            let source = w.src().map(|s| s.name().to_string());
            warn!(
                "Pipeline warning: {} (debug: {:?}, source: {:?})",
                w.error(),
                w.debug(),
                source
            );
            Some(EngineMessage::Warning {
                message: w.error().to_string(),
                source,
            })
        }
        _ => None,
    }
}

/// Refuse nodes that would need a callback from the custom registry.
fn reject_custom_callbacks(nodes: &[Arc<GstNode>]) -> Result<(), EngineError> {
    let text = |node: &GstNode, property: &str| {
        node.property(property)
            .map(|value| value.to_string())
            .unwrap_or_default()
    };
    for node in nodes {
        let node: &GstNode = node;
        let custom = match node.factory() {
            "tensor_filter" => text(node, "framework") == "custom-easy",
            "tensor_if" => text(node, "compared-value").eq_ignore_ascii_case("custom"),
            _ => false,
        };
        if custom {
            return Err(EngineError::Unsupported(format!(
                "'{}' needs a registered custom callback, not available on GStreamer",
                node.name()
            )));
        }
    }
    Ok(())
}

impl Engine for GstEngine {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn element_available(&self, factory: &str) -> bool {
        gst::ElementFactory::find(factory).is_some()
    }

    fn build_graph(&self, description: &str) -> Result<Box<dyn Graph>, EngineError> {
        let element = gst::parse::launch(description).map_err(map_parse_error)?;
        let pipeline = match element.downcast::<gst::Pipeline>() {
            Ok(pipeline) => pipeline,
            Err(element) => {
                let pipeline = gst::Pipeline::new();
                pipeline
                    .add(&element)
                    .map_err(|e| EngineError::Link(e.to_string()))?;
                pipeline
            }
        };

        let nodes: Vec<Arc<GstNode>> = pipeline
            .iterate_recurse()
            .into_iter()
            .flatten()
            .map(|element| Arc::new(GstNode::new(element)))
            .collect();
        reject_custom_callbacks(&nodes)?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::StateChange("pipeline has no bus".to_string()))?;
        let sender: Arc<Mutex<Option<MessageSender>>> = Arc::new(Mutex::new(None));
        let handler_sender = sender.clone();
        let pipeline_name = pipeline.name().to_string();
        bus.set_sync_handler(move |_bus, msg| {
            if let Some(message) = translate(msg, &pipeline_name) {
                if let Some(tx) = handler_sender.lock().as_ref() {
                    let _ = tx.send(message);
                }
            }
            gst::BusSyncReply::Drop
        });

        debug!(
            "Built GStreamer pipeline '{}' with {} elements",
            pipeline.name(),
            nodes.len()
        );

        Ok(Box::new(GstGraph {
            pipeline,
            nodes,
            sender,
        }))
    }
}

pub struct GstGraph {
    pipeline: gst::Pipeline,
    nodes: Vec<Arc<GstNode>>,
    sender: Arc<Mutex<Option<MessageSender>>>,
}

impl GstGraph {
    fn post(&self, message: EngineMessage) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(message);
        }
    }
}

impl Graph for GstGraph {
    fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn Node>)
            .collect()
    }

    fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .map(|n| n.clone() as Arc<dyn Node>)
    }

    fn request_state(&self, target: PipelineState) -> Result<StateChangeOutcome, EngineError> {
        let before = self.pipeline.current_state();
        let outcome = self
            .pipeline
            .set_state(to_gst_state(target))
            .map_err(|_| {
                EngineError::StateChange(format!("failed to change state to {}", target))
            })?;

        // The bus is flushing during READY -> NULL, so that step is never
        // posted by GStreamer itself
        if target == PipelineState::Null && before != gst::State::Null {
            self.post(EngineMessage::StateChanged {
                old: PipelineState::Ready,
                current: PipelineState::Null,
                pending: None,
            });
        }

        Ok(match outcome {
            gst::StateChangeSuccess::Success => StateChangeOutcome::Success,
            gst::StateChangeSuccess::Async => StateChangeOutcome::Async,
            gst::StateChangeSuccess::NoPreroll => StateChangeOutcome::NoPreroll,
        })
    }

    fn current_state(&self) -> PipelineState {
        from_gst_state(self.pipeline.current_state()).unwrap_or_default()
    }

    fn subscribe_messages(&self, sender: MessageSender) -> Result<(), EngineError> {
        *self.sender.lock() = Some(sender);
        Ok(())
    }

    fn unsubscribe_messages(&self) {
        self.sender.lock().take();
    }

    fn flush(&self) -> Result<(), EngineError> {
        let started = self.pipeline.send_event(gst::event::FlushStart::new());
        let stopped = self.pipeline.send_event(gst::event::FlushStop::new(true));
        if !(started && stopped) {
            debug!("Flush events were not handled by every source");
        }
        Ok(())
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline '{}': {:?}", self.pipeline.name(), e);
        }
        if let Some(bus) = self.pipeline.bus() {
            bus.unset_sync_handler();
        }
    }
}
