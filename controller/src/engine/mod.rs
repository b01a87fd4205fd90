//! The streaming engine seam.
//!
//! The control layer never moves buffers itself. It builds a graph through
//! an [`Engine`], drives it through the [`Graph`] and [`Node`] traits and
//! listens to the [`EngineMessage`]s the graph posts. Two engines ship with
//! the crate: GStreamer (feature `gstreamer`) and an in-process loopback
//! engine.

#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod loopback;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use streamctl_types::{CapsError, PipelineState, PropertyValue, StreamCaps, TensorsInfo};
use thiserror::Error;

pub use loopback::LoopbackEngine;

/// Sender half of the channel a graph posts its messages to.
pub type MessageSender = crossbeam_channel::Sender<EngineMessage>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to parse graph description: {0}")]
    Parse(String),

    #[error("No such element factory: {0}")]
    NoSuchElement(String),

    #[error("Failed to link elements: {0}")]
    Link(String),

    #[error("State change failed: {0}")]
    StateChange(String),

    #[error("Input queue of {0} is full")]
    QueueFull(String),

    #[error("Data flow error on {node}: {reason}")]
    Flow { node: String, reason: String },

    #[error("Element {node} has no property {property}")]
    UnknownProperty { node: String, property: String },

    #[error("Invalid property value for {node}.{property}: {reason}")]
    InvalidProperty {
        node: String,
        property: String,
        reason: String,
    },

    #[error("Element {node} has no pad {pad}")]
    UnknownPad { node: String, pad: String },

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Caps error: {0}")]
    Caps(#[from] CapsError),

    #[error("Graph is shutting down")]
    Shutdown,
}

/// What to do when the input queue of a source is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushMode {
    /// Wait until the queue has room
    #[default]
    Block,
    /// Fail with a retryable error
    FailFast,
}

/// Result of a successful state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeOutcome {
    /// The graph reached the target before the request returned
    Success,
    /// The transition continues in the background
    Async,
    /// Live graph, the target was reached without prerolling
    NoPreroll,
}

/// Messages posted asynchronously by a running graph.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// The graph itself (not one of its nodes) changed state
    StateChanged {
        old: PipelineState,
        current: PipelineState,
        pending: Option<PipelineState>,
    },
    Eos,
    Error {
        message: String,
        source: Option<String>,
    },
    Warning {
        message: String,
        source: Option<String>,
    },
}

/// One buffer crossing the seam, one memory chunk per tensor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineBuffer {
    pub memories: Vec<Vec<u8>>,
    /// Metadata travelling with the buffer (flexible streams)
    pub info: Option<TensorsInfo>,
}

impl EngineBuffer {
    pub fn size(&self) -> usize {
        self.memories.iter().map(Vec::len).sum()
    }
}

/// Flow-control notifications raised by an application source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// The source wants more data; the hint is in bytes, 0 when unknown
    NeedData(u32),
    /// The input queue is full
    EnoughData,
    /// The source was asked to continue from another offset
    SeekData(u64),
}

/// Callback invoked on an engine streaming thread for every buffer reaching
/// a sink node.
pub type BufferHook = Box<dyn Fn(EngineBuffer) + Send + Sync>;

/// Callback invoked on an engine thread for feed events of a source node.
pub type FeedHook = Box<dyn Fn(FeedEvent) + Send + Sync>;

/// Hooks connecting a node to the control layer's dispatchers.
#[derive(Default)]
pub struct NodeHooks {
    pub on_buffer: Option<BufferHook>,
    pub on_feed: Option<FeedHook>,
}

/// A streaming engine able to build graphs from textual descriptions.
pub trait Engine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    /// Whether the host can create elements of `factory`.
    fn element_available(&self, factory: &str) -> bool;

    /// Parse `description` and build a stopped graph.
    fn build_graph(&self, description: &str) -> Result<Box<dyn Graph>, EngineError>;
}

/// A built graph, exclusively owned by one pipeline.
pub trait Graph: Send + Sync {
    /// Every named node of the graph.
    fn nodes(&self) -> Vec<Arc<dyn Node>>;

    fn node(&self, name: &str) -> Option<Arc<dyn Node>>;

    /// Ask the graph to move towards `target`.
    fn request_state(&self, target: PipelineState) -> Result<StateChangeOutcome, EngineError>;

    /// State the engine currently reports, which may lag a pending request.
    fn current_state(&self) -> PipelineState;

    /// Start posting messages to `sender`. Only one subscriber is kept.
    fn subscribe_messages(&self, sender: MessageSender) -> Result<(), EngineError>;

    /// Stop posting messages. Messages already posted stay in the channel.
    fn unsubscribe_messages(&self);

    /// Drop every buffer queued or in flight inside the graph.
    fn flush(&self) -> Result<(), EngineError>;
}

/// One node of a built graph.
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Factory that created the node (`appsrc`, `valve`, ...).
    fn factory(&self) -> &str;

    /// Negotiated or configured format on the node's data pad.
    fn caps(&self) -> Option<StreamCaps>;

    /// Install the dispatch hooks, replacing earlier ones.
    fn connect(&self, hooks: NodeHooks);

    /// Remove the dispatch hooks. No hook starts after this returns.
    fn disconnect(&self);

    /// Hand a buffer to the node's input queue (application sources).
    fn push_buffer(&self, buffer: EngineBuffer, mode: PushMode) -> Result<(), EngineError>;

    /// Signal end of stream on an application source.
    fn end_of_stream(&self) -> Result<(), EngineError>;

    fn set_valve_open(&self, open: bool) -> Result<(), EngineError>;

    fn is_valve_open(&self) -> Result<bool, EngineError>;

    /// Branch pads a switch can select between.
    fn pads(&self) -> Vec<String>;

    fn active_pad(&self) -> Option<String>;

    fn select_pad(&self, pad: &str) -> Result<(), EngineError>;

    fn set_property(&self, property: &str, value: &PropertyValue) -> Result<(), EngineError>;

    fn property(&self, property: &str) -> Result<PropertyValue, EngineError>;
}

/// Engine implementations selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Gstreamer,
    Loopback,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Gstreamer => write!(f, "gstreamer"),
            EngineKind::Loopback => write!(f, "loopback"),
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gstreamer" | "gst" => Ok(EngineKind::Gstreamer),
            "loopback" => Ok(EngineKind::Loopback),
            other => Err(format!("unknown engine '{}'", other)),
        }
    }
}

/// Create the engine selected by `kind`.
pub fn create_engine(kind: EngineKind) -> Result<Arc<dyn Engine>, EngineError> {
    match kind {
        #[cfg(feature = "gstreamer")]
        EngineKind::Gstreamer => Ok(Arc::new(gst::GstEngine::new()?)),
        #[cfg(not(feature = "gstreamer"))]
        EngineKind::Gstreamer => Err(EngineError::Unsupported(
            "built without the gstreamer feature".to_string(),
        )),
        EngineKind::Loopback => Ok(Arc::new(LoopbackEngine::new())),
    }
}
