//! Nodes of a loopback graph.

use super::GraphCore;
use crate::custom::{ConditionLease, FilterLease};
use crate::engine::{
    EngineBuffer, EngineError, FeedEvent, Node, NodeHooks, PushMode,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use streamctl_types::{PropertyValue, StreamCaps, TensorsData};
use tracing::{trace, warn};

/// Default capacity of an `appsrc` input queue, in buffers.
pub(super) const DEFAULT_MAX_BUFFERS: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropKind {
    Bool,
    UInt,
    Str,
}

/// Element factories the loopback engine can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Factory {
    AppSrc,
    AppSink,
    TensorSink,
    FakeSink,
    Valve,
    InputSelector,
    OutputSelector,
    Queue,
    Identity,
    CapsFilter,
    Tee,
    TensorFilter,
    TensorIf,
}

impl Factory {
    pub(super) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "appsrc" => Self::AppSrc,
            "appsink" => Self::AppSink,
            "tensor_sink" => Self::TensorSink,
            "fakesink" => Self::FakeSink,
            "valve" => Self::Valve,
            "input-selector" => Self::InputSelector,
            "output-selector" => Self::OutputSelector,
            "queue" => Self::Queue,
            "identity" => Self::Identity,
            "capsfilter" => Self::CapsFilter,
            "tee" => Self::Tee,
            "tensor_filter" => Self::TensorFilter,
            "tensor_if" => Self::TensorIf,
            _ => return None,
        })
    }

    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::AppSrc => "appsrc",
            Self::AppSink => "appsink",
            Self::TensorSink => "tensor_sink",
            Self::FakeSink => "fakesink",
            Self::Valve => "valve",
            Self::InputSelector => "input-selector",
            Self::OutputSelector => "output-selector",
            Self::Queue => "queue",
            Self::Identity => "identity",
            Self::CapsFilter => "capsfilter",
            Self::Tee => "tee",
            Self::TensorFilter => "tensor_filter",
            Self::TensorIf => "tensor_if",
        }
    }

    pub(super) fn is_sink(self) -> bool {
        matches!(self, Self::AppSink | Self::TensorSink | Self::FakeSink)
    }

    pub(super) fn has_sink_pad(self) -> bool {
        self != Self::AppSrc
    }

    pub(super) fn has_src_pad(self) -> bool {
        !self.is_sink()
    }

    /// Nodes whose source pads are requested as `src_%u`.
    pub(super) fn has_request_src_pads(self) -> bool {
        matches!(self, Self::Tee | Self::OutputSelector | Self::TensorIf)
    }

    /// Nodes whose sink pads are requested as `sink_%u`.
    pub(super) fn has_request_sink_pads(self) -> bool {
        self == Self::InputSelector
    }

    fn properties(self) -> &'static [(&'static str, PropKind)] {
        use PropKind::*;
        match self {
            Self::AppSrc => &[
                ("caps", Str),
                ("max-buffers", UInt),
                ("is-live", Bool),
                ("format", Str),
            ],
            Self::AppSink => &[
                ("caps", Str),
                ("emit-signals", Bool),
                ("sync", Bool),
                ("async", Bool),
                ("max-buffers", UInt),
                ("drop", Bool),
            ],
            Self::TensorSink => &[("emit-signal", Bool), ("signal-rate", UInt), ("sync", Bool)],
            Self::FakeSink => &[("sync", Bool), ("async", Bool), ("silent", Bool)],
            Self::Valve => &[("drop", Bool)],
            Self::InputSelector => &[("active-pad", Str), ("sync-streams", Bool)],
            Self::OutputSelector => &[("active-pad", Str), ("pad-negotiation-mode", Str)],
            Self::Queue => &[("max-size-buffers", UInt), ("leaky", Str)],
            Self::Identity => &[("silent", Bool)],
            Self::CapsFilter => &[("caps", Str)],
            Self::Tee => &[("allow-not-linked", Bool)],
            Self::TensorFilter => &[("framework", Str), ("model", Str)],
            Self::TensorIf => &[
                ("compared-value", Str),
                ("compared-value-option", Str),
                ("then", Str),
                ("else", Str),
            ],
        }
    }

    fn defaults(self) -> Vec<(&'static str, PropertyValue)> {
        match self {
            Self::AppSrc => vec![
                ("max-buffers", PropertyValue::UInt(DEFAULT_MAX_BUFFERS)),
                ("is-live", PropertyValue::Bool(false)),
            ],
            Self::Valve => vec![("drop", PropertyValue::Bool(false))],
            _ => Vec::new(),
        }
    }
}

fn convert(
    node: &str,
    property: &str,
    kind: PropKind,
    value: &PropertyValue,
) -> Result<PropertyValue, EngineError> {
    let invalid = |reason: &str| EngineError::InvalidProperty {
        node: node.to_string(),
        property: property.to_string(),
        reason: reason.to_string(),
    };
    match kind {
        PropKind::Bool => value
            .as_bool()
            .map(PropertyValue::Bool)
            .ok_or_else(|| invalid("expected a boolean")),
        PropKind::UInt => value
            .as_u64()
            .map(PropertyValue::UInt)
            .ok_or_else(|| invalid("expected an unsigned integer")),
        PropKind::Str => Ok(PropertyValue::String(value.to_string())),
    }
}

/// A unit travelling between nodes.
#[derive(Debug, Clone)]
pub(super) enum Flow {
    Buffer(EngineBuffer),
    Eos,
}

/// Input queue of an `appsrc`, drained by its streaming thread.
#[derive(Default)]
pub(super) struct SourceQueue {
    pub items: VecDeque<Flow>,
    pub playing: bool,
    pub shutdown: bool,
    pub eos_queued: bool,
    /// `need-data` was raised and no buffer arrived since
    pub starving: bool,
}

pub(super) struct Source {
    pub queue: Mutex<SourceQueue>,
    pub changed: Condvar,
}

/// User code bound into the node by the custom registry.
pub(super) enum Custom {
    None,
    Filter(FilterLease),
    Condition(ConditionLease),
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct OutLink {
    pub src_pad: String,
    pub to: usize,
    pub sink_pad: String,
}

pub struct LoopbackNode {
    name: String,
    pub(super) factory: Factory,
    properties: Mutex<BTreeMap<String, PropertyValue>>,
    pub(super) caps: RwLock<Option<StreamCaps>>,
    hooks: RwLock<Option<Arc<NodeHooks>>>,
    pub(super) source: Option<Source>,
    pub(super) custom: Custom,
    /// Request pads in link order
    pub(super) sink_pads: Vec<String>,
    pub(super) src_pads: Vec<String>,
    pub(super) outgoing: Vec<OutLink>,
    /// Sink pads (input-selector) or the node itself (sinks) that saw EOS
    pub(super) eos_pads: Mutex<Vec<String>>,
}

impl std::fmt::Debug for LoopbackNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNode")
            .field("name", &self.name)
            .field("factory", &self.factory)
            .finish()
    }
}

impl LoopbackNode {
    pub(super) fn new(
        name: String,
        factory: Factory,
        properties: &[(String, String)],
        custom: Custom,
    ) -> Result<Self, EngineError> {
        let node = Self {
            name,
            factory,
            properties: Mutex::new(
                factory
                    .defaults()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            ),
            caps: RwLock::new(None),
            hooks: RwLock::new(None),
            source: (factory == Factory::AppSrc).then(|| Source {
                queue: Mutex::new(SourceQueue::default()),
                changed: Condvar::new(),
            }),
            custom,
            sink_pads: Vec::new(),
            src_pads: Vec::new(),
            outgoing: Vec::new(),
            eos_pads: Mutex::new(Vec::new()),
        };
        for (key, value) in properties {
            node.store_property(key, &PropertyValue::parse(value))?;
        }
        Ok(node)
    }

    fn lookup_kind(&self, property: &str) -> Result<PropKind, EngineError> {
        self.factory
            .properties()
            .iter()
            .find(|(name, _)| *name == property)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| EngineError::UnknownProperty {
                node: self.name.clone(),
                property: property.to_string(),
            })
    }

    fn store_property(&self, property: &str, value: &PropertyValue) -> Result<(), EngineError> {
        let kind = self.lookup_kind(property)?;
        let value = convert(&self.name, property, kind, value)?;
        if property == "caps" {
            let caps = StreamCaps::parse(&value.to_string())?;
            *self.caps.write() = Some(caps);
        }
        self.properties.lock().insert(property.to_string(), value);
        Ok(())
    }

    pub(super) fn string_property(&self, property: &str) -> Option<String> {
        self.properties
            .lock()
            .get(property)
            .map(PropertyValue::to_string)
    }

    fn bool_property(&self, property: &str) -> bool {
        self.properties
            .lock()
            .get(property)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    fn max_buffers(&self) -> usize {
        self.properties
            .lock()
            .get("max-buffers")
            .and_then(PropertyValue::as_u64)
            .map_or(DEFAULT_MAX_BUFFERS as usize, |v| v.max(1) as usize)
    }

    /// Pads a selector chooses between.
    fn branch_pads(&self) -> &[String] {
        match self.factory {
            Factory::InputSelector => &self.sink_pads,
            Factory::OutputSelector => &self.src_pads,
            _ => &[],
        }
    }

    pub(super) fn active_branch(&self) -> Option<String> {
        self.string_property("active-pad")
            .or_else(|| self.branch_pads().first().cloned())
    }

    pub(super) fn is_dropping(&self) -> bool {
        self.factory == Factory::Valve && self.bool_property("drop")
    }

    pub(super) fn fire_feed(&self, event: FeedEvent) {
        let hooks = self.hooks.read().clone();
        if let Some(on_feed) = hooks.as_ref().and_then(|h| h.on_feed.as_ref()) {
            on_feed(event);
        }
    }

    pub(super) fn fire_buffer(&self, buffer: EngineBuffer) {
        let hooks = self.hooks.read().clone();
        match hooks.as_ref().and_then(|h| h.on_buffer.as_ref()) {
            Some(on_buffer) => on_buffer(buffer),
            None => trace!("{}: no buffer hook, dropping buffer", self.name),
        }
    }

    /// Run the bound custom filter or condition on `buffer`.
    pub(super) fn run_filter(&self, buffer: EngineBuffer) -> anyhow::Result<EngineBuffer> {
        let data = TensorsData {
            tensors: buffer.memories,
            info: buffer.info,
        };
        match &self.custom {
            Custom::Filter(lease) => {
                let out = lease.invoke(&data)?;
                let info = if lease.filter().out_info().is_flexible() {
                    out.info
                } else {
                    None
                };
                Ok(EngineBuffer {
                    memories: out.tensors,
                    info,
                })
            }
            _ => Ok(EngineBuffer {
                memories: data.tensors,
                info: data.info,
            }),
        }
    }

    pub(super) fn evaluate(&self, buffer: &EngineBuffer) -> anyhow::Result<bool> {
        match &self.custom {
            Custom::Condition(lease) => lease.invoke(&TensorsData {
                tensors: buffer.memories.clone(),
                info: buffer.info.clone(),
            }),
            _ => Ok(true),
        }
    }

    /// Flag the node as having seen EOS on `pad`. Returns true when EOS
    /// should travel further downstream.
    pub(super) fn mark_eos(&self, pad: &str) -> bool {
        let mut seen = self.eos_pads.lock();
        if !seen.iter().any(|p| p == pad) {
            seen.push(pad.to_string());
        }
        match self.factory {
            Factory::InputSelector => self.sink_pads.iter().all(|p| seen.contains(p)),
            _ => true,
        }
    }

    pub(super) fn reset_eos(&self) {
        self.eos_pads.lock().clear();
        if let Some(source) = &self.source {
            source.queue.lock().eos_queued = false;
        }
    }

    /// Drop queued buffers of an application source.
    pub(super) fn clear_queue(&self) {
        if let Some(source) = &self.source {
            let mut queue = source.queue.lock();
            queue.items.clear();
            queue.starving = false;
            source.changed.notify_all();
        }
    }

    pub(super) fn set_playing(&self, playing: bool) {
        if let Some(source) = &self.source {
            source.queue.lock().playing = playing;
            source.changed.notify_all();
        }
    }

    pub(super) fn shutdown(&self) {
        if let Some(source) = &self.source {
            source.queue.lock().shutdown = true;
            source.changed.notify_all();
        }
    }

    fn source(&self) -> Result<&Source, EngineError> {
        self.source.as_ref().ok_or_else(|| {
            EngineError::Unsupported(format!("{} is not an application source", self.name))
        })
    }
}

impl Node for LoopbackNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory(&self) -> &str {
        self.factory.as_str()
    }

    fn caps(&self) -> Option<StreamCaps> {
        self.caps.read().clone()
    }

    fn connect(&self, hooks: NodeHooks) {
        *self.hooks.write() = Some(Arc::new(hooks));
    }

    fn disconnect(&self) {
        self.hooks.write().take();
    }

    fn push_buffer(&self, buffer: EngineBuffer, mode: PushMode) -> Result<(), EngineError> {
        let source = self.source()?;
        let max = self.max_buffers();

        let mut queue = source.queue.lock();
        loop {
            if queue.shutdown {
                return Err(EngineError::Shutdown);
            }
            if queue.eos_queued {
                return Err(EngineError::Flow {
                    node: self.name.clone(),
                    reason: "end of stream was already signalled".to_string(),
                });
            }
            if queue.items.len() < max {
                break;
            }
            match mode {
                PushMode::FailFast => {
                    drop(queue);
                    self.fire_feed(FeedEvent::EnoughData);
                    return Err(EngineError::QueueFull(self.name.clone()));
                }
                PushMode::Block => source.changed.wait(&mut queue),
            }
        }
        queue.items.push_back(Flow::Buffer(buffer));
        queue.starving = false;
        let full = queue.items.len() >= max;
        source.changed.notify_all();
        drop(queue);

        if full {
            self.fire_feed(FeedEvent::EnoughData);
        }
        Ok(())
    }

    fn end_of_stream(&self) -> Result<(), EngineError> {
        let source = self.source()?;
        let mut queue = source.queue.lock();
        if queue.shutdown {
            return Err(EngineError::Shutdown);
        }
        if !queue.eos_queued {
            queue.eos_queued = true;
            queue.items.push_back(Flow::Eos);
            source.changed.notify_all();
        }
        Ok(())
    }

    fn set_valve_open(&self, open: bool) -> Result<(), EngineError> {
        if self.factory != Factory::Valve {
            return Err(EngineError::Unsupported(format!("{} is not a valve", self.name)));
        }
        self.store_property("drop", &PropertyValue::Bool(!open))
    }

    fn is_valve_open(&self) -> Result<bool, EngineError> {
        if self.factory != Factory::Valve {
            return Err(EngineError::Unsupported(format!("{} is not a valve", self.name)));
        }
        Ok(!self.is_dropping())
    }

    fn pads(&self) -> Vec<String> {
        self.branch_pads().to_vec()
    }

    fn active_pad(&self) -> Option<String> {
        match self.factory {
            Factory::InputSelector | Factory::OutputSelector => self.active_branch(),
            _ => None,
        }
    }

    fn select_pad(&self, pad: &str) -> Result<(), EngineError> {
        if !matches!(
            self.factory,
            Factory::InputSelector | Factory::OutputSelector
        ) {
            return Err(EngineError::Unsupported(format!(
                "{} is not a stream switch",
                self.name
            )));
        }
        if !self.branch_pads().iter().any(|p| p == pad) {
            return Err(EngineError::UnknownPad {
                node: self.name.clone(),
                pad: pad.to_string(),
            });
        }
        self.properties
            .lock()
            .insert("active-pad".to_string(), PropertyValue::String(pad.to_string()));
        Ok(())
    }

    fn set_property(&self, property: &str, value: &PropertyValue) -> Result<(), EngineError> {
        match property {
            "name" => Err(EngineError::InvalidProperty {
                node: self.name.clone(),
                property: property.to_string(),
                reason: "property is read-only".to_string(),
            }),
            "active-pad"
                if matches!(
                    self.factory,
                    Factory::InputSelector | Factory::OutputSelector
                ) =>
            {
                self.select_pad(&value.to_string())
            }
            _ => self.store_property(property, value),
        }
    }

    fn property(&self, property: &str) -> Result<PropertyValue, EngineError> {
        if property == "name" {
            return Ok(PropertyValue::String(self.name.clone()));
        }
        self.lookup_kind(property)?;
        if property == "active-pad" {
            if let Some(pad) = self.active_branch() {
                return Ok(PropertyValue::String(pad));
            }
        }
        self.properties.lock().get(property).cloned().ok_or_else(|| {
            EngineError::InvalidProperty {
                node: self.name.clone(),
                property: property.to_string(),
                reason: "property has no value".to_string(),
            }
        })
    }
}

/// Body of the streaming thread of the `appsrc` at `index`.
pub(super) fn stream_source(core: Arc<GraphCore>, index: usize) {
    let node = core.nodes[index].clone();
    let Some(source) = &node.source else {
        return;
    };

    loop {
        let item = {
            let mut queue = source.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if queue.playing {
                    if let Some(item) = queue.items.pop_front() {
                        source.changed.notify_all();
                        break Some(item);
                    }
                    if !queue.starving {
                        queue.starving = true;
                        break None;
                    }
                }
                source.changed.wait(&mut queue);
            }
        };

        match item {
            Some(item) => core.forward(index, item),
            None => node.fire_feed(FeedEvent::NeedData(0)),
        }
    }
}

pub(super) fn log_custom_failure(node: &LoopbackNode, err: &anyhow::Error) {
    warn!("Custom code of {} failed, buffer dropped: {:#}", node.name, err);
}
