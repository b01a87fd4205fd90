//! Element handles: the controllable nodes of a pipeline.
//!
//! Each handle caches the tensor metadata negotiated on its node and owns
//! the client registrations attached to it. Its mutex guards only that
//! element, so operations on different elements never contend.

mod client;

pub use client::{ClientHandle, SinkCallback, SourceCallbacks};

use crate::engine::{EngineBuffer, FeedEvent, Node, NodeHooks};
use crate::error::{PipelineError, Result};
use crate::pipeline::{DispatchGate, PipelineInner};
use client::{Callback, ClientSlot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use streamctl_types::{
    ElementKind, PropertyValue, StreamCaps, TensorsData, TensorsInfo, TENSOR_SIZE_LIMIT,
};
use tracing::{debug, error, info, trace};

/// What a caller intends to do with an element looked up through
/// [`Pipeline::get_element_as`](crate::Pipeline::get_element_as).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Sink,
    Source,
    Valve,
    Switch,
    Any,
}

impl Capability {
    pub fn supported_by(self, kind: ElementKind) -> bool {
        match self {
            Capability::Sink => kind.is_sink(),
            Capability::Source => kind.is_source(),
            Capability::Valve => kind == ElementKind::Valve,
            Capability::Switch => kind.is_switch(),
            Capability::Any => true,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Sink => write!(f, "sink"),
            Capability::Source => write!(f, "source"),
            Capability::Valve => write!(f, "valve"),
            Capability::Switch => write!(f, "switch"),
            Capability::Any => write!(f, "element"),
        }
    }
}

type DestroyHook = Box<dyn FnOnce() + Send>;

struct ElementState {
    tensors_info: Option<TensorsInfo>,
    /// Metadata of the last buffer pushed on a flexible stream
    provided_info: Option<TensorsInfo>,
    /// Bytes of one buffer, 0 when unknown or flexible
    size: usize,
    is_media: bool,
    is_flexible: bool,
    caps_resolved: bool,
    clients: BTreeMap<u32, Arc<ClientSlot>>,
    /// `None` once every id was handed out
    next_id: Option<u32>,
    custom_destroy: Option<DestroyHook>,
    released: bool,
}

pub(crate) struct ElementInner {
    name: String,
    kind: ElementKind,
    node: Arc<dyn Node>,
    gate: Arc<DispatchGate>,
    state: Mutex<ElementState>,
}

impl ElementInner {
    /// Build the handle of `node` and connect its dispatch hooks.
    pub(crate) fn create(
        node: Arc<dyn Node>,
        kind: ElementKind,
        gate: Arc<DispatchGate>,
    ) -> Arc<Self> {
        let element = Arc::new(Self {
            name: node.name().to_string(),
            kind,
            node,
            gate,
            state: Mutex::new(ElementState {
                tensors_info: None,
                provided_info: None,
                size: 0,
                is_media: false,
                is_flexible: false,
                caps_resolved: false,
                clients: BTreeMap::new(),
                next_id: Some(0),
                custom_destroy: None,
                released: false,
            }),
        });

        let mut hooks = NodeHooks::default();
        if kind.is_sink() {
            let weak = Arc::downgrade(&element);
            hooks.on_buffer = Some(Box::new(move |buffer| {
                if let Some(element) = weak.upgrade() {
                    element.dispatch_buffer(buffer);
                }
            }));
        }
        if kind.is_source() {
            let weak: Weak<ElementInner> = Arc::downgrade(&element);
            hooks.on_feed = Some(Box::new(move |event| {
                if let Some(element) = weak.upgrade() {
                    element.dispatch_feed(event);
                }
            }));
        }
        if hooks.on_buffer.is_some() || hooks.on_feed.is_some() {
            element.node.connect(hooks);
        }
        element
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    fn start_ids_at(&self, next: u32) {
        self.state.lock().next_id = Some(next);
    }

    /// Fill the metadata cache from the node's caps once they are known.
    fn resolve_caps(&self, state: &mut ElementState) {
        if state.caps_resolved {
            return;
        }
        match self.node.caps() {
            Some(StreamCaps::Tensors(info)) => {
                state.is_flexible = info.is_flexible();
                state.size = if state.is_flexible {
                    0
                } else {
                    info.total_size().unwrap_or_default()
                };
                debug!(
                    "'{}' negotiated {} ({} bytes per buffer)",
                    self.name,
                    info.to_caps_string(),
                    state.size
                );
                state.tensors_info = Some(info);
                state.caps_resolved = true;
            }
            Some(StreamCaps::Media { mime }) => {
                debug!("'{}' carries media stream {}", self.name, mime);
                state.is_media = true;
                state.caps_resolved = true;
            }
            None => {}
        }
    }

    /// Clients to invoke for one event, in registration order.
    fn snapshot(&self) -> Option<(Vec<Arc<ClientSlot>>, Option<TensorsInfo>)> {
        let mut state = self.state.lock();
        if state.released || state.clients.is_empty() {
            return None;
        }
        self.resolve_caps(&mut state);
        let info = state
            .provided_info
            .clone()
            .or_else(|| state.tensors_info.clone());
        Some((state.clients.values().cloned().collect(), info))
    }

    fn dispatch_buffer(&self, buffer: EngineBuffer) {
        let Some(_guard) = self.gate.enter() else {
            return;
        };
        let Some((slots, cached)) = self.snapshot() else {
            return;
        };
        let data = TensorsData {
            tensors: buffer.memories,
            info: buffer.info.or(cached),
        };
        trace!(
            "Dispatching {} bytes from '{}' to {} clients",
            data.total_size(),
            self.name,
            slots.len()
        );
        for slot in slots {
            slot.invoke(&self.name, |callback| match callback {
                Callback::Sink(f) => f(&data),
                Callback::Source(_) => Ok(()),
            });
        }
    }

    fn dispatch_feed(&self, event: FeedEvent) {
        let Some(_guard) = self.gate.enter() else {
            return;
        };
        let Some((slots, _)) = self.snapshot() else {
            return;
        };
        trace!("Feed event {:?} on '{}'", event, self.name);
        for slot in slots {
            slot.invoke(&self.name, |callback| match callback {
                Callback::Source(callbacks) => match event {
                    FeedEvent::NeedData(hint) => callbacks.on_need_data(hint),
                    FeedEvent::EnoughData => callbacks.on_enough_data(),
                    FeedEvent::SeekData(offset) => callbacks.on_seek_data(offset),
                },
                Callback::Sink(_) => Ok(()),
            });
        }
    }

    fn attach(self: &Arc<Self>, callback: Callback) -> Result<ClientHandle> {
        let slot = {
            let mut state = self.state.lock();
            if state.released {
                return Err(PipelineError::NotFound(format!(
                    "'{}' was released",
                    self.name
                )));
            }
            let id = state.next_id.ok_or_else(|| {
                PipelineError::Resource(format!("client ids of '{}' are exhausted", self.name))
            })?;
            state.next_id = id.checked_add(1);
            let slot = Arc::new(ClientSlot::new(id, callback));
            state.clients.insert(id, slot.clone());
            slot
        };
        debug!("Attached client {} to '{}'", slot.id(), self.name);
        Ok(ClientHandle::new(slot, self))
    }

    pub(crate) fn remove_client(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.released {
            return Err(PipelineError::NotFound(format!(
                "'{}' was released",
                self.name
            )));
        }
        state
            .clients
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| PipelineError::NotFound(format!("client {} of '{}'", id, self.name)))
    }

    /// Check pushed data against the cached metadata and return the
    /// metadata to send along with it.
    fn validate_push(&self, data: &TensorsData) -> Result<Option<TensorsInfo>> {
        let mismatch = |reason: String| PipelineError::TypeMismatch {
            element: self.name.clone(),
            reason,
        };

        let mut state = self.state.lock();
        self.resolve_caps(&mut state);
        if state.is_media {
            return Ok(data.info.clone());
        }

        if state.is_flexible {
            let info = match &data.info {
                Some(info) => {
                    if !info.is_valid() || info.len() != data.len() {
                        return Err(PipelineError::InvalidParameter(format!(
                            "metadata pushed to '{}' does not describe the data",
                            self.name
                        )));
                    }
                    info.clone()
                }
                None => state.provided_info.clone().ok_or_else(|| {
                    mismatch("a flexible stream needs metadata with its first buffer".to_string())
                })?,
            };
            state.provided_info = Some(info.clone());
            return Ok(Some(info));
        }

        let Some(expected) = &state.tensors_info else {
            return Ok(data.info.clone());
        };
        if let Some(given) = &data.info {
            if !expected.is_compatible(given) {
                return Err(mismatch(format!(
                    "expected {}, got {}",
                    expected.to_caps_string(),
                    given.to_caps_string()
                )));
            }
        }
        if data.len() != expected.len() {
            return Err(mismatch(format!(
                "expected {} tensors, got {}",
                expected.len(),
                data.len()
            )));
        }
        for (index, tensor) in data.tensors.iter().enumerate() {
            let size = expected.tensor_size(index).unwrap_or_default();
            if tensor.len() != size {
                return Err(mismatch(format!(
                    "tensor {} has {} bytes, expected {}",
                    index,
                    tensor.len(),
                    size
                )));
            }
        }
        Ok(Some(expected.clone()))
    }

    /// Disconnect the node, drop every client and run the custom-destroy
    /// hook. Later calls do nothing.
    pub(crate) fn release(&self) {
        self.node.disconnect();
        let (clients, hook) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            (
                std::mem::take(&mut state.clients),
                state.custom_destroy.take(),
            )
        };
        for slot in clients.values() {
            slot.deactivate();
        }
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                error!("Custom destroy hook of '{}' panicked", self.name);
            }
        }
        debug!("Released element '{}'", self.name);
    }
}

/// Handle to one element of a pipeline.
///
/// Handles stay valid objects after the element or its pipeline went away;
/// operations then fail with `NotFound` or `InvalidState`.
#[derive(Clone)]
pub struct ElementHandle {
    inner: Arc<ElementInner>,
    pipeline: Weak<PipelineInner>,
}

impl ElementHandle {
    pub(crate) fn new(inner: Arc<ElementInner>, pipeline: &Arc<PipelineInner>) -> Self {
        Self {
            inner,
            pipeline: Arc::downgrade(pipeline),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> ElementKind {
        self.inner.kind
    }

    /// The owning pipeline, if it still accepts operations.
    fn pipeline(&self) -> Result<Arc<PipelineInner>> {
        let pipeline = self
            .pipeline
            .upgrade()
            .ok_or_else(|| PipelineError::InvalidState("pipeline was destroyed".to_string()))?;
        pipeline.usable_graph()?;
        if self.inner.state.lock().released {
            return Err(PipelineError::NotFound(format!(
                "'{}' was released",
                self.inner.name
            )));
        }
        Ok(pipeline)
    }

    fn require(&self, supported: bool, operation: &str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(PipelineError::unsupported_kind(
                &self.inner.name,
                self.inner.kind,
                operation,
            ))
        }
    }

    /// Receive every buffer reaching this sink.
    ///
    /// Several callbacks may be attached; for each buffer they run in
    /// attachment order on an engine streaming thread.
    pub fn attach_sink_callback<F>(&self, callback: F) -> Result<ClientHandle>
    where
        F: Fn(&TensorsData) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.require(self.inner.kind.is_sink(), "attach_sink_callback")?;
        self.pipeline()?;
        self.inner.attach(Callback::Sink(Box::new(callback)))
    }

    /// Receive the flow-control events of this application source.
    pub fn attach_source_feed(&self, callbacks: SourceCallbacks) -> Result<ClientHandle> {
        self.require(self.inner.kind.is_source(), "attach_source_feed")?;
        self.pipeline()?;
        self.inner.attach(Callback::Source(callbacks))
    }

    /// Hand one buffer to this application source.
    ///
    /// Needs a PAUSED or PLAYING pipeline. The data must match the
    /// negotiated metadata unless the stream is flexible, in which case
    /// the metadata given with the data is taken as is. A full queue blocks
    /// or fails with `TryAgain`, depending on the pipeline's push mode.
    pub fn push(&self, data: TensorsData) -> Result<()> {
        self.require(self.inner.kind.is_source(), "push")?;
        let pipeline = self.pipeline()?;
        let state = pipeline.usable_graph()?.current_state();
        if !state.accepts_data() {
            return Err(PipelineError::invalid_state(
                state,
                "push needs PAUSED or PLAYING",
            ));
        }
        if data.is_empty() || data.len() > TENSOR_SIZE_LIMIT {
            return Err(PipelineError::InvalidParameter(format!(
                "a buffer holds 1 to {} tensors, got {}",
                TENSOR_SIZE_LIMIT,
                data.len()
            )));
        }
        let info = self.inner.validate_push(&data)?;
        let push_mode = pipeline.push_mode();
        // The graph must not be kept alive by a blocked push
        drop(pipeline);

        let size = data.total_size();
        self.inner.node.push_buffer(
            EngineBuffer {
                memories: data.tensors,
                info,
            },
            push_mode,
        )?;
        trace!("Pushed {} bytes into '{}'", size, self.inner.name);
        Ok(())
    }

    /// Signal end of stream on this application source.
    pub fn end_of_stream(&self) -> Result<()> {
        self.require(self.inner.kind.is_source(), "end_of_stream")?;
        self.pipeline()?;
        self.inner.node.end_of_stream()?;
        debug!("End of stream signalled on '{}'", self.inner.name);
        Ok(())
    }

    /// Let data through (`true`) or drop it (`false`) without stopping the
    /// pipeline.
    pub fn set_valve_open(&self, open: bool) -> Result<()> {
        self.require(self.inner.kind == ElementKind::Valve, "set_valve_open")?;
        self.pipeline()?;
        self.inner.node.set_valve_open(open)?;
        info!(
            "Valve '{}' {}",
            self.inner.name,
            if open { "opened" } else { "closed" }
        );
        Ok(())
    }

    pub fn is_valve_open(&self) -> Result<bool> {
        self.require(self.inner.kind == ElementKind::Valve, "is_valve_open")?;
        self.pipeline()?;
        Ok(self.inner.node.is_valve_open()?)
    }

    /// Route the stream switch through `pad`.
    pub fn switch_select(&self, pad: &str) -> Result<()> {
        self.require(self.inner.kind.is_switch(), "switch_select")?;
        self.pipeline()?;
        self.inner.node.select_pad(pad)?;
        info!("Switch '{}' now uses {}", self.inner.name, pad);
        Ok(())
    }

    /// Branch pads of this stream switch.
    pub fn switch_pads(&self) -> Result<Vec<String>> {
        self.require(self.inner.kind.is_switch(), "switch_pads")?;
        self.pipeline()?;
        Ok(self.inner.node.pads())
    }

    pub fn active_pad(&self) -> Result<Option<String>> {
        self.require(self.inner.kind.is_switch(), "active_pad")?;
        self.pipeline()?;
        Ok(self.inner.node.active_pad())
    }

    pub fn set_property(&self, property: &str, value: impl Into<PropertyValue>) -> Result<()> {
        self.pipeline()?;
        let value = value.into();
        self.inner.node.set_property(property, &value)?;
        debug!("Set {}.{} = {}", self.inner.name, property, value);
        Ok(())
    }

    pub fn property(&self, property: &str) -> Result<PropertyValue> {
        self.pipeline()?;
        Ok(self.inner.node.property(property)?)
    }

    /// Tensor metadata of the element's stream: the negotiated caps, or for
    /// flexible streams the metadata of the last pushed buffer. `None`
    /// while nothing is negotiated or for media streams.
    pub fn tensors_info(&self) -> Result<Option<TensorsInfo>> {
        self.pipeline()?;
        let mut state = self.inner.state.lock();
        self.inner.resolve_caps(&mut state);
        Ok(state
            .provided_info
            .clone()
            .or_else(|| state.tensors_info.clone()))
    }

    /// Whether the element carries raw media rather than tensors.
    pub fn is_media(&self) -> Result<bool> {
        self.pipeline()?;
        let mut state = self.inner.state.lock();
        self.inner.resolve_caps(&mut state);
        Ok(state.is_media)
    }

    /// Byte size of one buffer, when fixed and known.
    pub fn buffer_size(&self) -> Result<Option<usize>> {
        self.pipeline()?;
        let mut state = self.inner.state.lock();
        self.inner.resolve_caps(&mut state);
        Ok((state.size > 0).then_some(state.size))
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    /// Run `hook` once when the element is released, either explicitly or
    /// by pipeline teardown. Replaces an earlier hook.
    pub fn set_custom_destroy<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pipeline()?;
        self.inner.state.lock().custom_destroy = Some(Box::new(hook));
        Ok(())
    }
}

impl std::fmt::Debug for ElementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementHandle")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .finish()
    }
}
