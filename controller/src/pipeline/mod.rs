//! Pipeline registry: owns the engine graph, the named element table, the
//! held resources and the lifecycle state.
//!
//! A [`Pipeline`] is a cheap clonable handle. The registry is torn down by
//! [`Pipeline::destroy`] or when the last handle is dropped.

mod bus;
mod construction;
mod events;
mod gate;
mod lifecycle;
pub mod resources;
mod state;

pub use construction::{check_element_availability, PipelineBuilder};
pub use events::EventBroadcaster;
pub use resources::{ExclusiveArbiter, ResourceArbiter, ResourceHandle};
pub use state::GraphLease;

pub(crate) use gate::DispatchGate;

use crate::element::ElementInner;
use crate::engine::{Graph, PushMode};
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use streamctl_types::{PipelineEvent, PipelineId, PipelineState};

/// Callback receiving every notification of a pipeline on its bus listener
/// thread. Errors and panics are logged and otherwise ignored.
pub type StateSubscriber = dyn Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync;

/// Tunables applied to every pipeline built with them.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Behaviour of `push` when a source queue is full
    pub push_mode: PushMode,
    /// Bound for the synchronous waits done by construction and teardown
    pub state_timeout: Duration,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            push_mode: PushMode::Block,
            state_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

/// Mutable registry fields, all guarded by the pipeline mutex.
struct Shared {
    state: PipelineState,
    /// Target of the last request not yet confirmed by the engine
    pending: Option<PipelineState>,
    is_eos: bool,
    /// Set once READY or NULL is reached; the next PLAYING clears EOS
    eos_rearm: bool,
    fault: Option<String>,
    destroyed: bool,
    elements: HashMap<String, Arc<ElementInner>>,
    resources: HashMap<String, Box<dyn ResourceHandle>>,
    subscriber: Option<Arc<StateSubscriber>>,
}

pub(crate) struct PipelineInner {
    id: PipelineId,
    description: String,
    options: PipelineOptions,
    shared: Mutex<Shared>,
    /// Signalled whenever the bus listener updated `shared`
    changed: Condvar,
    graph: RwLock<Option<Arc<dyn Graph>>>,
    gate: Arc<DispatchGate>,
    events: EventBroadcaster,
    listener: Mutex<Option<bus::BusListener>>,
}

impl PipelineInner {
    /// Fail unless the pipeline accepts operations.
    fn check_usable(&self) -> Result<()> {
        let shared = self.shared.lock();
        if shared.destroyed {
            return Err(PipelineError::InvalidState(
                "pipeline was destroyed".to_string(),
            ));
        }
        if let Some(fault) = &shared.fault {
            return Err(PipelineError::ErrorState(fault.clone()));
        }
        Ok(())
    }

    /// The graph of a usable pipeline.
    pub(crate) fn usable_graph(&self) -> Result<Arc<dyn Graph>> {
        self.check_usable()?;
        self.graph
            .read()
            .clone()
            .ok_or_else(|| PipelineError::InvalidState("pipeline was destroyed".to_string()))
    }

    pub(crate) fn push_mode(&self) -> PushMode {
        self.options.push_mode
    }
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to a constructed pipeline. Clones share the same registry.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .finish()
    }
}
