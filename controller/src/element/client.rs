//! Client registrations on an element and their callback invocation.

use super::ElementInner;
use crate::error::{PipelineError, Result};
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use streamctl_types::TensorsData;
use tracing::{debug, error, warn};

/// Callback receiving every buffer that reaches a sink element.
pub type SinkCallback = dyn Fn(&TensorsData) -> anyhow::Result<()> + Send + Sync;

type NeedDataFn = dyn Fn(u32) -> anyhow::Result<()> + Send + Sync;
type EnoughDataFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;
type SeekDataFn = dyn Fn(u64) -> anyhow::Result<()> + Send + Sync;

/// Flow-control callbacks of an application source.
///
/// ```
/// use streamctl::SourceCallbacks;
///
/// let callbacks = SourceCallbacks::new()
///     .need_data(|hint| {
///         println!("source wants {} more bytes", hint);
///         Ok(())
///     })
///     .enough_data(|| Ok(()));
/// ```
#[derive(Default)]
pub struct SourceCallbacks {
    need_data: Option<Box<NeedDataFn>>,
    enough_data: Option<Box<EnoughDataFn>>,
    seek_data: Option<Box<SeekDataFn>>,
}

impl SourceCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the source queue runs dry. The hint is in bytes, 0 when
    /// unknown.
    pub fn need_data<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.need_data = Some(Box::new(f));
        self
    }

    /// Called when the source queue is full.
    pub fn enough_data<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.enough_data = Some(Box::new(f));
        self
    }

    pub fn seek_data<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.seek_data = Some(Box::new(f));
        self
    }

    pub(crate) fn on_need_data(&self, hint: u32) -> anyhow::Result<()> {
        self.need_data.as_ref().map_or(Ok(()), |f| f(hint))
    }

    pub(crate) fn on_enough_data(&self) -> anyhow::Result<()> {
        self.enough_data.as_ref().map_or(Ok(()), |f| f())
    }

    pub(crate) fn on_seek_data(&self, offset: u64) -> anyhow::Result<()> {
        self.seek_data.as_ref().map_or(Ok(()), |f| f(offset))
    }
}

pub(crate) enum Callback {
    Sink(Box<SinkCallback>),
    Source(SourceCallbacks),
}

/// One registration. `live` is held for the whole of an invocation so a
/// detach from another thread waits for it; being re-entrant, it lets the
/// callback detach itself.
pub(crate) struct ClientSlot {
    id: u32,
    callback: Callback,
    live: ReentrantMutex<Cell<bool>>,
}

impl ClientSlot {
    pub(crate) fn new(id: u32, callback: Callback) -> Self {
        Self {
            id,
            callback,
            live: ReentrantMutex::new(Cell::new(true)),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Run `f` against the callback unless the slot was deactivated.
    /// Failures are logged, never propagated.
    pub(crate) fn invoke<F>(&self, element: &str, f: F)
    where
        F: FnOnce(&Callback) -> anyhow::Result<()>,
    {
        let live = self.live.lock();
        if !live.get() {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| f(&self.callback))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Callback {} on '{}' failed: {:#}",
                self.id, element, e
            ),
            Err(_) => error!("Callback {} on '{}' panicked", self.id, element),
        }
    }

    /// Stop future invocations, waiting for one running on another thread.
    /// Returns whether the slot was still live.
    pub(crate) fn deactivate(&self) -> bool {
        let live = self.live.lock();
        live.replace(false)
    }
}

/// A registration returned by
/// [`attach_sink_callback`](super::ElementHandle::attach_sink_callback) or
/// [`attach_source_feed`](super::ElementHandle::attach_source_feed).
///
/// Dropping the handle keeps the registration; it then lives as long as
/// the element.
pub struct ClientHandle {
    slot: Arc<ClientSlot>,
    element: Weak<ElementInner>,
}

impl ClientHandle {
    pub(crate) fn new(slot: Arc<ClientSlot>, element: &Arc<ElementInner>) -> Self {
        Self {
            slot,
            element: Arc::downgrade(element),
        }
    }

    /// Identifier of the registration, unique within its element.
    pub fn id(&self) -> u32 {
        self.slot.id
    }

    /// Remove the registration.
    ///
    /// No invocation of the callback starts after this returns; one running
    /// on another thread is waited for. Safe to call from inside the
    /// callback itself. Fails with `NotFound` once the element was
    /// released.
    pub fn detach(self) -> Result<()> {
        self.slot.deactivate();
        let element = self.element.upgrade().ok_or_else(|| {
            PipelineError::NotFound(format!("client {} (element released)", self.slot.id))
        })?;
        element.remove_client(self.slot.id)?;
        debug!("Detached client {} from '{}'", self.slot.id, element.name());
        Ok(())
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.slot.id).finish()
    }
}
