use super::{Pipeline, PipelineInner};
use crate::engine::StateChangeOutcome;
use crate::error::{PipelineError, Result};
use std::time::{Duration, Instant};
use streamctl_types::PipelineState;
use tracing::{debug, error, info, warn};

impl Pipeline {
    /// Request a transition towards `target` without waiting for it.
    ///
    /// A request for a different target while an earlier asynchronous
    /// transition is unconfirmed fails with `TryAgain`; repeating the
    /// pending target is a no-op. Completion is reported through the
    /// state-change subscriber and the event stream.
    pub fn set_state(&self, target: PipelineState) -> Result<()> {
        let graph = self.inner.usable_graph()?;
        {
            let mut shared = self.inner.shared.lock();
            match shared.pending {
                Some(pending) if pending == target => {
                    debug!(
                        "Pipeline {} already moving to {}",
                        self.inner.id, target
                    );
                    return Ok(());
                }
                Some(pending) => {
                    return Err(PipelineError::TryAgain(format!(
                        "transition to {} is still pending",
                        pending
                    )));
                }
                None if graph.current_state() == target => return Ok(()),
                None => shared.pending = Some(target),
            }
        }

        info!("Setting pipeline {} to {}", self.inner.id, target);
        match graph.request_state(target) {
            Ok(StateChangeOutcome::Async) => {
                info!(
                    "Pipeline {} transition to {} continues asynchronously",
                    self.inner.id, target
                );
                Ok(())
            }
            Ok(outcome) => {
                debug!(
                    "Pipeline {} set to {}: {:?}",
                    self.inner.id, target, outcome
                );
                self.inner.clear_pending(target);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Pipeline {} failed to change state to {}: {}",
                    self.inner.id, target, e
                );
                self.inner.clear_pending(target);
                Err(e.into())
            }
        }
    }

    /// Block until the bus listener confirmed `target`.
    ///
    /// Fails with `TryAgain` on timeout and with `ErrorState` if the engine
    /// faulted meanwhile. Not available from the state-change subscriber,
    /// which runs on the listener thread.
    pub fn wait_state(&self, target: PipelineState, timeout: Duration) -> Result<()> {
        if self.inner.on_listener_thread() {
            return Err(PipelineError::InvalidState(
                "cannot wait for a state change from the bus listener".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        let mut shared = self.inner.shared.lock();
        loop {
            if shared.destroyed {
                return Err(PipelineError::InvalidState(
                    "pipeline was destroyed".to_string(),
                ));
            }
            if let Some(fault) = &shared.fault {
                return Err(PipelineError::ErrorState(fault.clone()));
            }
            if shared.state == target {
                return Ok(());
            }
            if self
                .inner
                .changed
                .wait_until(&mut shared, deadline)
                .timed_out()
                && shared.state != target
            {
                return Err(PipelineError::TryAgain(format!(
                    "{} not reached within {:?} (pipeline is {})",
                    target, timeout, shared.state
                )));
            }
        }
    }

    /// Request PLAYING.
    pub fn start(&self) -> Result<()> {
        self.set_state(PipelineState::Playing)
    }

    /// Request PAUSED.
    pub fn stop(&self) -> Result<()> {
        self.set_state(PipelineState::Paused)
    }

    /// Pause, drop every buffer queued inside the graph and optionally
    /// resume playback.
    pub fn flush(&self, restart: bool) -> Result<()> {
        let graph = self.inner.usable_graph()?;
        info!("Flushing pipeline {}", self.inner.id);
        self.set_state(PipelineState::Paused)?;
        self.wait_state(PipelineState::Paused, self.inner.options.state_timeout)?;
        graph.flush()?;
        if restart {
            self.set_state(PipelineState::Playing)?;
        }
        Ok(())
    }

    /// Stop the graph, release every element and resource and drop the
    /// graph.
    ///
    /// Callbacks already running on other threads are waited for; none
    /// starts once this returns. Calling it again is a no-op. Calling it
    /// from a callback of this pipeline, or while holding a
    /// [`GraphLease`](super::GraphLease) on this thread, fails with
    /// `InvalidState`.
    pub fn destroy(&self) -> Result<()> {
        if self.inner.gate.is_held_here() {
            return Err(PipelineError::InvalidState(
                "cannot destroy a pipeline from inside one of its callbacks".to_string(),
            ));
        }
        self.inner.teardown();
        Ok(())
    }
}

impl PipelineInner {
    fn clear_pending(&self, target: PipelineState) {
        let mut shared = self.shared.lock();
        if shared.pending == Some(target) {
            shared.pending = None;
        }
        drop(shared);
        self.changed.notify_all();
    }

    /// Wait for the listener to report NULL after an asynchronous request.
    fn wait_for_null(&self) {
        if self.on_listener_thread() {
            return;
        }
        let deadline = Instant::now() + self.options.state_timeout;
        let mut shared = self.shared.lock();
        while shared.state != PipelineState::Null {
            if self.changed.wait_until(&mut shared, deadline).timed_out() {
                warn!(
                    "Pipeline {} did not reach NULL within {:?}",
                    self.id, self.options.state_timeout
                );
                break;
            }
        }
    }

    pub(super) fn teardown(&self) {
        let subscriber = {
            let mut shared = self.shared.lock();
            if shared.destroyed {
                return;
            }
            shared.destroyed = true;
            shared.pending = None;
            shared.subscriber.take()
        };
        drop(subscriber);
        info!("Destroying pipeline {}", self.id);

        // No callback starts after this; running ones have returned
        self.gate.close();
        self.changed.notify_all();

        let graph = self.graph.read().clone();
        if let Some(graph) = &graph {
            match graph.request_state(PipelineState::Null) {
                Ok(StateChangeOutcome::Async) => self.wait_for_null(),
                Ok(_) => {}
                Err(e) => warn!("Failed to stop pipeline {}: {}", self.id, e),
            }
            graph.unsubscribe_messages();
        }

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop();
        }

        let (elements, resources) = {
            let mut shared = self.shared.lock();
            (
                std::mem::take(&mut shared.elements),
                std::mem::take(&mut shared.resources),
            )
        };
        for element in elements.into_values() {
            element.release();
        }
        if !resources.is_empty() {
            debug!(
                "Releasing {} resources of pipeline {}",
                resources.len(),
                self.id
            );
        }
        drop(resources);

        drop(graph);
        let graph = self.graph.write().take();
        drop(graph);
        info!("Pipeline {} destroyed", self.id);
    }
}
