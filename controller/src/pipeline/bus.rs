//! Bus listener: the single consumer of a graph's engine messages.
//!
//! The graph posts [`EngineMessage`]s into a channel from its own threads.
//! A dedicated listener thread drains the channel, updates the registry
//! under the pipeline mutex and then, outside of it, broadcasts the event
//! and invokes the state-change subscriber.

use super::PipelineInner;
use crate::engine::EngineMessage;
use crate::error::{PipelineError, Result};
use crossbeam_channel::{select, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;
use std::thread::{JoinHandle, ThreadId};
use streamctl_types::{PipelineEvent, PipelineState};
use tracing::{debug, error, info, trace, warn};

pub(super) struct BusListener {
    thread: JoinHandle<()>,
    shutdown: Sender<()>,
}

impl BusListener {
    pub(super) fn spawn(
        pipeline: Weak<PipelineInner>,
        messages: Receiver<EngineMessage>,
        name: String,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(pipeline, messages, shutdown_rx))
            .map_err(|e| {
                PipelineError::Resource(format!("failed to spawn bus listener: {}", e))
            })?;
        Ok(Self { thread, shutdown })
    }

    pub(super) fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }

    /// Stop the listener and wait for it, unless called from the listener
    /// itself.
    pub(super) fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.thread().id() == std::thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            error!("Bus listener thread panicked");
        }
    }
}

fn run(
    pipeline: Weak<PipelineInner>,
    messages: Receiver<EngineMessage>,
    shutdown: Receiver<()>,
) {
    debug!("Bus listener started");
    loop {
        select! {
            recv(messages) -> message => match message {
                Ok(message) => {
                    let Some(pipeline) = pipeline.upgrade() else {
                        break;
                    };
                    pipeline.handle_message(message);
                }
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("Bus listener stopped");
}

impl PipelineInner {
    fn handle_message(&self, message: EngineMessage) {
        trace!("Bus message for pipeline {}: {:?}", self.id, message);
        let pipeline_id = self.id;

        let (event, subscriber) = {
            let mut shared = self.shared.lock();
            let event = match message {
                EngineMessage::StateChanged {
                    old,
                    current,
                    pending,
                } => {
                    info!(
                        "Pipeline {} state changed: {} -> {} (pending: {:?})",
                        pipeline_id, old, current, pending
                    );
                    shared.state = current;
                    match current {
                        PipelineState::Null | PipelineState::Ready => shared.eos_rearm = true,
                        PipelineState::Playing if shared.eos_rearm => {
                            shared.eos_rearm = false;
                            shared.is_eos = false;
                        }
                        _ => {}
                    }
                    if pending.is_none() && shared.pending == Some(current) {
                        shared.pending = None;
                    }
                    PipelineEvent::StateChanged {
                        pipeline_id,
                        old,
                        new: current,
                        pending,
                    }
                }
                EngineMessage::Eos => {
                    info!("Pipeline {} reached end of stream", pipeline_id);
                    shared.is_eos = true;
                    PipelineEvent::Eos { pipeline_id }
                }
                EngineMessage::Error { message, source } => {
                    error!(
                        "Pipeline {} error: {} (source: {:?})",
                        pipeline_id, message, source
                    );
                    if shared.fault.is_none() {
                        shared.fault = Some(message.clone());
                    }
                    shared.pending = None;
                    PipelineEvent::Error {
                        pipeline_id,
                        error: message,
                        source,
                    }
                }
                EngineMessage::Warning { message, source } => {
                    warn!(
                        "Pipeline {} warning: {} (source: {:?})",
                        pipeline_id, message, source
                    );
                    PipelineEvent::Warning {
                        pipeline_id,
                        warning: message,
                        source,
                    }
                }
            };
            (event, shared.subscriber.clone())
        };
        self.changed.notify_all();
        self.events.broadcast(event.clone());

        let Some(subscriber) = subscriber else {
            return;
        };
        // A closed gate means teardown has started
        let Some(_guard) = self.gate.enter() else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| subscriber(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "State-change subscriber of pipeline {} failed: {:#}",
                pipeline_id, e
            ),
            Err(_) => error!(
                "State-change subscriber of pipeline {} panicked",
                pipeline_id
            ),
        }
    }

    /// Whether the calling thread is this pipeline's bus listener.
    pub(super) fn on_listener_thread(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|l| l.thread_id() == std::thread::current().id())
    }
}
