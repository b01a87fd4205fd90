//! Quiescence gate between callback dispatch and pipeline teardown.
//!
//! Every user callback of a pipeline runs inside a [`GateGuard`]. Closing
//! the gate refuses new entries and waits until the guards held on other
//! threads are gone; guards held by the closing thread itself do not count,
//! so closing from inside a callback cannot deadlock.

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use streamctl_types::PipelineId;

thread_local! {
    /// Pipelines this thread is currently dispatching for, innermost last
    static DISPATCHING: RefCell<Vec<PipelineId>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct GateState {
    open: bool,
    active: usize,
}

#[derive(Debug)]
pub(crate) struct DispatchGate {
    pipeline_id: PipelineId,
    state: Mutex<GateState>,
    idle: Condvar,
}

impl DispatchGate {
    pub(crate) fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            state: Mutex::new(GateState {
                open: true,
                active: 0,
            }),
            idle: Condvar::new(),
        }
    }

    /// Enter the gate, or `None` once it is closed.
    pub(crate) fn enter(&self) -> Option<GateGuard<'_>> {
        {
            let mut state = self.state.lock();
            if !state.open {
                return None;
            }
            state.active += 1;
        }
        DISPATCHING.with(|d| d.borrow_mut().push(self.pipeline_id));
        Some(GateGuard { gate: self })
    }

    /// Whether the calling thread is inside a guard of this gate.
    pub(crate) fn is_held_here(&self) -> bool {
        held_here(self.pipeline_id)
    }

    /// Close the gate and wait for guards held by other threads.
    pub(crate) fn close(&self) {
        let own = DISPATCHING.with(|d| {
            d.borrow()
                .iter()
                .filter(|id| **id == self.pipeline_id)
                .count()
        });
        let mut state = self.state.lock();
        state.open = false;
        while state.active > own {
            self.idle.wait(&mut state);
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

fn held_here(pipeline_id: PipelineId) -> bool {
    DISPATCHING.with(|d| d.borrow().contains(&pipeline_id))
}

pub(crate) struct GateGuard<'a> {
    gate: &'a DispatchGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        DISPATCHING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|id| *id == self.gate.pipeline_id) {
                d.remove(pos);
            }
        });
        let mut state = self.gate.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.gate.idle.notify_all();
        }
    }
}
