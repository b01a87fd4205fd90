//! In-process loopback engine.
//!
//! Builds graphs from the gst-launch subset in [`parse`] and moves buffers
//! between nodes on one streaming thread per application source. It keeps
//! the observable behaviour the control layer relies on (stepwise state
//! changes posted to the bus, bounded source queues with feed events, EOS
//! once every sink saw it) without any native dependency.

mod node;
mod parse;

pub use node::LoopbackNode;

use crate::custom::{ConditionLease, FilterLease};
use crate::engine::{
    Engine, EngineError, EngineMessage, Graph, MessageSender, Node, StateChangeOutcome,
};
use node::{Custom, Factory, Flow, OutLink};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use streamctl_types::{PipelineState, StreamCaps};
use tracing::{debug, info, trace};

/// The loopback engine. Cheap to create; every graph it builds is
/// independent.
#[derive(Default)]
pub struct LoopbackEngine {
    transition_delay: Option<Duration>,
    graphs: Mutex<Vec<Weak<GraphCore>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every state step take `delay` and complete on a worker thread,
    /// so `request_state` returns `Async` like a prerolling GStreamer
    /// pipeline.
    pub fn with_transition_delay(mut self, delay: Duration) -> Self {
        self.transition_delay = Some(delay);
        self
    }

    /// Post an engine error on every live graph.
    pub fn post_error(&self, message: &str) {
        for core in self.live_graphs() {
            core.post(EngineMessage::Error {
                message: message.to_string(),
                source: None,
            });
        }
    }

    /// Number of graphs built by this engine that are still alive.
    pub fn graph_count(&self) -> usize {
        self.live_graphs().len()
    }

    fn live_graphs(&self) -> Vec<Arc<GraphCore>> {
        let mut graphs = self.graphs.lock();
        graphs.retain(|g| g.strong_count() > 0);
        graphs.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Engine for LoopbackEngine {
    fn name(&self) -> &str {
        "loopback"
    }

    fn element_available(&self, factory: &str) -> bool {
        Factory::from_name(factory).is_some()
    }

    fn build_graph(&self, description: &str) -> Result<Box<dyn Graph>, EngineError> {
        let decl = parse::parse(description)?;

        let mut nodes = Vec::with_capacity(decl.elements.len());
        for element in &decl.elements {
            let factory = Factory::from_name(&element.factory)
                .ok_or_else(|| EngineError::NoSuchElement(element.factory.clone()))?;
            let custom = bind_custom(factory, &element.name, &element.properties)?;
            nodes.push(node::LoopbackNode::new(
                element.name.clone(),
                factory,
                &element.properties,
                custom,
            )?);
        }

        for link in &decl.links {
            link_nodes(&mut nodes, link)?;
        }
        negotiate(&nodes)?;

        let names = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name().to_string(), i))
            .collect();
        let core = Arc::new(GraphCore {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            names,
            state: Mutex::new(StateMachine::default()),
            state_changed: Condvar::new(),
            bus: Mutex::new(None),
            eos_posted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            transition_delay: self.transition_delay,
        });

        // From here on dropping `graph` stops whatever was already spawned
        let graph = LoopbackGraph {
            core: core.clone(),
            threads: Mutex::new(Vec::new()),
        };
        for (index, node) in core.nodes.iter().enumerate() {
            if node.source.is_some() {
                let thread_core = core.clone();
                graph.spawn(format!("loopback-{}", node.name()), move || {
                    node::stream_source(thread_core, index)
                })?;
            }
        }
        if core.transition_delay.is_some() {
            let thread_core = core.clone();
            graph.spawn("loopback-state".to_string(), move || {
                run_state_worker(thread_core)
            })?;
        }

        self.graphs.lock().push(Arc::downgrade(&core));
        debug!(
            "Built loopback graph with {} nodes and {} links",
            core.nodes.len(),
            decl.links.len()
        );
        Ok(Box::new(graph))
    }
}

fn property<'a>(properties: &'a [(String, String)], key: &str) -> Option<&'a str> {
    properties
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Take the custom registry leases a node needs.
fn bind_custom(
    factory: Factory,
    name: &str,
    properties: &[(String, String)],
) -> Result<Custom, EngineError> {
    match factory {
        Factory::TensorFilter => {
            let framework = property(properties, "framework").unwrap_or("");
            if framework != "custom-easy" {
                return Err(EngineError::NoSuchElement(format!(
                    "tensor_filter framework '{}'",
                    framework
                )));
            }
            let model = property(properties, "model").ok_or_else(|| {
                EngineError::Parse(format!("{} needs a model", name))
            })?;
            FilterLease::acquire(model)
                .map(Custom::Filter)
                .ok_or_else(|| {
                    EngineError::Parse(format!("custom filter '{}' is not registered", model))
                })
        }
        Factory::TensorIf => {
            let compared = property(properties, "compared-value").unwrap_or("");
            if compared != "CUSTOM" {
                return Err(EngineError::Unsupported(format!(
                    "{}: compared-value '{}'",
                    name, compared
                )));
            }
            let option = property(properties, "compared-value-option").ok_or_else(|| {
                EngineError::Parse(format!("{} needs compared-value-option", name))
            })?;
            ConditionLease::acquire(option)
                .map(Custom::Condition)
                .ok_or_else(|| {
                    EngineError::Parse(format!("custom condition '{}' is not registered", option))
                })
        }
        _ => Ok(Custom::None),
    }
}

fn request_pad(used: &[String], prefix: &str) -> String {
    (0..)
        .map(|n| format!("{}_{}", prefix, n))
        .find(|pad| !used.contains(pad))
        .unwrap_or_else(|| prefix.to_string())
}

fn is_request_pad(pad: &str, prefix: &str) -> bool {
    pad.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|n| n.parse::<u32>().is_ok())
}

fn link_nodes(nodes: &mut [node::LoopbackNode], link: &parse::LinkDecl) -> Result<(), EngineError> {
    let (from_name, to_name) = (
        nodes[link.from].name().to_string(),
        nodes[link.to].name().to_string(),
    );
    let link_error = |reason: &str| {
        EngineError::Link(format!("{} -> {}: {}", from_name, to_name, reason))
    };
    if link.from == link.to {
        return Err(link_error("cannot link an element to itself"));
    }

    let from = &nodes[link.from];
    if !from.factory.has_src_pad() {
        return Err(link_error("upstream element has no source pad"));
    }
    let src_pad = match (&link.from_pad, from.factory.has_request_src_pads()) {
        (Some(pad), true) if is_request_pad(pad, "src") && !from.src_pads.contains(pad) => {
            pad.clone()
        }
        (None, true) => request_pad(&from.src_pads, "src"),
        (Some(pad), false) if pad == "src" && from.outgoing.is_empty() => pad.clone(),
        (None, false) if from.outgoing.is_empty() => "src".to_string(),
        _ => return Err(link_error("no free source pad")),
    };
    if from.factory == Factory::TensorIf && !matches!(src_pad.as_str(), "src_0" | "src_1") {
        return Err(link_error("tensor_if only has src_0 and src_1"));
    }

    let to = &nodes[link.to];
    if !to.factory.has_sink_pad() {
        return Err(link_error("downstream element has no sink pad"));
    }
    let sink_pad = match (&link.to_pad, to.factory.has_request_sink_pads()) {
        (Some(pad), true) if is_request_pad(pad, "sink") && !to.sink_pads.contains(pad) => {
            pad.clone()
        }
        (None, true) => request_pad(&to.sink_pads, "sink"),
        (Some(pad), false) if pad == "sink" && to.sink_pads.is_empty() => pad.clone(),
        (None, false) if to.sink_pads.is_empty() => "sink".to_string(),
        _ => return Err(link_error("no free sink pad")),
    };

    let from = &mut nodes[link.from];
    if from.factory.has_request_src_pads() {
        from.src_pads.push(src_pad.clone());
    }
    from.outgoing.push(OutLink {
        src_pad,
        to: link.to,
        sink_pad: sink_pad.clone(),
    });
    nodes[link.to].sink_pads.push(sink_pad);
    Ok(())
}

fn caps_compatible(upstream: &StreamCaps, expected: &StreamCaps) -> bool {
    match (upstream, expected) {
        (StreamCaps::Tensors(up), StreamCaps::Tensors(exp)) => exp.is_compatible(up),
        (StreamCaps::Media { mime: up }, StreamCaps::Media { mime: exp }) => up == exp,
        _ => false,
    }
}

/// Propagate caps downstream until nothing changes, rejecting links whose
/// fixed caps disagree.
fn negotiate(nodes: &[node::LoopbackNode]) -> Result<(), EngineError> {
    let mut fixed: Vec<bool> = nodes.iter().map(|n| n.caps.read().is_some()).collect();
    for (i, node) in nodes.iter().enumerate() {
        if let Custom::Filter(lease) = &node.custom {
            fixed[i] = true;
            *node.caps.write() = Some(StreamCaps::Tensors(lease.filter().out_info().clone()));
        }
    }

    loop {
        let mut changed = false;
        for node in nodes {
            let Some(caps) = node.caps.read().clone() else {
                continue;
            };
            for link in &node.outgoing {
                let target = &nodes[link.to];
                let expected = match &target.custom {
                    Custom::Filter(lease) => {
                        Some(StreamCaps::Tensors(lease.filter().in_info().clone()))
                    }
                    _ if fixed[link.to] => target.caps.read().clone(),
                    _ => None,
                };
                match expected {
                    Some(expected) if !caps_compatible(&caps, &expected) => {
                        return Err(EngineError::Link(format!(
                            "{} -> {}: {} does not fit {}",
                            node.name(),
                            target.name(),
                            caps,
                            expected
                        )));
                    }
                    Some(_) => {}
                    None => {
                        let mut target_caps = target.caps.write();
                        if target_caps.is_none() {
                            *target_caps = Some(caps.clone());
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            return Ok(());
        }
    }
}

#[derive(Debug, Default)]
struct StateMachine {
    current: PipelineState,
    target: PipelineState,
}

/// Shared runtime of one graph, referenced by its streaming threads.
pub(crate) struct GraphCore {
    nodes: Vec<Arc<node::LoopbackNode>>,
    names: HashMap<String, usize>,
    state: Mutex<StateMachine>,
    state_changed: Condvar,
    bus: Mutex<Option<MessageSender>>,
    eos_posted: AtomicBool,
    shutdown: AtomicBool,
    transition_delay: Option<Duration>,
}

impl GraphCore {
    fn post(&self, message: EngineMessage) {
        if let Some(sender) = self.bus.lock().as_ref() {
            let _ = sender.send(message);
        }
    }

    /// Hand `item` from node `from` to its downstream peers, optionally
    /// only through `only_pad`.
    fn forward_through(&self, from: usize, item: Flow, only_pad: Option<&str>) {
        let node = &self.nodes[from];
        for link in &node.outgoing {
            if only_pad.is_some_and(|pad| pad != link.src_pad) {
                continue;
            }
            self.receive(link.to, &link.sink_pad, item.clone());
        }
    }

    fn forward(&self, from: usize, item: Flow) {
        self.forward_through(from, item, None);
    }

    fn receive(&self, index: usize, pad: &str, item: Flow) {
        let node = &self.nodes[index];
        let buffer = match item {
            Flow::Eos => {
                if !node.mark_eos(pad) {
                    return;
                }
                if node.factory.is_sink() {
                    self.sink_reached_eos(index);
                } else {
                    self.forward(index, Flow::Eos);
                }
                return;
            }
            Flow::Buffer(buffer) => buffer,
        };

        match node.factory {
            Factory::AppSink | Factory::TensorSink => node.fire_buffer(buffer),
            Factory::FakeSink => trace!("{}: discarded {} bytes", node.name(), buffer.size()),
            Factory::Valve if node.is_dropping() => {
                trace!("{}: dropped {} bytes", node.name(), buffer.size())
            }
            Factory::InputSelector => {
                if node.active_branch().as_deref() == Some(pad) {
                    self.forward(index, Flow::Buffer(buffer));
                }
            }
            Factory::OutputSelector => {
                let active = node.active_branch();
                self.forward_through(index, Flow::Buffer(buffer), active.as_deref());
            }
            Factory::TensorFilter => match node.run_filter(buffer) {
                Ok(out) => self.forward(index, Flow::Buffer(out)),
                Err(err) => self.custom_failed(node, &err),
            },
            Factory::TensorIf => match node.evaluate(&buffer) {
                Ok(then) => {
                    let pad = if then { "src_0" } else { "src_1" };
                    self.forward_through(index, Flow::Buffer(buffer), Some(pad));
                }
                Err(err) => self.custom_failed(node, &err),
            },
            _ => self.forward(index, Flow::Buffer(buffer)),
        }
    }

    fn custom_failed(&self, node: &node::LoopbackNode, err: &anyhow::Error) {
        node::log_custom_failure(node, err);
        self.post(EngineMessage::Warning {
            message: format!("custom callback failed: {:#}", err),
            source: Some(node.name().to_string()),
        });
    }

    fn sink_reached_eos(&self, index: usize) {
        debug!("{} reached end of stream", self.nodes[index].name());
        let all = self
            .nodes
            .iter()
            .filter(|n| n.factory.is_sink())
            .all(|n| !n.eos_pads.lock().is_empty());
        if all && !self.eos_posted.swap(true, Ordering::SeqCst) {
            self.post(EngineMessage::Eos);
        }
    }

    fn reset_stream(&self) {
        for node in &self.nodes {
            node.clear_queue();
            node.reset_eos();
        }
        self.eos_posted.store(false, Ordering::SeqCst);
    }

    fn apply_step(&self, old: PipelineState, new: PipelineState) {
        match (old, new) {
            (_, PipelineState::Playing) => self.nodes.iter().for_each(|n| n.set_playing(true)),
            (PipelineState::Playing, _) => self.nodes.iter().for_each(|n| n.set_playing(false)),
            (PipelineState::Paused, PipelineState::Ready) => self.reset_stream(),
            _ => {}
        }
    }

    /// Run one step under the state lock and post it.
    fn step(&self, machine: &mut StateMachine, next: PipelineState) {
        let old = machine.current;
        self.apply_step(old, next);
        machine.current = next;
        trace!("Loopback graph stepped {} -> {}", old, next);
        self.post(EngineMessage::StateChanged {
            old,
            current: next,
            pending: (next != machine.target).then_some(machine.target),
        });
    }
}

fn run_state_worker(core: Arc<GraphCore>) {
    let delay = core.transition_delay.unwrap_or_default();
    let mut machine = core.state.lock();
    loop {
        if core.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if machine.current.step_towards(machine.target).is_none() {
            core.state_changed.wait(&mut machine);
            continue;
        }
        MutexGuard::unlocked(&mut machine, || std::thread::sleep(delay));
        if core.shutdown.load(Ordering::SeqCst) {
            return;
        }
        // The target may have moved while sleeping
        if let Some(next) = machine.current.step_towards(machine.target) {
            core.step(&mut machine, next);
        }
    }
}

/// A graph built by [`LoopbackEngine`].
pub struct LoopbackGraph {
    core: Arc<GraphCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopbackGraph {
    fn spawn<F>(&self, name: String, body: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| EngineError::StateChange(format!("failed to spawn {}: {}", name, e)))?;
        self.threads.lock().push(handle);
        Ok(())
    }
}

impl Graph for LoopbackGraph {
    fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.core
            .nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn Node>)
            .collect()
    }

    fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
        let index = *self.core.names.get(name)?;
        Some(self.core.nodes[index].clone() as Arc<dyn Node>)
    }

    fn request_state(&self, target: PipelineState) -> Result<StateChangeOutcome, EngineError> {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let mut machine = self.core.state.lock();
        machine.target = target;

        if self.core.transition_delay.is_some() {
            if machine.current == target {
                return Ok(StateChangeOutcome::Success);
            }
            self.core.state_changed.notify_all();
            return Ok(StateChangeOutcome::Async);
        }

        while let Some(next) = machine.current.step_towards(target) {
            self.core.step(&mut machine, next);
        }
        Ok(StateChangeOutcome::Success)
    }

    fn current_state(&self) -> PipelineState {
        self.core.state.lock().current
    }

    fn subscribe_messages(&self, sender: MessageSender) -> Result<(), EngineError> {
        *self.core.bus.lock() = Some(sender);
        Ok(())
    }

    fn unsubscribe_messages(&self) {
        self.core.bus.lock().take();
    }

    fn flush(&self) -> Result<(), EngineError> {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        self.core.reset_stream();
        Ok(())
    }
}

impl Drop for LoopbackGraph {
    fn drop(&mut self) {
        {
            let _machine = self.core.state.lock();
            self.core.shutdown.store(true, Ordering::SeqCst);
            self.core.state_changed.notify_all();
        }
        self.core.bus.lock().take();
        for node in &self.core.nodes {
            node.shutdown();
        }

        let current = std::thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        info!("Loopback graph stopped");
    }
}
