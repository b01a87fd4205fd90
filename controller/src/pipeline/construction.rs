use super::bus::BusListener;
use super::{
    DispatchGate, EventBroadcaster, ExclusiveArbiter, Pipeline, PipelineInner, PipelineOptions,
    ResourceArbiter, Shared,
};
use crate::element::ElementInner;
use crate::engine::{Engine, Graph, PushMode};
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use streamctl_types::{ElementKind, PipelineState};
use tracing::{debug, info};
use uuid::Uuid;

/// Builds a [`Pipeline`] from a graph description.
pub struct PipelineBuilder {
    description: String,
    options: PipelineOptions,
    resources: Vec<String>,
    arbiter: Option<Arc<dyn ResourceArbiter>>,
}

impl PipelineBuilder {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            options: PipelineOptions::default(),
            resources: Vec::new(),
            arbiter: None,
        }
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn push_mode(mut self, push_mode: PushMode) -> Self {
        self.options.push_mode = push_mode;
        self
    }

    /// Claim an exclusive platform resource for the pipeline's lifetime.
    pub fn resource(mut self, resource_type: impl Into<String>) -> Self {
        self.resources.push(resource_type.into());
        self
    }

    /// Arbiter used for the claimed resources, the process-wide
    /// [`ExclusiveArbiter`] by default.
    pub fn arbiter(mut self, arbiter: Arc<dyn ResourceArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Build the graph, discover its controllable elements and bring the
    /// pipeline to READY.
    ///
    /// Anything acquired before a failure is released before the error is
    /// returned.
    pub fn build(self, engine: &Arc<dyn Engine>) -> Result<Pipeline> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "pipeline description is empty".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        info!(
            "Constructing pipeline {} with the {} engine: {}",
            id,
            engine.name(),
            description
        );

        let arbiter = self
            .arbiter
            .unwrap_or_else(|| ExclusiveArbiter::global() as Arc<dyn ResourceArbiter>);
        let mut resources = HashMap::new();
        for resource_type in &self.resources {
            let handle = arbiter.acquire(resource_type, id)?;
            resources.insert(resource_type.clone(), handle);
        }

        let graph: Arc<dyn Graph> = Arc::from(engine.build_graph(description)?);
        let gate = Arc::new(DispatchGate::new(id));

        let pipeline = Pipeline {
            inner: Arc::new(PipelineInner {
                id,
                description: description.to_string(),
                events: EventBroadcaster::new(self.options.event_buffer),
                options: self.options,
                shared: Mutex::new(Shared {
                    state: PipelineState::Null,
                    pending: None,
                    is_eos: false,
                    eos_rearm: true,
                    fault: None,
                    destroyed: false,
                    elements: HashMap::new(),
                    resources,
                    subscriber: None,
                }),
                changed: Condvar::new(),
                graph: RwLock::new(Some(graph.clone())),
                gate: gate.clone(),
                listener: Mutex::new(None),
            }),
        };

        // From here on, dropping `pipeline` tears everything down
        {
            let mut shared = pipeline.inner.shared.lock();
            for node in graph.nodes() {
                let kind = ElementKind::from_factory(node.factory());
                if !kind.is_discovered() {
                    continue;
                }
                let name = node.name().to_string();
                debug!("Discovered {} element '{}'", kind, name);
                let element = ElementInner::create(node, kind, gate.clone());
                shared.elements.insert(name, element);
            }
        }

        let (sender, messages) = crossbeam_channel::unbounded();
        graph.subscribe_messages(sender)?;
        let listener = BusListener::spawn(
            Arc::downgrade(&pipeline.inner),
            messages,
            format!("streamctl-bus-{}", &id.simple().to_string()[..8]),
        )?;
        *pipeline.inner.listener.lock() = Some(listener);

        pipeline.set_state(PipelineState::Ready)?;
        pipeline.wait_state(PipelineState::Ready, pipeline.inner.options.state_timeout)?;

        info!(
            "Pipeline {} is READY with {} controllable elements",
            id,
            pipeline.inner.shared.lock().elements.len()
        );
        Ok(pipeline)
    }
}

impl Pipeline {
    /// Construct a pipeline with default options.
    pub fn construct(engine: &Arc<dyn Engine>, description: &str) -> Result<Pipeline> {
        PipelineBuilder::new(description).build(engine)
    }
}

/// Check that the host can create elements of `factory`.
pub fn check_element_availability(engine: &dyn Engine, factory: &str) -> Result<()> {
    let factory = factory.trim();
    if factory.is_empty() {
        return Err(PipelineError::InvalidParameter(
            "element factory name is empty".to_string(),
        ));
    }
    if engine.element_available(factory) {
        Ok(())
    } else {
        Err(PipelineError::PluginUnavailable(factory.to_string()))
    }
}
