use super::gate::GateGuard;
use super::{Pipeline, ResourceHandle, StateSubscriber};
use crate::element::{Capability, ElementHandle, ElementInner};
use crate::engine::Graph;
use crate::error::{PipelineError, Result};
use std::ops::Deref;
use std::sync::Arc;
use streamctl_types::{PipelineEvent, PipelineId, PipelineState};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::{debug, info};

impl Pipeline {
    pub fn id(&self) -> PipelineId {
        self.inner.id
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Last state confirmed by the bus listener. Advisory while a
    /// transition is in flight.
    pub fn state(&self) -> PipelineState {
        self.inner.shared.lock().state
    }

    /// Target of an unconfirmed state request, if any.
    pub fn pending_state(&self) -> Option<PipelineState> {
        self.inner.shared.lock().pending
    }

    pub fn is_eos(&self) -> bool {
        self.inner.shared.lock().is_eos
    }

    /// Engine fault that put the pipeline in its error state.
    pub fn fault(&self) -> Option<String> {
        self.inner.shared.lock().fault.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shared.lock().destroyed
    }

    /// Names of the elements that currently have a handle, sorted.
    pub fn element_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.shared.lock().elements.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up an element by name.
    ///
    /// Sources, sinks, valves and switches get their handle while the
    /// pipeline is constructed; any other named node gets one on first
    /// lookup.
    pub fn get_element(&self, name: &str) -> Result<ElementHandle> {
        if name.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "element name is empty".to_string(),
            ));
        }
        let graph = self.inner.usable_graph()?;

        let mut shared = self.inner.shared.lock();
        if shared.destroyed {
            return Err(PipelineError::InvalidState(
                "pipeline was destroyed".to_string(),
            ));
        }
        if let Some(element) = shared.elements.get(name) {
            return Ok(ElementHandle::new(element.clone(), &self.inner));
        }

        let node = graph
            .node(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        let kind = streamctl_types::ElementKind::from_factory(node.factory());
        let element = ElementInner::create(node, kind, self.inner.gate.clone());
        debug!("Created handle for {} element '{}'", kind, name);
        shared.elements.insert(name.to_string(), element.clone());
        Ok(ElementHandle::new(element, &self.inner))
    }

    /// Look up an element and check it supports `capability`.
    pub fn get_element_as(&self, name: &str, capability: Capability) -> Result<ElementHandle> {
        let element = self.get_element(name)?;
        if capability.supported_by(element.kind()) {
            Ok(element)
        } else {
            Err(PipelineError::TypeMismatch {
                element: name.to_string(),
                reason: format!("a {} element cannot be used as {}", element.kind(), capability),
            })
        }
    }

    /// Release the handle of `name`: detach its clients and run its
    /// custom-destroy hook. The node stays in the graph.
    pub fn remove_element(&self, name: &str) -> Result<()> {
        self.inner.check_usable()?;
        let element = self
            .inner
            .shared
            .lock()
            .elements
            .remove(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        element.release();
        debug!("Removed element handle '{}'", name);
        Ok(())
    }

    /// Install the state-change subscriber, replacing an earlier one.
    pub fn set_state_change_subscriber<F>(&self, subscriber: F) -> Result<()>
    where
        F: Fn(&PipelineEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.check_usable()?;
        let subscriber: Arc<StateSubscriber> = Arc::new(subscriber);
        self.inner.shared.lock().subscriber = Some(subscriber);
        Ok(())
    }

    pub fn clear_state_change_subscriber(&self) {
        self.inner.shared.lock().subscriber.take();
    }

    /// Receive every event of this pipeline. Slow receivers lose the
    /// oldest events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Every event of this pipeline as a stream.
    pub fn event_stream(&self) -> impl Stream<Item = PipelineEvent> + Send + 'static {
        self.inner.events.stream()
    }

    /// Track a resource acquired outside the builder. It is released by
    /// [`release_all_resources`](Self::release_all_resources) or teardown.
    pub fn register_resource(
        &self,
        resource_type: &str,
        handle: Box<dyn ResourceHandle>,
    ) -> Result<()> {
        self.inner.check_usable()?;
        if resource_type.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "resource type is empty".to_string(),
            ));
        }
        let mut shared = self.inner.shared.lock();
        if shared.resources.contains_key(resource_type) {
            return Err(PipelineError::InvalidParameter(format!(
                "resource '{}' is already registered",
                resource_type
            )));
        }
        shared.resources.insert(resource_type.to_string(), handle);
        debug!(
            "Pipeline {} registered resource '{}'",
            self.inner.id, resource_type
        );
        Ok(())
    }

    /// Release every tracked resource.
    pub fn release_all_resources(&self) {
        let resources = std::mem::take(&mut self.inner.shared.lock().resources);
        if !resources.is_empty() {
            info!(
                "Pipeline {} released {} resources",
                self.inner.id,
                resources.len()
            );
        }
    }

    /// Types of the resources currently held, sorted.
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.shared.lock().resources.keys().cloned().collect();
        types.sort();
        types
    }

    /// Borrow the engine graph for advanced use.
    ///
    /// Teardown waits for leases held on other threads and refuses to run
    /// on a thread holding one.
    pub fn graph(&self) -> Result<GraphLease<'_>> {
        let graph = self.inner.usable_graph()?;
        let guard = self
            .inner
            .gate
            .enter()
            .ok_or_else(|| PipelineError::InvalidState("pipeline was destroyed".to_string()))?;
        Ok(GraphLease {
            graph,
            _guard: guard,
        })
    }
}

/// Scoped access to a pipeline's engine graph.
pub struct GraphLease<'a> {
    graph: Arc<dyn Graph>,
    _guard: GateGuard<'a>,
}

impl Deref for GraphLease<'_> {
    type Target = dyn Graph;

    fn deref(&self) -> &Self::Target {
        self.graph.as_ref()
    }
}
