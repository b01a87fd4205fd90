//! Platform resources held by pipelines.
//!
//! Resources are identified by a type string (`"camera"`, `"npu"`, ...).
//! A [`ResourceArbiter`] decides who may hold them; the pipeline records
//! every handle it holds and releases them on teardown.

use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use streamctl_types::PipelineId;
use tracing::debug;

/// A held resource. Dropping the handle releases the resource.
pub trait ResourceHandle: Send + Sync {
    fn resource_type(&self) -> &str;
}

/// Grants resources to pipelines.
pub trait ResourceArbiter: Send + Sync {
    fn acquire(&self, resource_type: &str, owner: PipelineId)
        -> Result<Box<dyn ResourceHandle>>;
}

/// Arbiter granting each resource type to at most one pipeline at a time.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveArbiter {
    holders: Arc<Mutex<HashMap<String, PipelineId>>>,
}

impl ExclusiveArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide arbiter used when a builder is not given one.
    pub fn global() -> Arc<ExclusiveArbiter> {
        static GLOBAL: OnceLock<Arc<ExclusiveArbiter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ExclusiveArbiter::new())).clone()
    }

    /// Current holder of `resource_type`.
    pub fn holder(&self, resource_type: &str) -> Option<PipelineId> {
        self.holders.lock().get(resource_type).copied()
    }
}

impl ResourceArbiter for ExclusiveArbiter {
    fn acquire(
        &self,
        resource_type: &str,
        owner: PipelineId,
    ) -> Result<Box<dyn ResourceHandle>> {
        if resource_type.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "resource type must not be empty".to_string(),
            ));
        }
        let mut holders = self.holders.lock();
        if let Some(holder) = holders.get(resource_type) {
            return Err(PipelineError::Resource(format!(
                "'{}' is held by pipeline {}",
                resource_type, holder
            )));
        }
        holders.insert(resource_type.to_string(), owner);
        debug!("Pipeline {} acquired resource '{}'", owner, resource_type);
        Ok(Box::new(ExclusiveHandle {
            resource_type: resource_type.to_string(),
            owner,
            holders: self.holders.clone(),
        }))
    }
}

struct ExclusiveHandle {
    resource_type: String,
    owner: PipelineId,
    holders: Arc<Mutex<HashMap<String, PipelineId>>>,
}

impl ResourceHandle for ExclusiveHandle {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }
}

impl Drop for ExclusiveHandle {
    fn drop(&mut self) {
        let mut holders = self.holders.lock();
        if holders.get(&self.resource_type) == Some(&self.owner) {
            holders.remove(&self.resource_type);
            debug!(
                "Pipeline {} released resource '{}'",
                self.owner, self.resource_type
            );
        }
    }
}
