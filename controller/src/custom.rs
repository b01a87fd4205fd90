//! Process-wide registry of custom filters and custom conditions.
//!
//! A custom filter is a user transform plugged into any pipeline through
//! `tensor_filter framework=custom-easy model=<name>`; a custom condition is
//! a branch predicate used by `tensor_if compared-value=CUSTOM
//! compared-value-option=<name>`. Both are registered once by name and
//! shared by every pipeline that references them. Engines take a lease per
//! reference while a graph is alive; an entry can only be unregistered once
//! no lease is outstanding.

use crate::error::{PipelineError, Result};
use anyhow::anyhow;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use streamctl_types::{TensorsData, TensorsInfo};
use tracing::{debug, info};

/// User transform invoked for every buffer reaching a custom filter.
pub type FilterFn = dyn Fn(&TensorsData) -> anyhow::Result<TensorsData> + Send + Sync;

/// User predicate choosing the `then` (true) or `else` (false) branch.
pub type ConditionFn = dyn Fn(&TensorsData) -> anyhow::Result<bool> + Send + Sync;

pub struct CustomFilter {
    name: String,
    in_info: TensorsInfo,
    out_info: TensorsInfo,
    invoke: Box<FilterFn>,
    refs: AtomicUsize,
}

impl CustomFilter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_info(&self) -> &TensorsInfo {
        &self.in_info
    }

    pub fn out_info(&self) -> &TensorsInfo {
        &self.out_info
    }
}

impl std::fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFilter")
            .field("name", &self.name)
            .field("in_info", &self.in_info)
            .field("out_info", &self.out_info)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .finish()
    }
}

pub struct CustomCondition {
    name: String,
    invoke: Box<ConditionFn>,
    refs: AtomicUsize,
}

impl std::fmt::Debug for CustomCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomCondition")
            .field("name", &self.name)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    filters: RwLock<HashMap<String, Arc<CustomFilter>>>,
    conditions: RwLock<HashMap<String, Arc<CustomCondition>>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::default)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '!') {
        return Err(PipelineError::InvalidParameter(format!(
            "'{}' is not a usable custom name",
            name
        )));
    }
    Ok(())
}

/// Register a custom filter transforming `in_info` shaped data into
/// `out_info` shaped data.
pub fn register_custom_filter<F>(
    name: &str,
    in_info: TensorsInfo,
    out_info: TensorsInfo,
    filter: F,
) -> Result<CustomFilterHandle>
where
    F: Fn(&TensorsData) -> anyhow::Result<TensorsData> + Send + Sync + 'static,
{
    validate_name(name)?;
    if !in_info.is_valid() || !out_info.is_valid() {
        return Err(PipelineError::InvalidParameter(format!(
            "custom filter '{}' needs valid input and output tensor metadata",
            name
        )));
    }

    let mut filters = registry().filters.write();
    if filters.contains_key(name) {
        return Err(PipelineError::InvalidParameter(format!(
            "custom filter '{}' is already registered",
            name
        )));
    }
    let entry = Arc::new(CustomFilter {
        name: name.to_string(),
        in_info,
        out_info,
        invoke: Box::new(filter),
        refs: AtomicUsize::new(0),
    });
    let handle = CustomFilterHandle {
        name: name.to_string(),
        entry: Arc::downgrade(&entry),
    };
    filters.insert(name.to_string(), entry);
    info!("Registered custom filter '{}'", name);
    Ok(handle)
}

/// Register a custom condition for `tensor_if`.
pub fn register_custom_condition<F>(name: &str, condition: F) -> Result<CustomConditionHandle>
where
    F: Fn(&TensorsData) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    validate_name(name)?;

    let mut conditions = registry().conditions.write();
    if conditions.contains_key(name) {
        return Err(PipelineError::InvalidParameter(format!(
            "custom condition '{}' is already registered",
            name
        )));
    }
    let entry = Arc::new(CustomCondition {
        name: name.to_string(),
        invoke: Box::new(condition),
        refs: AtomicUsize::new(0),
    });
    let handle = CustomConditionHandle {
        name: name.to_string(),
        entry: Arc::downgrade(&entry),
    };
    conditions.insert(name.to_string(), entry);
    info!("Registered custom condition '{}'", name);
    Ok(handle)
}

/// Registration token of a custom filter.
///
/// The token only acts on the registration that produced it, not on a
/// later one reusing the name.
#[derive(Debug)]
pub struct CustomFilterHandle {
    name: String,
    entry: Weak<CustomFilter>,
}

impl CustomFilterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of graphs currently using the filter.
    pub fn ref_count(&self) -> usize {
        self.entry
            .upgrade()
            .map_or(0, |f| f.refs.load(Ordering::SeqCst))
    }

    /// Remove the filter from the registry.
    ///
    /// Fails with `InvalidState` while a graph still references it.
    pub fn unregister(&self) -> Result<()> {
        let mut filters = registry().filters.write();
        let Some(filter) = filters
            .get(&self.name)
            .filter(|f| Weak::ptr_eq(&self.entry, &Arc::downgrade(f)))
        else {
            return Err(PipelineError::NotFound(format!(
                "custom filter '{}'",
                self.name
            )));
        };
        let refs = filter.refs.load(Ordering::SeqCst);
        if refs > 0 {
            return Err(PipelineError::InvalidState(format!(
                "custom filter '{}' is used by {} pipeline element(s)",
                self.name, refs
            )));
        }
        filters.remove(&self.name);
        info!("Unregistered custom filter '{}'", self.name);
        Ok(())
    }
}

/// Registration token of a custom condition.
#[derive(Debug)]
pub struct CustomConditionHandle {
    name: String,
    entry: Weak<CustomCondition>,
}

impl CustomConditionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ref_count(&self) -> usize {
        self.entry
            .upgrade()
            .map_or(0, |c| c.refs.load(Ordering::SeqCst))
    }

    /// Remove the condition from the registry.
    ///
    /// Fails with `InvalidState` while a graph still references it.
    pub fn unregister(&self) -> Result<()> {
        let mut conditions = registry().conditions.write();
        let Some(condition) = conditions
            .get(&self.name)
            .filter(|c| Weak::ptr_eq(&self.entry, &Arc::downgrade(c)))
        else {
            return Err(PipelineError::NotFound(format!(
                "custom condition '{}'",
                self.name
            )));
        };
        let refs = condition.refs.load(Ordering::SeqCst);
        if refs > 0 {
            return Err(PipelineError::InvalidState(format!(
                "custom condition '{}' is used by {} pipeline element(s)",
                self.name, refs
            )));
        }
        conditions.remove(&self.name);
        info!("Unregistered custom condition '{}'", self.name);
        Ok(())
    }
}

/// A graph's reference to a registered custom filter.
///
/// The reference count is taken under the registry lock, so an entry with a
/// live lease can never be removed.
pub struct FilterLease {
    filter: Arc<CustomFilter>,
}

impl FilterLease {
    pub fn acquire(name: &str) -> Option<Self> {
        let filters = registry().filters.read();
        let filter = filters.get(name)?.clone();
        filter.refs.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired custom filter '{}'", name);
        Some(Self { filter })
    }

    pub fn filter(&self) -> &CustomFilter {
        &self.filter
    }

    /// Run the filter. A panic inside it is reported as an error.
    pub fn invoke(&self, input: &TensorsData) -> anyhow::Result<TensorsData> {
        catch_unwind(AssertUnwindSafe(|| (self.filter.invoke)(input)))
            .unwrap_or_else(|_| Err(anyhow!("custom filter '{}' panicked", self.filter.name)))
    }
}

impl Drop for FilterLease {
    fn drop(&mut self) {
        self.filter.refs.fetch_sub(1, Ordering::SeqCst);
        debug!("Released custom filter '{}'", self.filter.name);
    }
}

/// A graph's reference to a registered custom condition.
pub struct ConditionLease {
    condition: Arc<CustomCondition>,
}

impl ConditionLease {
    pub fn acquire(name: &str) -> Option<Self> {
        let conditions = registry().conditions.read();
        let condition = conditions.get(name)?.clone();
        condition.refs.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired custom condition '{}'", name);
        Some(Self { condition })
    }

    pub fn name(&self) -> &str {
        &self.condition.name
    }

    pub fn invoke(&self, input: &TensorsData) -> anyhow::Result<bool> {
        catch_unwind(AssertUnwindSafe(|| (self.condition.invoke)(input))).unwrap_or_else(|_| {
            Err(anyhow!(
                "custom condition '{}' panicked",
                self.condition.name
            ))
        })
    }
}

impl Drop for ConditionLease {
    fn drop(&mut self) {
        self.condition.refs.fetch_sub(1, Ordering::SeqCst);
        debug!("Released custom condition '{}'", self.condition.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamctl_types::{TensorInfo, TensorType};

    fn info() -> TensorsInfo {
        TensorsInfo::single(TensorInfo::new(TensorType::Uint8, vec![4]))
    }

    #[test]
    fn test_filter_refcount_blocks_unregister() {
        let handle =
            register_custom_filter("unit-passthrough", info(), info(), |d| Ok(d.clone())).unwrap();

        let lease = FilterLease::acquire("unit-passthrough").unwrap();
        assert_eq!(handle.ref_count(), 1);
        assert!(matches!(
            handle.unregister(),
            Err(PipelineError::InvalidState(_))
        ));

        let out = lease.invoke(&TensorsData::single(vec![1, 2, 3, 4])).unwrap();
        assert_eq!(out.tensors[0], vec![1, 2, 3, 4]);

        drop(lease);
        assert_eq!(handle.ref_count(), 0);
        handle.unregister().unwrap();
        assert!(FilterLease::acquire("unit-passthrough").is_none());
        assert!(matches!(handle.unregister(), Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let handle = register_custom_condition("unit-dup", |_| Ok(true)).unwrap();
        assert!(matches!(
            register_custom_condition("unit-dup", |_| Ok(false)),
            Err(PipelineError::InvalidParameter(_))
        ));
        handle.unregister().unwrap();
    }

    #[test]
    fn test_invalid_registrations() {
        assert!(register_custom_condition("has space", |_| Ok(true)).is_err());
        let bad = TensorsInfo::default();
        assert!(register_custom_filter("unit-bad", bad, info(), |d| Ok(d.clone())).is_err());
    }

    #[test]
    fn test_condition_lease() {
        let handle =
            register_custom_condition("unit-nonempty", |d| Ok(d.total_size() > 0)).unwrap();
        {
            let lease = ConditionLease::acquire("unit-nonempty").unwrap();
            assert_eq!(lease.name(), "unit-nonempty");
            assert!(lease.invoke(&TensorsData::single(vec![1])).unwrap());
            assert!(!lease.invoke(&TensorsData::default()).unwrap());
        }
        handle.unregister().unwrap();
    }

    #[test]
    fn test_stale_handle_cannot_unregister_new_entry() {
        let old = register_custom_filter("unit-reused", info(), info(), |d| Ok(d.clone())).unwrap();
        old.unregister().unwrap();
        let new = register_custom_filter("unit-reused", info(), info(), |d| Ok(d.clone())).unwrap();

        let lease = FilterLease::acquire("unit-reused").unwrap();
        assert_eq!(old.ref_count(), 0);
        assert_eq!(new.ref_count(), 1);
        drop(lease);

        assert!(matches!(old.unregister(), Err(PipelineError::NotFound(_))));
        assert!(FilterLease::acquire("unit-reused").is_some());
        new.unregister().unwrap();

        let old = register_custom_condition("unit-reused-cond", |_| Ok(true)).unwrap();
        old.unregister().unwrap();
        let new = register_custom_condition("unit-reused-cond", |_| Ok(false)).unwrap();
        assert!(matches!(old.unregister(), Err(PipelineError::NotFound(_))));
        new.unregister().unwrap();
    }

    #[test]
    fn test_panicking_callbacks_become_errors() {
        let filter =
            register_custom_filter("unit-panics", info(), info(), |_| panic!("boom")).unwrap();
        let condition =
            register_custom_condition("unit-panics-cond", |_| panic!("boom")).unwrap();
        {
            let lease = FilterLease::acquire("unit-panics").unwrap();
            assert!(lease.invoke(&TensorsData::single(vec![0; 4])).is_err());
            let lease = ConditionLease::acquire("unit-panics-cond").unwrap();
            assert!(lease.invoke(&TensorsData::single(vec![0; 4])).is_err());
        }
        filter.unregister().unwrap();
        condition.unregister().unwrap();
    }
}
