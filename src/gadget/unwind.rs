//! Unwinder: reverse-order teardown of everything a build created

use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use super::registry::{EntityRegistry, RegistryEntry};
use super::store::{GadgetStore, NodeKind};
use crate::error::AppError;

/// What to do when one removal fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnwindPolicy {
    /// Keep going and collect every failure
    #[default]
    BestEffort,
    /// Stop at the first failure
    FailFast,
}

/// A removal that did not succeed
#[derive(Debug, Serialize)]
pub struct ResidualError {
    pub kind: NodeKind,
    pub name: String,
    #[serde(serialize_with = "serialize_error")]
    pub error: AppError,
}

fn serialize_error<S: Serializer>(error: &AppError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

/// Outcome of one unwind pass
#[derive(Debug, Serialize)]
pub struct UnwindReport {
    pub fully_clean: bool,
    /// Entities removed, in the order they were removed
    pub removed: Vec<(NodeKind, String)>,
    pub residual_errors: Vec<ResidualError>,
}

impl UnwindReport {
    fn clean() -> Self {
        Self {
            fully_clean: true,
            removed: Vec::new(),
            residual_errors: Vec::new(),
        }
    }

    /// Log every residual error at warn level
    pub fn log_residuals(&self) {
        for residual in &self.residual_errors {
            warn!(
                "Residual {} '{}' after unwind: {}",
                residual.kind, residual.name, residual.error
            );
        }
    }
}

impl Default for UnwindReport {
    fn default() -> Self {
        Self::clean()
    }
}

/// Walks a creation log backwards, removing each entity from the store
#[derive(Debug, Clone, Copy, Default)]
pub struct Unwinder {
    policy: UnwindPolicy,
}

impl Unwinder {
    pub fn new(policy: UnwindPolicy) -> Self {
        Self { policy }
    }

    /// Remove the entities of `snapshot` (creation order) newest first
    ///
    /// Never fails: problems end up in the report.
    pub fn unwind_snapshot<S>(&self, store: &mut S, snapshot: &[RegistryEntry]) -> UnwindReport
    where
        S: GadgetStore + ?Sized,
    {
        let mut report = UnwindReport::clean();

        for entry in snapshot.iter().rev() {
            match store.remove(&entry.node) {
                Ok(()) => {
                    debug!("Unwound {} '{}'", entry.kind, entry.name);
                    report.removed.push((entry.kind, entry.name.clone()));
                }
                Err(error) => {
                    debug!("Failed to unwind {} '{}': {}", entry.kind, entry.name, error);
                    report.fully_clean = false;
                    report.residual_errors.push(ResidualError {
                        kind: entry.kind,
                        name: entry.name.clone(),
                        error,
                    });
                    if self.policy == UnwindPolicy::FailFast {
                        break;
                    }
                }
            }
        }

        report
    }

    /// Unwind everything in `registry`, unregistering what was removed
    ///
    /// Entries whose removal failed stay registered, so a later pass only
    /// retries those. An empty registry yields a clean, empty report.
    pub fn unwind<S>(&self, store: &mut S, registry: &mut EntityRegistry) -> UnwindReport
    where
        S: GadgetStore + ?Sized,
    {
        if registry.is_empty() {
            return UnwindReport::clean();
        }

        let snapshot = registry.snapshot();
        info!("Unwinding {} entities", snapshot.len());
        let report = self.unwind_snapshot(store, &snapshot);

        for (kind, name) in &report.removed {
            if let Err(e) = registry.unregister(*kind, name) {
                warn!("Registry out of sync while unwinding: {}", e);
            }
        }

        if report.fully_clean {
            info!("Unwind complete, {} entities removed", report.removed.len());
        } else {
            warn!(
                "Unwind left {} residual entities",
                report.residual_errors.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::testing::{sample_plan, FaultyStore, Fault};
    use crate::gadget::memory::{MemoryStore, StoreOp};
    use crate::gadget::store::NodeSpec;
    use std::path::Path;

    fn populate(store: &mut impl GadgetStore, registry: &mut EntityRegistry) {
        let plan = sample_plan();
        let gadget = store.create_node(None, NodeSpec::Gadget(&plan.gadget)).unwrap();
        registry.register_node(gadget.clone()).unwrap();
        let mut functions = Vec::new();
        for f in &plan.functions {
            let node = store.create_node(Some(&gadget), NodeSpec::Function(f)).unwrap();
            registry.register_node(node.clone()).unwrap();
            functions.push(node);
        }
        let config = store
            .create_node(Some(&gadget), NodeSpec::Config(&plan.configs[0]))
            .unwrap();
        registry.register_node(config.clone()).unwrap();
        for f in &functions {
            let binding = store.bind(&config, f, &f.name).unwrap();
            registry.register_node(binding).unwrap();
        }
    }

    #[test]
    fn test_reverse_order() {
        let mut store = MemoryStore::initialize(Path::new("/mem/unwind-order")).unwrap();
        let mut registry = EntityRegistry::new();
        populate(&mut store, &mut registry);
        let created = registry.list_created_in_order();
        let ops_before = store.ops().len();

        let report = Unwinder::default().unwind(&mut store, &mut registry);
        assert!(report.fully_clean);
        assert!(registry.is_empty());
        assert!(store.is_empty());

        // Exactly one removal per entity, newest first
        let mut expected = created.clone();
        expected.reverse();
        assert_eq!(report.removed, expected);
        assert_eq!(store.ops().len() - ops_before, created.len());
        assert_eq!(
            store.ops()[ops_before],
            StoreOp::Unbind {
                name: "c.1/ncm.usb0".to_string()
            }
        );
    }

    #[test]
    fn test_unwind_empty_is_clean() {
        let mut store = MemoryStore::initialize(Path::new("/mem/unwind-empty")).unwrap();
        let mut registry = EntityRegistry::new();

        for _ in 0..2 {
            let report = Unwinder::default().unwind(&mut store, &mut registry);
            assert!(report.fully_clean);
            assert!(report.residual_errors.is_empty());
            assert!(report.removed.is_empty());
        }
    }

    #[test]
    fn test_best_effort_continues() {
        let inner = MemoryStore::initialize(Path::new("/mem/unwind-best-effort")).unwrap();
        let mut store = FaultyStore::new(inner);
        let mut registry = EntityRegistry::new();
        populate(&mut store, &mut registry);
        store.fail(Fault::Delete("c.1"));

        let report = Unwinder::new(UnwindPolicy::BestEffort).unwind(&mut store, &mut registry);
        assert!(!report.fully_clean);
        // Bindings and both functions go; the gadget still holds the config
        assert_eq!(report.removed.len(), 4);
        assert_eq!(report.residual_errors.len(), 2);
        assert_eq!(report.residual_errors[0].name, "c.1");
        assert!(matches!(
            report.residual_errors[0].error,
            AppError::StoreIo { .. }
        ));
        assert_eq!(report.residual_errors[1].name, "g1");
        assert!(matches!(
            report.residual_errors[1].error,
            AppError::HasDependents { .. }
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_unbind_keeps_dependents() {
        let inner = MemoryStore::initialize(Path::new("/mem/unwind-unbind")).unwrap();
        let mut store = FaultyStore::new(inner);
        let mut registry = EntityRegistry::new();
        populate(&mut store, &mut registry);
        store.fail(Fault::Unbind("c.1/ffs.usb0"));

        let report = Unwinder::new(UnwindPolicy::BestEffort).unwind(&mut store, &mut registry);
        assert!(!report.fully_clean);
        assert_eq!(
            report.removed,
            vec![
                (NodeKind::Binding, "c.1/ncm.usb0".to_string()),
                (NodeKind::Function, "ncm.usb0".to_string()),
            ]
        );
        let residual: Vec<&str> = report
            .residual_errors
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(residual, vec!["c.1/ffs.usb0", "c.1", "ffs.usb0", "g1"]);
        assert!(matches!(
            report.residual_errors[0].error,
            AppError::StoreIo { .. }
        ));
        // The surviving link pins both its config and its target
        assert!(matches!(
            report.residual_errors[1].error,
            AppError::HasDependents { .. }
        ));
        assert!(matches!(
            report.residual_errors[2].error,
            AppError::HasDependents { .. }
        ));
        assert_eq!(registry.len(), 4);
        assert!(store.calls().contains(&"unbind c.1/ffs.usb0".to_string()));
    }

    #[test]
    fn test_fail_fast_stops() {
        let inner = MemoryStore::initialize(Path::new("/mem/unwind-fail-fast")).unwrap();
        let mut store = FaultyStore::new(inner);
        let mut registry = EntityRegistry::new();
        populate(&mut store, &mut registry);
        store.fail(Fault::Delete("c.1"));

        let report = Unwinder::new(UnwindPolicy::FailFast).unwind(&mut store, &mut registry);
        assert!(!report.fully_clean);
        assert_eq!(report.residual_errors.len(), 1);
        assert_eq!(report.removed.len(), 2);

        // Retry once the fault is gone only touches what is left
        store.clear_faults();
        let report = Unwinder::default().unwind(&mut store, &mut registry);
        assert!(report.fully_clean);
        assert_eq!(report.removed.len(), 4);
        assert!(store.inner().is_empty());
    }
}
