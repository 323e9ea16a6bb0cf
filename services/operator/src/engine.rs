//! Normalization: converge the node onto the desired state.
//!
//! Containers are reconciled first, then registry entries. Each phase
//! starts/registers additions before stopping/deregistering removals, one
//! item at a time. A failed item does not stop the rest of the pass; every
//! failure is collected into a single [`AggregateError`].

use tracing::{info, warn};
use wake_reconcile::{Action, AggregateError, Plan};

use crate::node::NodeState;
use crate::registry::Registry;
use crate::resolver::DesiredState;
use crate::runtime::ContainerRuntime;

/// Resource kind used in failure reports for containers.
pub const KIND_CONTAINER: &str = "container";

/// Resource kind used in failure reports for registry entries.
pub const KIND_REGISTRY_ENTRY: &str = "registry entry";

/// Counts of successful changes in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub started: usize,
    pub stopped: usize,
    pub registered: usize,
    pub deregistered: usize,
}

impl NormalizeReport {
    /// Returns true if nothing was changed.
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Apply the difference between `desired` and `node`.
pub async fn normalize(
    runtime: &dyn ContainerRuntime,
    registry: &dyn Registry,
    desired: &DesiredState,
    node: &NodeState,
) -> Result<NormalizeReport, AggregateError> {
    let mut report = NormalizeReport::default();
    let mut errors = AggregateError::new();

    let containers = Plan::compute(&desired.containers(), &node.containers);
    for spec in &containers.added {
        match runtime.start(spec).await {
            Ok(()) => {
                info!(container = %spec.name, image = %spec.image, "Started container");
                report.started += 1;
            }
            Err(e) => {
                warn!(container = %spec.name, error = %e, "Failed to start container");
                errors.push(KIND_CONTAINER, spec.name.clone(), Action::Start, e);
            }
        }
    }
    for container in &containers.removed {
        match runtime.stop(&container.name).await {
            Ok(()) => {
                info!(container = %container.name, "Stopped container");
                report.stopped += 1;
            }
            Err(e) => {
                warn!(container = %container.name, error = %e, "Failed to stop container");
                errors.push(KIND_CONTAINER, container.name.clone(), Action::Stop, e);
            }
        }
    }

    let entries = Plan::compute(&desired.registry_entries(), &node.registry_entries);
    for entry in &entries.added {
        match registry.register(entry).await {
            Ok(()) => report.registered += 1,
            Err(e) => {
                warn!(service = %entry.name, error = %e, "Failed to register service");
                errors.push(KIND_REGISTRY_ENTRY, entry.name.clone(), Action::Register, e);
            }
        }
    }
    for entry in &entries.removed {
        match registry.deregister(&entry.name).await {
            Ok(()) => report.deregistered += 1,
            Err(e) => {
                warn!(service = %entry.name, error = %e, "Failed to deregister service");
                errors.push(KIND_REGISTRY_ENTRY, entry.name.clone(), Action::Deregister, e);
            }
        }
    }

    errors.into_result()?;

    if !report.is_noop() {
        info!(
            started = report.started,
            stopped = report.stopped,
            registered = report.registered,
            deregistered = report.deregistered,
            "Normalization complete"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::node::RunningContainer;
    use crate::registry::{MockRegistry, RegistryCall};
    use crate::runtime::{MockRuntime, RuntimeCall};
    use crate::service::{RegistryEntry, ServiceSpec};

    fn service(name: &str, image: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn desired(services: &[ServiceSpec]) -> DesiredState {
        DesiredState {
            node_name: "test".to_string(),
            directory_host: "127.0.0.1".to_string(),
            metadata: BTreeMap::new(),
            services: services.iter().map(|s| (s.name.clone(), s.clone())).collect(),
        }
    }

    fn entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_normalize_equal_state_is_noop() {
        let runtime = MockRuntime::new();
        let registry = MockRegistry::new();
        let desired = desired(&[service("consul", "progrium/consul:latest")]);
        let node = NodeState {
            containers: vec![RunningContainer::new("consul", "progrium/consul:latest")],
            registry_entries: vec![entry("consul")],
        };

        let report = normalize(&runtime, &registry, &desired, &node).await.unwrap();

        assert!(report.is_noop());
        assert!(runtime.calls().is_empty());
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_normalize_containers_before_registry() {
        let runtime = MockRuntime::new();
        let registry = MockRegistry::new();
        let desired = desired(&[service("proxy", "plum/wake-proxy:latest")]);
        let node = NodeState {
            containers: vec![RunningContainer::new("old", "old:latest")],
            registry_entries: vec![entry("old")],
        };

        let report = normalize(&runtime, &registry, &desired, &node).await.unwrap();

        assert_eq!(
            report,
            NormalizeReport {
                started: 1,
                stopped: 1,
                registered: 1,
                deregistered: 1
            }
        );
        assert_eq!(
            runtime.calls(),
            vec![
                RuntimeCall::Start("proxy".to_string()),
                RuntimeCall::Stop("old".to_string()),
            ]
        );
        assert_eq!(
            registry.calls(),
            vec![
                RegistryCall::Register("proxy".to_string()),
                RegistryCall::Deregister("old".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_normalize_collects_every_failure() {
        let runtime = MockRuntime::new();
        runtime.fail_start("proxy");
        let registry = MockRegistry::with_registered([entry("old")]);
        registry.fail_deregister("old");

        let desired = desired(&[
            service("proxy", "plum/wake-proxy:latest"),
            service("web", "nginx:latest"),
        ]);
        let node = NodeState {
            containers: vec![],
            registry_entries: vec![entry("old")],
        };

        let err = normalize(&runtime, &registry, &desired, &node)
            .await
            .unwrap_err();

        assert_eq!(err.len(), 2);
        assert_eq!(err.failures()[0].kind, KIND_CONTAINER);
        assert_eq!(err.failures()[0].name, "proxy");
        assert_eq!(err.failures()[0].action, Action::Start);
        assert_eq!(err.failures()[1].kind, KIND_REGISTRY_ENTRY);
        assert_eq!(err.failures()[1].action, Action::Deregister);

        // Every other item was still attempted.
        assert_eq!(runtime.running_names(), vec!["web"]);
        assert!(registry
            .calls()
            .contains(&RegistryCall::Deregister("old".to_string())));
        assert_eq!(registry.registered_names(), vec!["old", "proxy", "web"]);
    }
}
