//! Observed node state.

use wake_reconcile::Named;

use crate::error::TransportError;
use crate::registry::Registry;
use crate::runtime::ContainerRuntime;
use crate::service::RegistryEntry;

/// A container currently running on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub name: String,
    pub image: String,
}

impl RunningContainer {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
        }
    }
}

impl Named for RunningContainer {
    fn name(&self) -> &str {
        &self.name
    }
}

/// What the node is actually doing, read fresh each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub containers: Vec<RunningContainer>,
    pub registry_entries: Vec<RegistryEntry>,
}

impl NodeState {
    /// Read running containers, then registered services.
    pub async fn fetch(
        runtime: &dyn ContainerRuntime,
        registry: &dyn Registry,
    ) -> Result<Self, TransportError> {
        let containers = runtime.list_running().await?;
        let registry_entries = registry.list_registered().await?;
        Ok(Self {
            containers,
            registry_entries,
        })
    }
}
