//! Desired state: the boot manifest overlaid with directory requests.

use std::collections::BTreeMap;

use crate::directory::DirectoryState;
use crate::error::DecodeError;
use crate::manifest::BootManifest;
use crate::service::{ContainerSpec, RegistryEntry, ServiceSpec};

/// What this node should be running right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub node_name: String,
    pub directory_host: String,
    pub metadata: BTreeMap<String, String>,
    pub services: BTreeMap<String, ServiceSpec>,
}

impl DesiredState {
    /// Container specs for every desired service, in name order.
    pub fn containers(&self) -> Vec<ContainerSpec> {
        self.services
            .values()
            .map(|s| s.container(&self.node_name, &self.directory_host))
            .collect()
    }

    /// Registry entries for every desired service, in name order.
    pub fn registry_entries(&self) -> Vec<RegistryEntry> {
        self.services.values().map(ServiceSpec::registry_entry).collect()
    }
}

impl From<&BootManifest> for DesiredState {
    fn from(manifest: &BootManifest) -> Self {
        Self {
            node_name: manifest.node_name.clone(),
            directory_host: manifest.directory_host.clone(),
            metadata: manifest.metadata.clone(),
            services: manifest.services.clone(),
        }
    }
}

/// Overlay directory services onto a copy of the manifest's.
///
/// A directory entry replaces a manifest service of the same name. The
/// manifest itself is left untouched.
pub fn merge(
    manifest: &BootManifest,
    directory: &DirectoryState,
) -> Result<DesiredState, DecodeError> {
    let mut desired = DesiredState::from(manifest);
    for spec in directory.services()? {
        desired.services.insert(spec.name.clone(), spec);
    }
    Ok(desired)
}
