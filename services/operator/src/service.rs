//! Service definitions and the resources derived from them.
//!
//! A [`ServiceSpec`] is what the boot manifest and directory entries
//! describe. Reconciliation works on the two projections of it:
//! a [`ContainerSpec`] for the runtime and a [`RegistryEntry`] for the
//! registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use wake_reconcile::Named;

/// Env key carrying the service's own name.
pub const ENV_SERVICE_NAME: &str = "SERVICENAME";

/// Env key carrying the node name.
pub const ENV_NODE: &str = "NODE";

/// Env key carrying the directory host.
pub const ENV_DIRECTORY_HOST: &str = "DIRECTORYHOST";

/// Host/container port pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    #[serde(default)]
    pub incoming: u16,
    #[serde(default)]
    pub outgoing: u16,
    #[serde(default)]
    pub udp: bool,
}

impl PortPair {
    /// Render as a runtime port mapping (`8125:8125/udp`).
    pub fn mapping(&self) -> String {
        if self.udp {
            format!("{}:{}/udp", self.incoming, self.outgoing)
        } else {
            format!("{}:{}", self.incoming, self.outgoing)
        }
    }
}

/// A service that should run on this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique key; always taken from the manifest key or directory path.
    #[serde(default)]
    pub name: String,

    pub image: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<PortPair>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub env: BTreeMap<String, String>,

    #[serde(default, rename = "restart", deserialize_with = "null_as_default")]
    pub restart_policy: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
}

impl ServiceSpec {
    /// User env plus the node identity keys.
    pub fn full_env(&self, node_name: &str, directory_host: &str) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert(ENV_SERVICE_NAME.to_string(), self.name.clone());
        env.insert(ENV_NODE.to_string(), node_name.to_string());
        env.insert(ENV_DIRECTORY_HOST.to_string(), directory_host.to_string());
        env
    }

    pub fn container(&self, node_name: &str, directory_host: &str) -> ContainerSpec {
        ContainerSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            ports: self.ports.iter().map(PortPair::mapping).collect(),
            env: self.full_env(node_name, directory_host),
            restart_policy: Some(self.restart_policy.clone()).filter(|r| !r.is_empty()),
        }
    }

    pub fn registry_entry(&self) -> RegistryEntry {
        RegistryEntry {
            name: self.name.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl Named for ServiceSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Everything the runtime needs to start a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub restart_policy: Option<String>,
}

impl Named for ContainerSpec {
    fn name(&self) -> &str {
        &self.name
    }
}

/// A service registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Named for RegistryEntry {
    fn name(&self) -> &str {
        &self.name
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
