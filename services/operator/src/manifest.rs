//! Boot manifest: the node's static identity and service list.
//!
//! Loaded once at start, adjusted by command-line overrides, then treated as
//! read-only for the life of the process.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::config::{parse_duration, Config};
use crate::error::ConfigError;
use crate::service::ServiceSpec;

/// Long-poll timeout used when neither the manifest nor the command line set one.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);

/// Boot manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct BootManifest {
    /// Key/value pairs published to the directory at boot.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Services keyed by name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,

    #[serde(default, rename = "node")]
    pub node_name: String,

    #[serde(default, rename = "consul")]
    pub directory_host: String,

    #[serde(default, rename = "loop")]
    pub should_loop: bool,

    #[serde(default = "default_wait", rename = "wait", deserialize_with = "wait_from_str")]
    pub wait: Duration,
}

impl Default for BootManifest {
    fn default() -> Self {
        Self {
            metadata: BTreeMap::new(),
            services: BTreeMap::new(),
            node_name: String::new(),
            directory_host: String::new(),
            should_loop: false,
            wait: DEFAULT_WAIT,
        }
    }
}

impl BootManifest {
    /// Parse a manifest from JSON. Service names are taken from their keys.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let mut manifest: BootManifest =
            serde_json::from_str(contents).map_err(|source| ConfigError::Parse {
                what: "boot manifest",
                source,
            })?;

        for (name, service) in manifest.services.iter_mut() {
            service.name = name.clone();
        }

        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let manifest = Self::from_json(&contents)?;
        debug!(
            path = %path.display(),
            service_count = manifest.services.len(),
            "Boot manifest loaded"
        );
        Ok(manifest)
    }

    /// Apply command-line overrides and check required fields.
    pub fn apply_overrides(&mut self, config: &Config) -> Result<(), ConfigError> {
        if let Some(node_name) = &config.node_name {
            self.node_name = node_name.clone();
        }
        if let Some(host) = &config.directory_host {
            self.directory_host = host.clone();
        }
        if config.should_loop {
            self.should_loop = true;
        }
        if let Some(wait) = config.wait {
            self.wait = wait;
        }
        if let Some(raw) = &config.metadata {
            let extra: BTreeMap<String, String> =
                serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
                    what: "metadata",
                    source,
                })?;
            self.metadata.extend(extra);
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Missing("node name"));
        }
        if self.directory_host.trim().is_empty() {
            return Err(ConfigError::Missing("directory host"));
        }
        Ok(())
    }
}

fn default_wait() -> Duration {
    DEFAULT_WAIT
}

fn wait_from_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(DEFAULT_WAIT),
        Some(raw) if raw.is_empty() => Ok(DEFAULT_WAIT),
        Some(raw) => parse_duration(&raw).map_err(serde::de::Error::custom),
    }
}
