//! Consul HTTP client.
//!
//! Implements [`Registry`] against a Consul agent:
//! - Service registration through the local agent API
//! - Node metadata and deployment requests through the KV store
//! - Blocking KV queries for directory watches

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::format_wait;
use crate::directory::{apps_prefix, metadata_key, DirectoryState, INDEX_HEADER};
use crate::error::TransportError;
use crate::registry::Registry;
use crate::service::RegistryEntry;

/// Default Consul HTTP port.
pub const CONSUL_PORT: u16 = 8500;

/// Timeout for every call except the blocking KV query.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added on top of `wait` for the blocking KV query.
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Longest blocking wait Consul honors.
const MAX_WAIT: Duration = Duration::from_secs(10 * 60);

/// Client-side timeout for a blocking query. Consul adds up to `wait / 16`
/// of jitter on top of the requested wait.
fn poll_timeout(wait: Duration) -> Duration {
    wait.saturating_add(wait / 16).saturating_add(POLL_GRACE)
}

/// Consul agent API client.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    host: String,
    base_url: String,
}

/// One entry of `GET /v1/agent/services`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(default)]
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    name: &'a str,
    tags: &'a [String],
}

/// Base URL for `host`; hosts that already carry a scheme are used as given.
pub fn base_url(host: &str) -> String {
    if host.contains("://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{host}:{CONSUL_PORT}")
    }
}

impl ConsulClient {
    /// Create a client for the agent at `host`.
    pub fn new(host: impl Into<String>) -> Result<Self, TransportError> {
        let host = host.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url(&host),
            host,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response, url: &str) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, url = %url, body = %body, "Consul request failed");
        Err(TransportError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        })
    }
}

#[async_trait]
impl Registry for ConsulClient {
    async fn register(&self, entry: &RegistryEntry) -> Result<(), TransportError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let body = ServiceRegistration {
            name: &entry.name,
            tags: &entry.tags,
        };

        let response = self.client.put(&url).json(&body).send().await?;
        Self::check(response, &url).await?;

        info!(service = %entry.name, tags = ?entry.tags, "Service registered");
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), TransportError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, name);

        let response = self.client.put(&url).send().await?;
        Self::check(response, &url).await?;

        info!(service = %name, "Service deregistered");
        Ok(())
    }

    async fn list_registered(&self) -> Result<Vec<RegistryEntry>, TransportError> {
        let url = format!("{}/v1/agent/services", self.base_url);

        let response = self.client.get(&url).send().await?;
        let response = Self::check(response, &url).await?;

        let services: HashMap<String, AgentService> = response
            .json()
            .await
            .map_err(|e| TransportError::Body(format!("{url}: {e}")))?;

        let mut entries: Vec<RegistryEntry> = services
            .into_iter()
            .map(|(key, service)| RegistryEntry {
                name: if service.service.is_empty() {
                    key
                } else {
                    service.service
                },
                tags: service.tags.unwrap_or_default(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(count = entries.len(), "Listed registered services");
        Ok(entries)
    }

    async fn post_metadata(
        &self,
        node_name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        for (key, value) in metadata {
            let url = format!("{}/v1/kv/{}", self.base_url, metadata_key(node_name, key));

            let response = self.client.put(&url).body(value.clone()).send().await?;
            Self::check(response, &url).await?;
        }

        debug!(node = %node_name, count = metadata.len(), "Posted node metadata");
        Ok(())
    }

    async fn detect_available(&self) -> Result<(), TransportError> {
        let url = format!("{}/v1/status/leader", self.base_url);

        let response = self.client.get(&url).send().await?;
        Self::check(response, &url).await?;
        Ok(())
    }

    async fn get_directory_state(
        &self,
        node_name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<DirectoryState, TransportError> {
        let url = format!("{}/v1/kv/{}", self.base_url, apps_prefix(node_name));
        let wait = wait.min(MAX_WAIT);
        debug!(url = %url, index, wait = %format_wait(wait), "Polling directory");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("recurse", "true".to_string()),
                ("index", index.to_string()),
                ("wait", format_wait(wait)),
            ])
            .timeout(poll_timeout(wait))
            .send()
            .await?;

        let status = response.status().as_u16();
        let index_header = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        let state = DirectoryState::from_response(status, index_header.as_deref(), &body, &url)?;
        debug!(index = state.index, entries = state.entries.len(), "Directory polled");
        Ok(state)
    }

    fn directory_host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.5"), "http://10.0.0.5:8500");
        assert_eq!(base_url("http://127.0.0.1:9999/"), "http://127.0.0.1:9999");
    }

    #[test]
    fn test_poll_timeout() {
        assert_eq!(poll_timeout(Duration::ZERO), POLL_GRACE);
        assert_eq!(
            poll_timeout(Duration::from_secs(160)),
            Duration::from_secs(160 + 10) + POLL_GRACE
        );
        assert_eq!(poll_timeout(Duration::MAX), Duration::MAX);
        assert_eq!(
            poll_timeout(Duration::MAX.min(MAX_WAIT)),
            MAX_WAIT + MAX_WAIT / 16 + POLL_GRACE
        );
    }

    #[test]
    fn test_agent_service_wire_format() {
        let services: HashMap<String, AgentService> = serde_json::from_str(
            r#"{"statsite": {"ID": "statsite", "Service": "statsite", "Tags": ["statsd"], "Port": 0}}"#,
        )
        .unwrap();
        assert_eq!(services["statsite"].service, "statsite");
        assert_eq!(services["statsite"].tags.as_deref(), Some(&["statsd".to_string()][..]));
    }

    #[test]
    fn test_registration_body() {
        let tags = vec!["statsd".to_string()];
        let body = serde_json::to_value(ServiceRegistration {
            name: "statsite",
            tags: &tags,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"Name": "statsite", "Tags": ["statsd"]}));
    }
}
