//! Directory (Consul KV) data model.
//!
//! Deployment requests live under `_wakeful/nodes/{node}/apps/`. Each key's
//! last path segment is a service name and its value is a base64-encoded
//! [`ServiceSpec`] JSON document.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, TransportError};
use crate::service::ServiceSpec;

/// Top-level namespace for everything the operator reads or writes.
pub const KV_PREFIX: &str = "_wakeful/nodes";

/// Header carrying the directory's blocking-query index.
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// KV prefix holding this node's deployment requests.
pub fn apps_prefix(node_name: &str) -> String {
    format!("{KV_PREFIX}/{node_name}/apps/")
}

/// KV key for one metadata value.
pub fn metadata_key(node_name: &str, key: &str) -> String {
    format!("{KV_PREFIX}/{node_name}/metadata/{key}")
}

/// One KV pair as returned by a recursive read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryEntry {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub modify_index: u64,
}

impl DirectoryEntry {
    /// Build an entry holding `spec` JSON, encoded the way the directory stores it.
    pub fn encode(key: impl Into<String>, json: &str, modify_index: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(STANDARD.encode(json)),
            modify_index,
        }
    }

    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Folder placeholders end with `/` and carry no service.
    pub fn is_folder(&self) -> bool {
        self.key.ends_with('/')
    }

    /// Decode the value into a service spec named after the key.
    pub fn decode(&self) -> Result<ServiceSpec, DecodeError> {
        let raw = self
            .value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| DecodeError::Empty {
                key: self.key.clone(),
            })?;

        let bytes = STANDARD.decode(raw).map_err(|source| DecodeError::Base64 {
            key: self.key.clone(),
            source,
        })?;

        let mut spec: ServiceSpec =
            serde_json::from_slice(&bytes).map_err(|source| DecodeError::Json {
                key: self.key.clone(),
                source,
            })?;
        spec.name = self.name().to_string();
        Ok(spec)
    }
}

/// One long-poll result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryState {
    /// Index to pass to the next blocking query.
    pub index: u64,
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryState {
    pub fn empty(index: u64) -> Self {
        Self {
            index,
            entries: Vec::new(),
        }
    }

    /// Decode every entry, failing on the first bad one.
    pub fn services(&self) -> Result<Vec<ServiceSpec>, DecodeError> {
        self.entries.iter().map(DirectoryEntry::decode).collect()
    }

    /// Interpret a KV read response.
    ///
    /// 200 carries a JSON entry list, 404 means the prefix is empty. Both
    /// must carry a valid index header. Folder keys are dropped and every
    /// remaining entry must decode.
    pub fn from_response(
        status: u16,
        index_header: Option<&str>,
        body: &str,
        url: &str,
    ) -> Result<Self, TransportError> {
        if status != 200 && status != 404 {
            return Err(TransportError::Status {
                status,
                url: url.to_string(),
                body: body.to_string(),
            });
        }

        let index = index_header
            .ok_or_else(|| TransportError::MissingIndex(url.to_string()))?
            .trim()
            .parse::<u64>()
            .map_err(|_| TransportError::MissingIndex(url.to_string()))?;

        if status == 404 {
            return Ok(Self::empty(index));
        }

        let entries: Vec<DirectoryEntry> = serde_json::from_str(body)
            .map_err(|e| TransportError::Body(format!("{url}: {e}")))?;
        let entries: Vec<DirectoryEntry> =
            entries.into_iter().filter(|e| !e.is_folder()).collect();

        for entry in &entries {
            entry.decode()?;
        }

        Ok(Self { index, entries })
    }
}
