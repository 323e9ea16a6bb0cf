//! Error types for the operator.
//!
//! Every domain failure ends up as the state machine's last error alongside
//! a named failure state. Only [`ConfigError`] and [`wake_fsm::FsmError`]
//! stop the process.

use std::path::PathBuf;

use thiserror::Error;

/// Boot manifest or process configuration is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Manifest file could not be read.
    #[error("manifest_unreadable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest or metadata JSON is malformed.
    #[error("config_parse_failed: {what}: {source}")]
    Parse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A duration string could not be parsed.
    #[error("invalid_duration: {0:?}")]
    InvalidDuration(String),

    /// A required value was not provided by the manifest or the command line.
    #[error("missing_value: {0} must be provided")]
    Missing(&'static str),
}

impl ConfigError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::Unreadable { .. } => "manifest_unreadable",
            ConfigError::Parse { .. } => "config_parse_failed",
            ConfigError::InvalidDuration(_) => "invalid_duration",
            ConfigError::Missing(_) => "missing_value",
        }
    }
}

/// A directory entry could not be turned into a service spec.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("directory entry {key}: invalid base64 value: {source}")]
    Base64 {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("directory entry {key}: invalid service definition: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("directory entry {key}: no value")]
    Empty { key: String },
}

/// A collaborator (directory, registry, container runtime) failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request never completed (connect, timeout, body read).
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a status we do not accept.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Directory response lacked a usable `X-Consul-Index` header.
    #[error("missing or invalid X-Consul-Index header: {0}")]
    MissingIndex(String),

    /// Response body did not have the expected shape.
    #[error("invalid response body: {0}")]
    Body(String),

    /// Directory entry failed to decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// External command exited unsuccessfully.
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// External command could not be spawned.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Collaborator refused the call.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TransportError::Http(_) => "http_failed",
            TransportError::Status { .. } => "unexpected_status",
            TransportError::MissingIndex(_) => "missing_index",
            TransportError::Body(_) => "invalid_body",
            TransportError::Decode(_) => "decode_failed",
            TransportError::Command { .. } => "command_failed",
            TransportError::Io(_) => "io_error",
            TransportError::Unavailable(_) => "unavailable",
        }
    }
}

/// The coordination service could not be found or started.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// Neither the directory nor the container runtime answered.
    #[error("{service} and the container runtime are both not responding: {source}")]
    Unreachable {
        service: String,
        #[source]
        source: TransportError,
    },

    /// The container is up but the service does not answer.
    #[error("{service} is running, but not responding")]
    Unresponsive { service: String },

    /// Not running and no definition to launch it from.
    #[error("{service} is not running and is not one of the services in the boot manifest")]
    NotInManifest { service: String },

    /// Launch attempt failed.
    #[error("attempting to launch {service} failed: {source}")]
    LaunchFailed {
        service: String,
        #[source]
        source: TransportError,
    },

    /// Launch was issued; boot must be retried once it answers.
    #[error("{service} is booting")]
    Launching { service: String },
}

impl DetectionError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DetectionError::Unreachable { .. } => "unreachable",
            DetectionError::Unresponsive { .. } => "unresponsive",
            DetectionError::NotInManifest { .. } => "not_in_manifest",
            DetectionError::LaunchFailed { .. } => "launch_failed",
            DetectionError::Launching { .. } => "launching",
        }
    }

    /// Returns true if a launch was just issued.
    pub fn is_launching(&self) -> bool {
        matches!(self, DetectionError::Launching { .. })
    }
}
