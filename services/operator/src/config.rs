//! Configuration for the operator.
//!
//! Every flag can also be supplied through a `WAKE_*` environment variable.
//! Values given here override the matching boot manifest fields.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;

/// Operator configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "operator", about = "Keeps this node's containers and registrations in sync")]
pub struct Config {
    /// Name of the node running the operator.
    #[arg(long = "node", env = "WAKE_NODE")]
    pub node_name: Option<String>,

    /// Directory (Consul) host.
    #[arg(long = "consul", env = "WAKE_CONSUL_HOST")]
    pub directory_host: Option<String>,

    /// Path to the boot manifest.
    #[arg(long = "config", env = "WAKE_CONFIG", default_value = "./operator.json")]
    pub manifest_path: PathBuf,

    /// Keep watching the directory instead of reconciling once.
    #[arg(long = "loop", env = "WAKE_LOOP")]
    pub should_loop: bool,

    /// Long-poll timeout (e.g. `5m`, `30s`).
    #[arg(long = "wait", env = "WAKE_WAIT", value_parser = parse_wait)]
    pub wait: Option<Duration>,

    /// JSON object merged over the manifest metadata.
    #[arg(long = "metadata", env = "WAKE_METADATA")]
    pub metadata: Option<String>,

    /// Listen address for the status endpoint.
    #[arg(long = "status-addr", env = "WAKE_STATUS_ADDR", default_value = "0.0.0.0:8000")]
    pub status_addr: SocketAddr,

    /// Name of the operator's own container.
    #[arg(long = "self-name", env = "WAKE_SELF_NAME", default_value = "operator")]
    pub self_name: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", env = "WAKE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn parse_wait(value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
}

/// Parse a duration such as `5m`, `30s`, `1h30m` or `250ms`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(value.to_string());
    let input = value.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(amount.checked_mul(60 * 60).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(unit).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Render a duration the way the directory's `wait` parameter expects.
pub fn format_wait(wait: Duration) -> String {
    if wait.subsec_millis() == 0 {
        format!("{}s", wait.as_secs())
    } else {
        format!("{}ms", wait.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("5m", Duration::from_secs(300))]
    #[case("30s", Duration::from_secs(30))]
    #[case("0s", Duration::ZERO)]
    #[case("0", Duration::ZERO)]
    #[case("1h", Duration::from_secs(3600))]
    #[case("1m30s", Duration::from_secs(90))]
    #[case("250ms", Duration::from_millis(250))]
    fn test_parse_duration(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("5")]
    #[case("m")]
    #[case("5d")]
    #[case("five minutes")]
    #[case("9999999999999999999h")]
    #[case("18446744073709551615s18446744073709551615s")]
    fn test_parse_duration_rejects(#[case] input: &str) {
        assert!(matches!(
            parse_duration(input),
            Err(ConfigError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_format_wait() {
        assert_eq!(format_wait(Duration::from_secs(300)), "300s");
        assert_eq!(format_wait(Duration::ZERO), "0s");
        assert_eq!(format_wait(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_config_from_args() {
        let config = Config::try_parse_from([
            "operator",
            "--node",
            "node-1",
            "--consul",
            "10.0.0.5",
            "--loop",
            "--wait",
            "30s",
        ])
        .unwrap();

        assert_eq!(config.node_name.as_deref(), Some("node-1"));
        assert_eq!(config.directory_host.as_deref(), Some("10.0.0.5"));
        assert!(config.should_loop);
        assert_eq!(config.wait, Some(Duration::from_secs(30)));
        assert_eq!(config.manifest_path, PathBuf::from("./operator.json"));
        assert_eq!(config.self_name, "operator");
    }
}
