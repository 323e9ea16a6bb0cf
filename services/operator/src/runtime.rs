//! Container runtime interface, Docker CLI implementation and mock.
//!
//! The runtime abstracts the three operations reconciliation needs:
//! - Starting a container from a [`ContainerSpec`]
//! - Stopping (and removing) a container by name
//! - Listing running containers, excluding the operator's own
//!
//! A mock implementation is provided for testing.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::node::RunningContainer;
use crate::service::ContainerSpec;

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container.
    async fn start(&self, spec: &ContainerSpec) -> Result<(), TransportError>;

    /// Stop a container and remove it.
    async fn stop(&self, name: &str) -> Result<(), TransportError>;

    /// Running containers, never including the operator itself.
    async fn list_running(&self) -> Result<Vec<RunningContainer>, TransportError>;
}

/// Runtime backed by the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
    self_name: String,
}

impl DockerRuntime {
    /// `self_name` is the operator's own container, hidden from listings.
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            self_name: self_name.into(),
        }
    }

    /// Use a different executable (tests, non-PATH installs).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn exec(&self, args: &[String]) -> Result<String, TransportError> {
        debug!(binary = %self.binary, ?args, "Running container command");
        let output = Command::new(&self.binary).args(args).output().await?;

        if !output.status.success() {
            return Err(TransportError::Command {
                command: format!("{} {}", self.binary, args.join(" ")),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Arguments for `docker run`.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(restart) = &spec.restart_policy {
        args.push("--restart".to_string());
        args.push(restart.clone());
    }

    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image.clone());
    args
}

/// Parse `docker ps --format "{{.Names}} {{.Image}}"` output.
pub fn parse_ps_output(
    output: &str,
    self_name: &str,
) -> Result<Vec<RunningContainer>, TransportError> {
    let mut containers = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, image] = fields.as_slice() else {
            return Err(TransportError::Body(format!(
                "unexpected container listing line: {line:?}"
            )));
        };

        if *name == self_name {
            continue;
        }
        containers.push(RunningContainer::new(*name, *image));
    }

    Ok(containers)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<(), TransportError> {
        self.exec(&run_args(spec)).await?;
        info!(container = %spec.name, image = %spec.image, "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), TransportError> {
        self.exec(&["stop".to_string(), name.to_string()]).await?;
        self.exec(&["rm".to_string(), name.to_string()]).await?;
        info!(container = %name, "Container stopped and removed");
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>, TransportError> {
        let output = self
            .exec(&[
                "ps".to_string(),
                "--format".to_string(),
                "{{.Names}} {{.Image}}".to_string(),
            ])
            .await?;
        parse_ps_output(&output, &self.self_name)
    }
}

/// A call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
    List,
}

#[derive(Debug, Default)]
struct MockRuntimeState {
    running: Vec<RunningContainer>,
    calls: Vec<RuntimeCall>,
    fail_list: bool,
    fail_start: HashSet<String>,
    fail_stop: HashSet<String>,
}

/// In-memory runtime for testing.
///
/// Containers it "starts" show up in later listings; a container named
/// like the operator is hidden the same way [`DockerRuntime`] hides it.
#[derive(Debug)]
pub struct MockRuntime {
    self_name: String,
    state: Mutex<MockRuntimeState>,
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self {
            self_name: "operator".to_string(),
            state: Mutex::new(MockRuntimeState::default()),
        }
    }

    /// Create a mock runtime that already has `containers` running.
    pub fn with_running(containers: impl IntoIterator<Item = RunningContainer>) -> Self {
        let runtime = Self::new();
        runtime.state().running.extend(containers);
        runtime
    }

    /// Make `list_running` fail.
    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    /// Make starting `name` fail.
    pub fn fail_start(&self, name: &str) {
        self.state().fail_start.insert(name.to_string());
    }

    /// Make stopping `name` fail.
    pub fn fail_stop(&self, name: &str) {
        self.state().fail_stop.insert(name.to_string());
    }

    /// Every call in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state().calls.clone()
    }

    /// Start and stop calls only.
    pub fn mutations(&self) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, RuntimeCall::List))
            .collect()
    }

    /// Names of running containers, including the operator's.
    pub fn running_names(&self) -> Vec<String> {
        self.state().running.iter().map(|c| c.name.clone()).collect()
    }

    fn state(&self) -> MutexGuard<'_, MockRuntimeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Start(spec.name.clone()));

        if state.fail_start.contains(&spec.name) {
            return Err(TransportError::Unavailable(format!(
                "mock runtime configured to fail starting {}",
                spec.name
            )));
        }

        state
            .running
            .push(RunningContainer::new(spec.name.clone(), spec.image.clone()));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::Stop(name.to_string()));

        if state.fail_stop.contains(name) {
            return Err(TransportError::Unavailable(format!(
                "mock runtime configured to fail stopping {name}"
            )));
        }

        state.running.retain(|c| c.name != name);
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningContainer>, TransportError> {
        let mut state = self.state();
        state.calls.push(RuntimeCall::List);

        if state.fail_list {
            return Err(TransportError::Unavailable(
                "mock runtime configured to fail listing".to_string(),
            ));
        }

        Ok(state
            .running
            .iter()
            .filter(|c| c.name != self.self_name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::rstest;

    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "statsite".to_string(),
            image: "wakeful/wake-statsite:latest".to_string(),
            ports: vec!["8125:8125/udp".to_string()],
            env: BTreeMap::from([
                ("NODE".to_string(), "node-1".to_string()),
                ("SERVICENAME".to_string(), "statsite".to_string()),
            ]),
            restart_policy: Some("always".to_string()),
        }
    }

    #[test]
    fn test_run_args() {
        assert_eq!(
            run_args(&spec()),
            vec![
                "run",
                "-d",
                "--name",
                "statsite",
                "--restart",
                "always",
                "-p",
                "8125:8125/udp",
                "-e",
                "NODE=node-1",
                "-e",
                "SERVICENAME=statsite",
                "wakeful/wake-statsite:latest",
            ]
        );
    }

    #[test]
    fn test_run_args_without_restart() {
        let mut spec = spec();
        spec.restart_policy = None;
        spec.ports.clear();
        spec.env.clear();
        assert_eq!(
            run_args(&spec),
            vec!["run", "-d", "--name", "statsite", "wakeful/wake-statsite:latest"]
        );
    }

    #[rstest]
    #[case("", vec![])]
    #[case("\n\n", vec![])]
    #[case("consul progrium/consul:latest\n", vec![("consul", "progrium/consul:latest")])]
    #[case(
        "operator wakeful/operator:latest\nconsul progrium/consul:latest\nstatsite wakeful/wake-statsite:latest\n",
        vec![("consul", "progrium/consul:latest"), ("statsite", "wakeful/wake-statsite:latest")]
    )]
    fn test_parse_ps_output(#[case] output: &str, #[case] expected: Vec<(&str, &str)>) {
        let parsed = parse_ps_output(output, "operator").unwrap();
        let expected: Vec<_> = expected
            .into_iter()
            .map(|(n, i)| RunningContainer::new(n, i))
            .collect();
        assert_eq!(parsed, expected);
    }

    #[rstest]
    #[case("consul")]
    #[case("consul progrium/consul:latest extra")]
    fn test_parse_ps_output_rejects_bad_lines(#[case] output: &str) {
        assert!(parse_ps_output(output, "operator").is_err());
    }

    #[tokio::test]
    async fn test_docker_missing_binary() {
        let runtime = DockerRuntime::new("operator").with_binary("/nonexistent/docker");
        let err = runtime.list_running().await.unwrap_err();
        assert_eq!(err.reason_code(), "io_error");
    }

    #[tokio::test]
    async fn test_mock_runtime_start_stop() {
        let runtime = MockRuntime::new();

        runtime.start(&spec()).await.unwrap();
        assert_eq!(runtime.list_running().await.unwrap().len(), 1);

        runtime.stop("statsite").await.unwrap();
        assert!(runtime.list_running().await.unwrap().is_empty());

        assert_eq!(
            runtime.mutations(),
            vec![
                RuntimeCall::Start("statsite".to_string()),
                RuntimeCall::Stop("statsite".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_mock_runtime_hides_self() {
        let runtime = MockRuntime::with_running([
            RunningContainer::new("operator", "wakeful/operator:latest"),
            RunningContainer::new("consul", "progrium/consul:latest"),
        ]);

        let running = runtime.list_running().await.unwrap();
        assert_eq!(running, vec![RunningContainer::new("consul", "progrium/consul:latest")]);
    }

    #[tokio::test]
    async fn test_mock_runtime_failures() {
        let runtime = MockRuntime::new();
        runtime.fail_start("statsite");
        runtime.fail_list(true);

        assert!(runtime.start(&spec()).await.is_err());
        assert!(runtime.list_running().await.is_err());
        assert!(runtime.running_names().is_empty());
    }
}
