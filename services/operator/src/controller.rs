//! Agent controller: boot, bootstrap loop, and the directory watch loop.
//!
//! Every operational failure moves the state machine into a named failure
//! state carrying the error and is retried by the surrounding loop. The only
//! error the controller returns is a [`MachineError`], which means the
//! transition table or the machine actor is broken.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wake_fsm::SharedError;
use wake_reconcile::IndexCursor;

use crate::engine::normalize;
use crate::error::DetectionError;
use crate::machine::{AgentState, MachineError, MachineHandle};
use crate::manifest::BootManifest;
use crate::node::NodeState;
use crate::registry::Registry;
use crate::resolver::{merge, DesiredState};
use crate::runtime::ContainerRuntime;

/// Name of the coordination service the operator depends on.
pub const COORDINATION_SERVICE: &str = "consul";

/// Sleep intervals used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTimings {
    /// Wait after launching the coordination service.
    pub boot_settle: Duration,
    /// Wait between boot attempts.
    pub boot_retry: Duration,
    /// Wait after a tick that ended in `Running`.
    pub healthy_interval: Duration,
    /// Wait after any other tick.
    pub unhealthy_interval: Duration,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            boot_settle: Duration::from_secs(1),
            boot_retry: Duration::from_secs(6),
            healthy_interval: Duration::from_secs(1),
            unhealthy_interval: Duration::from_secs(6),
        }
    }
}

impl ControllerTimings {
    /// No sleeping at all.
    pub fn immediate() -> Self {
        Self {
            boot_settle: Duration::ZERO,
            boot_retry: Duration::ZERO,
            healthy_interval: Duration::ZERO,
            unhealthy_interval: Duration::ZERO,
        }
    }
}

/// Result of one boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Booted,
    /// The coordination service was just launched.
    StillBooting,
    Failed,
}

/// Drives the node from boot through steady-state reconciliation.
pub struct AgentController {
    manifest: BootManifest,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn Registry>,
    machine: MachineHandle,
    timings: ControllerTimings,
}

fn shared<E>(error: E) -> SharedError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Arc::new(error)
}

impl AgentController {
    pub fn new(
        manifest: BootManifest,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn Registry>,
        machine: MachineHandle,
    ) -> Self {
        Self {
            manifest,
            runtime,
            registry,
            machine,
            timings: ControllerTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: ControllerTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn manifest(&self) -> &BootManifest {
        &self.manifest
    }

    pub fn machine(&self) -> &MachineHandle {
        &self.machine
    }

    /// Containers get the directory host the registry actually talks to.
    fn bind_host(&self, mut desired: DesiredState) -> DesiredState {
        desired.directory_host = self.registry.directory_host().to_string();
        desired
    }

    async fn fail(&self, state: AgentState, error: SharedError) -> Result<(), MachineError> {
        error!(state = %state, error = %error, "Step failed");
        self.machine.transition(state, Some(error)).await
    }

    /// One boot attempt.
    pub async fn boot(&self) -> Result<BootOutcome, MachineError> {
        if !self.machine.is_currently(AgentState::Booting).await? {
            info!(node = %self.manifest.node_name, "Booting");
            self.machine.transition(AgentState::Booting, None).await?;
        }

        if let Err(e) = self.detect_or_launch().await {
            let outcome = if e.is_launching() {
                BootOutcome::StillBooting
            } else {
                BootOutcome::Failed
            };
            self.fail(AgentState::DetectionFailed, shared(e)).await?;
            return Ok(outcome);
        }

        debug!(metadata = ?self.manifest.metadata, "Posting node metadata");
        if let Err(e) = self
            .registry
            .post_metadata(&self.manifest.node_name, &self.manifest.metadata)
            .await
        {
            self.fail(AgentState::PostingMetadataFailed, shared(e)).await?;
            return Ok(BootOutcome::Failed);
        }

        let node = match NodeState::fetch(self.runtime.as_ref(), self.registry.as_ref()).await {
            Ok(node) => node,
            Err(e) => {
                self.fail(AgentState::FetchingNodeStateFailed, shared(e)).await?;
                return Ok(BootOutcome::Failed);
            }
        };

        let desired = self.bind_host(DesiredState::from(&self.manifest));
        if let Err(e) = normalize(self.runtime.as_ref(), self.registry.as_ref(), &desired, &node).await {
            self.fail(AgentState::NormalizingFailed, shared(e)).await?;
            return Ok(BootOutcome::Failed);
        }

        self.machine.transition(AgentState::Booted, None).await?;
        info!(node = %self.manifest.node_name, "Booted");
        Ok(BootOutcome::Booted)
    }

    /// Make sure the coordination service answers, launching it if needed.
    async fn detect_or_launch(&self) -> Result<(), DetectionError> {
        let service = COORDINATION_SERVICE.to_string();

        let detect_error = match self.registry.detect_available().await {
            Ok(()) => {
                debug!(service = %service, "Coordination service detected");
                return Ok(());
            }
            Err(e) => e,
        };
        warn!(service = %service, error = %detect_error, "Detection failed, checking the container runtime");

        let running = self
            .runtime
            .list_running()
            .await
            .map_err(|source| DetectionError::Unreachable {
                service: service.clone(),
                source,
            })?;

        if running.iter().any(|c| c.name == service) {
            return Err(DetectionError::Unresponsive { service });
        }

        let spec = self
            .manifest
            .services
            .get(&service)
            .ok_or_else(|| DetectionError::NotInManifest {
                service: service.clone(),
            })?;
        let container = spec.container(&self.manifest.node_name, self.registry.directory_host());

        info!(service = %service, image = %container.image, "Launching coordination service");
        self.runtime
            .start(&container)
            .await
            .map_err(|source| DetectionError::LaunchFailed {
                service: service.clone(),
                source,
            })?;

        tokio::time::sleep(self.timings.boot_settle).await;
        Err(DetectionError::Launching { service })
    }

    /// Boot until `Booted`. Returns false if shutdown was requested first.
    pub async fn run_until_booted(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, MachineError> {
        loop {
            match self.boot().await? {
                BootOutcome::Booted => return Ok(true),
                outcome => {
                    debug!(?outcome, retry_in = ?self.timings.boot_retry, "Boot incomplete");
                }
            }

            if !sleep_or_shutdown(self.timings.boot_retry, shutdown).await {
                return Ok(false);
            }
        }
    }

    /// One reconciliation pass against the directory.
    ///
    /// Returns the polled index when the pass ends in `Running`.
    pub async fn tick(&self, index: u64, wait: Duration) -> Result<Option<u64>, MachineError> {
        let current = self.machine.current().await?;
        if !matches!(current.name(), AgentState::Running | AgentState::Booted) {
            self.machine
                .transition(AgentState::AttemptingToRecover, current.error().cloned())
                .await?;
        }

        let directory = match self
            .registry
            .get_directory_state(&self.manifest.node_name, index, wait)
            .await
        {
            Ok(directory) => directory,
            Err(e) => {
                self.fail(AgentState::FetchingDirectoryStateFailed, shared(e)).await?;
                return Ok(None);
            }
        };
        debug!(index = directory.index, entries = directory.entries.len(), "Directory state fetched");

        let desired = match merge(&self.manifest, &directory) {
            Ok(desired) => self.bind_host(desired),
            Err(e) => {
                self.fail(AgentState::MergingStateFailed, shared(e)).await?;
                return Ok(None);
            }
        };

        let node = match NodeState::fetch(self.runtime.as_ref(), self.registry.as_ref()).await {
            Ok(node) => node,
            Err(e) => {
                self.fail(AgentState::FetchingNodeStateFailed, shared(e)).await?;
                return Ok(None);
            }
        };

        if let Err(e) = normalize(self.runtime.as_ref(), self.registry.as_ref(), &desired, &node).await {
            self.fail(AgentState::NormalizingFailed, shared(e)).await?;
            return Ok(None);
        }

        if !self.machine.is_currently(AgentState::Running).await? {
            self.machine.transition(AgentState::Running, None).await?;
        }
        Ok(Some(directory.index))
    }

    /// A single non-blocking pass.
    pub async fn once(&self) -> Result<Option<u64>, MachineError> {
        self.tick(0, Duration::ZERO).await
    }

    /// Watch the directory until shutdown.
    ///
    /// Shutdown is only observed between ticks.
    pub async fn run_loop(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), MachineError> {
        let mut cursor = IndexCursor::default();

        loop {
            let delay = match self.tick(cursor.get(), self.manifest.wait).await? {
                Some(index) => {
                    if index < cursor.get() {
                        warn!(previous = cursor.get(), index, "Directory index went backwards, resetting");
                        cursor.reset();
                    }
                    cursor.advance(index);
                    info!(index = cursor.get(), "Iteration complete");
                    self.timings.healthy_interval
                }
                None => {
                    let state = self.machine.current().await?;
                    warn!(state = %state, "Iteration ended outside Running");
                    self.timings.unhealthy_interval
                }
            };

            if !sleep_or_shutdown(delay, shutdown).await {
                info!("Control loop stopping");
                return Ok(());
            }
        }
    }

    /// Boot, then loop or run once depending on the manifest.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MachineError> {
        if !self.run_until_booted(&mut shutdown).await? {
            return Ok(());
        }

        if self.manifest.should_loop {
            self.run_loop(&mut shutdown).await
        } else {
            self.once().await.map(|_| ())
        }
    }
}

/// Sleep for `delay`. Returns false if shutdown was signalled.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryState;
    use crate::machine::{new_machine, MachineActor};
    use crate::registry::{MockRegistry, RegistryCall};
    use crate::runtime::MockRuntime;

    fn polled_indices(registry: &MockRegistry) -> Vec<u64> {
        registry
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RegistryCall::Poll { index } => Some(index),
                _ => None,
            })
            .collect()
    }

    fn controller(should_loop: bool) -> (AgentController, Arc<MockRuntime>, Arc<MockRegistry>) {
        let mut manifest = BootManifest::from_json(
            r#"{"node": "test", "consul": "127.0.0.1", "wait": "0s"}"#,
        )
        .unwrap();
        manifest.should_loop = should_loop;

        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(MockRegistry::new());
        let machine = MachineActor::spawn(new_machine().unwrap());
        let controller = AgentController::new(manifest, runtime.clone(), registry.clone(), machine)
            .with_timings(ControllerTimings::immediate());
        (controller, runtime, registry)
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::ZERO, &mut rx).await);

        tx.send(true).unwrap();
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);

        drop(tx);
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
    }

    #[tokio::test]
    async fn test_run_once() {
        let (controller, _runtime, _registry) = controller(false);
        let (_tx, rx) = watch::channel(false);

        controller.run(rx).await.unwrap();
        assert!(controller.machine().is_currently(AgentState::Running).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let (controller, _runtime, registry) = controller(true);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { controller.run(rx).await });
        while registry.calls().len() < 5 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_cursor_follows_running_ticks() {
        let (controller, _runtime, registry) = controller(true);
        registry.push_directory(DirectoryState::empty(5));
        registry.push_directory_error("leader election");
        registry.push_directory(DirectoryState::empty(3));
        registry.push_directory(DirectoryState::empty(7));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { controller.run(rx).await });
        while polled_indices(&registry).len() < 5 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Held after the failed poll, reset when the index went backwards.
        assert_eq!(polled_indices(&registry)[..5], [0, 5, 5, 3, 7]);
    }

    #[tokio::test]
    async fn test_shutdown_during_boot_retry() {
        let (controller, _runtime, registry) = controller(false);
        registry.fail_metadata(true);
        let (tx, rx) = watch::channel(true);
        drop(tx);

        controller.run(rx).await.unwrap();
        assert!(controller
            .machine()
            .is_currently(AgentState::PostingMetadataFailed)
            .await
            .unwrap());
    }
}
