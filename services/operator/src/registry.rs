//! Service registry and directory interface, plus an in-memory mock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::DirectoryState;
use crate::error::TransportError;
use crate::service::RegistryEntry;

/// Registry and directory operations the operator depends on.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, entry: &RegistryEntry) -> Result<(), TransportError>;

    async fn deregister(&self, name: &str) -> Result<(), TransportError>;

    async fn list_registered(&self) -> Result<Vec<RegistryEntry>, TransportError>;

    /// Publish node metadata, one key at a time.
    async fn post_metadata(
        &self,
        node_name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), TransportError>;

    /// Ok if the coordination service answers.
    async fn detect_available(&self) -> Result<(), TransportError>;

    /// One blocking directory query starting from `index`.
    async fn get_directory_state(
        &self,
        node_name: &str,
        index: u64,
        wait: Duration,
    ) -> Result<DirectoryState, TransportError>;

    /// Host the directory is reached at.
    fn directory_host(&self) -> &str;
}

/// A call observed by [`MockRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register(String),
    Deregister(String),
    List,
    PostMetadata(String),
    Detect,
    Poll { index: u64 },
}

#[derive(Debug, Default)]
struct MockRegistryState {
    registered: Vec<RegistryEntry>,
    metadata: BTreeMap<String, String>,
    directory: VecDeque<Result<DirectoryState, String>>,
    last_directory: DirectoryState,
    available: bool,
    fail_list: bool,
    fail_metadata: bool,
    fail_register: Vec<String>,
    fail_deregister: Vec<String>,
    calls: Vec<RegistryCall>,
}

/// In-memory registry for testing.
///
/// Directory polls pop queued responses; once the queue is drained the last
/// successful state is returned again.
#[derive(Debug)]
pub struct MockRegistry {
    host: String,
    state: Mutex<MockRegistryState>,
}

impl MockRegistry {
    /// Create an available, empty registry.
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            state: Mutex::new(MockRegistryState {
                available: true,
                ..Default::default()
            }),
        }
    }

    /// Create a registry with `entries` already registered.
    pub fn with_registered(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let registry = Self::new();
        registry.state().registered.extend(entries);
        registry
    }

    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    pub fn fail_list(&self, fail: bool) {
        self.state().fail_list = fail;
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.state().fail_metadata = fail;
    }

    pub fn fail_register(&self, name: &str) {
        self.state().fail_register.push(name.to_string());
    }

    pub fn fail_deregister(&self, name: &str) {
        self.state().fail_deregister.push(name.to_string());
    }

    /// Queue a successful directory poll result.
    pub fn push_directory(&self, state: DirectoryState) {
        self.state().directory.push_back(Ok(state));
    }

    /// Queue a failed directory poll.
    pub fn push_directory_error(&self, message: &str) {
        self.state().directory.push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state().calls.clone()
    }

    /// Register and deregister calls only.
    pub fn mutations(&self) -> Vec<RegistryCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, RegistryCall::Register(_) | RegistryCall::Deregister(_)))
            .collect()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.state().registered.iter().map(|e| e.name.clone()).collect()
    }

    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.state().metadata.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockRegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn mock_failure(what: &str) -> TransportError {
    TransportError::Unavailable(format!("mock registry configured to fail {what}"))
}

#[async_trait]
impl Registry for MockRegistry {
    async fn register(&self, entry: &RegistryEntry) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Register(entry.name.clone()));
        if state.fail_register.contains(&entry.name) {
            return Err(mock_failure("registering"));
        }
        state.registered.retain(|e| e.name != entry.name);
        state.registered.push(entry.clone());
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Deregister(name.to_string()));
        if state.fail_deregister.iter().any(|n| n == name) {
            return Err(mock_failure("deregistering"));
        }
        state.registered.retain(|e| e.name != name);
        Ok(())
    }

    async fn list_registered(&self) -> Result<Vec<RegistryEntry>, TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::List);
        if state.fail_list {
            return Err(mock_failure("listing"));
        }
        Ok(state.registered.clone())
    }

    async fn post_metadata(
        &self,
        node_name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::PostMetadata(node_name.to_string()));
        if state.fail_metadata {
            return Err(mock_failure("posting metadata"));
        }
        state
            .metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn detect_available(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Detect);
        if state.available {
            Ok(())
        } else {
            Err(mock_failure("detection"))
        }
    }

    async fn get_directory_state(
        &self,
        _node_name: &str,
        index: u64,
        _wait: Duration,
    ) -> Result<DirectoryState, TransportError> {
        let mut state = self.state();
        state.calls.push(RegistryCall::Poll { index });

        match state.directory.pop_front() {
            Some(Ok(directory)) => {
                state.last_directory = directory.clone();
                Ok(directory)
            }
            Some(Err(message)) => Err(TransportError::Unavailable(message)),
            None => Ok(state.last_directory.clone()),
        }
    }

    fn directory_host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_mock_registry_register_deregister() {
        let registry = MockRegistry::new();

        registry.register(&entry("proxy")).await.unwrap();
        registry.register(&entry("proxy")).await.unwrap();
        assert_eq!(registry.registered_names(), vec!["proxy"]);

        registry.deregister("proxy").await.unwrap();
        assert!(registry.list_registered().await.unwrap().is_empty());
        assert_eq!(registry.mutations().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_registry_directory_queue() {
        let registry = MockRegistry::new();
        registry.push_directory(DirectoryState::empty(3));
        registry.push_directory_error("down");

        let first = registry.get_directory_state("n", 0, Duration::ZERO).await.unwrap();
        assert_eq!(first.index, 3);
        assert!(registry.get_directory_state("n", 3, Duration::ZERO).await.is_err());

        let repeated = registry.get_directory_state("n", 3, Duration::ZERO).await.unwrap();
        assert_eq!(repeated.index, 3);
        assert_eq!(
            registry.calls().last(),
            Some(&RegistryCall::Poll { index: 3 })
        );
    }

    #[tokio::test]
    async fn test_mock_registry_failures() {
        let registry = MockRegistry::new();
        registry.set_available(false);
        registry.fail_metadata(true);
        registry.fail_register("proxy");

        assert!(registry.detect_available().await.is_err());
        assert!(registry.post_metadata("n", &BTreeMap::new()).await.is_err());
        assert!(registry.register(&entry("proxy")).await.is_err());
        assert!(registry.registered_names().is_empty());
    }
}
