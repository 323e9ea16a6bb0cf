//! wake operator
//!
//! The operator runs on each host and keeps the node's containers and
//! service registrations in line with a desired state built from a local
//! boot manifest and the shared directory.
//!
//! ## Architecture
//!
//! - **Machine**: lifecycle state machine owned by an actor task
//! - **Controller**: boot sequence, bootstrap loop and directory watch loop
//! - **Resolver**: merges the manifest with directory requests
//! - **Engine**: diffs desired against observed state and applies the changes
//! - **Runtime / Registry**: container and registry interfaces, with Docker,
//!   Consul and mock implementations
//! - **Status**: HTTP state and health endpoints

pub mod config;
pub mod consul;
pub mod controller;
pub mod directory;
pub mod engine;
pub mod error;
pub mod machine;
pub mod manifest;
pub mod node;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod service;
pub mod status;

pub use config::Config;
pub use controller::{AgentController, BootOutcome, ControllerTimings};
pub use machine::{AgentState, MachineActor, MachineHandle};
pub use manifest::BootManifest;
