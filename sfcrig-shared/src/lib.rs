//! Shared types for sfcrig.
//!
//! This crate holds the vocabulary every other part of the provisioner speaks:
//! the resource model exchanged with the remote control plane, the error
//! taxonomy, and the scenario definitions a run is driven from.
//!
//! # Key Components
//!
//! * [`ResourceKind`]/[`ResourceHandle`] - What a tracked remote object is and how to address it
//! * [`RegistryEntry`] - One line of the creation log teardown consumes
//! * [`ProvisionError`] - Every failure a provisioning step or teardown can report
//! * [`model`] - Networks, ports, trunks, servers and chain objects as the remote side returns them
//! * [`ScenarioDefinition`] - Parameters of one run, loadable from JSON5
//!
//! # Resource lifecycle
//!
//! ```text
//! create ──► register(kind, handle) ──► ... ──► drain ──► delete by kind rank
//!                                   (creation log)
//! ```

pub mod errors;
pub mod model;
pub mod resource;
pub mod scenario;
pub mod scenario_json;

pub use errors::{CallFailure, ProvisionError, ProvisionResult, RemoteError, RemoteResult, TeardownFailure};
pub use resource::{Operation, RegistryEntry, ResourceHandle, ResourceId, ResourceKind};
pub use scenario::{ScenarioDefinition, ScenarioId, ScenarioKind, ScenarioMetadata, ScenarioParams};
