//! Scenario catalog and execution.
//!
//! Templates and `.json5` files describe what to build, the driver runs the
//! flow for a definition's kind on a [`crate::services::Provisioner`].

pub mod driver;
pub mod loader;
pub mod manager;
pub mod templates;

pub use driver::{ScenarioDriver, ScenarioError, ScenarioRun};
pub use loader::ScenarioLoader;
pub use manager::{RunOverrides, ScenarioManager};
pub use templates::BuiltinScenarioTemplates;
