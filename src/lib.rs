pub mod config;
pub mod error;
pub mod matcher;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod platform;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod verify;
pub mod version;

pub use config::Config;
pub use error::{OrchestrationError, RegistrationConflict};
pub use model::{Ecosystem, Finding, PackageRecord, Platform, Report, Severity};
pub use orchestrator::{Orchestrator, RunOptions};
pub use registry::PluginRegistry;
pub use store::SecureStore;
