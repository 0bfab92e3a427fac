// VS Server Manager - Dedicated server supervisor with scheduled world backups
//
// This is the library crate containing the core logic and data structures.
// The binary crate (main.rs) provides the headless console entry point.

pub mod config;
pub mod console;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::Metrics;
pub use models::{AppState, ManagerSettings};
pub use orchestrator::{BackupTrigger, Orchestrator, OrchestratorError, ValidationError};
pub use services::{BackupEngine, BackupRecord, ServerProcess, StopOutcome};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
