//! Data models for the server manager.
//!
//! - [`AppState`]: the single mutable record (server paths, backup settings, passthrough
//!   world/mod data, stamps). Persisted as YAML by [`ConfigManager`](crate::config::ConfigManager).
//! - [`ManagerSettings`]: tunables for the manager process itself (logging, pump period,
//!   scheduler tick, stop timeouts). Never mutated at runtime.
//!
//! # Architecture Note
//!
//! `AppState` is wrapped by [`StateManager`](crate::state::StateManager); nothing else holds
//! a live reference to it. Components get clones and submit transforms.

pub mod app_state;
pub mod settings;

pub use app_state::{AppState, DEFAULT_PORT, DEFAULT_SAVES_DIR};
pub use settings::ManagerSettings;
