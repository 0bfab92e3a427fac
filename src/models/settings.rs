use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::app_state::DEFAULT_SAVES_DIR;

/// Tunables for the manager itself, as opposed to the persisted [`AppState`](super::AppState).
///
/// Layered by [`ConfigManager::load_settings`](crate::config::ConfigManager::load_settings):
/// built-in defaults, then `VS Manager Settings.yaml`, then `VSSM_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub log_dir: String,
    pub log_prefix: String,
    pub debug_mode: bool,
    pub console_output: bool,

    /// Period of the driver's output pump.
    pub poll_interval_ms: u64,
    pub max_lines_per_poll: usize,

    pub graceful_stop_timeout_secs: u64,

    pub scheduler_tick_ms: u64,
    pub scheduler_stop_timeout_secs: u64,
    /// Wall-clock length of one unit of `backup_interval_minutes`.
    pub backup_interval_unit_ms: u64,

    pub allow_backup_while_running: bool,
    pub shutdown_command: String,
    pub saves_dir_name: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            log_prefix: "vs-server-manager".to_string(),
            debug_mode: false,
            console_output: true,

            poll_interval_ms: 100,
            max_lines_per_poll: 200,

            graceful_stop_timeout_secs: 30,

            scheduler_tick_ms: 10_000,
            scheduler_stop_timeout_secs: 2,
            backup_interval_unit_ms: 60_000,

            allow_backup_while_running: false,
            shutdown_command: "/stop".to_string(),
            saves_dir_name: DEFAULT_SAVES_DIR.to_string(),
        }
    }
}

impl ManagerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    pub fn scheduler_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler_stop_timeout_secs)
    }

    /// Convert a configured backup interval into wall-clock time.
    ///
    /// Non-positive intervals map to zero, which the scheduler treats as "never due".
    pub fn backup_interval(&self, interval_minutes: i64) -> Duration {
        let units = u64::try_from(interval_minutes).unwrap_or(0);
        Duration::from_millis(self.backup_interval_unit_ms.saturating_mul(units))
    }
}
