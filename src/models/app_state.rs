use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Default game port used by Vintage Story dedicated servers.
pub const DEFAULT_PORT: u32 = 42420;

/// Name of the save-data subdirectory inside the server data path.
pub const DEFAULT_SAVES_DIR: &str = "Saves";

/// Single source of truth for all configuration and runtime stamps.
///
/// # Thread Safety
///
/// `AppState` is owned by [`crate::state::StateManager`]. Every other component
/// receives clones from [`snapshot()`](crate::state::StateManager::snapshot) and
/// mutates only through [`update()`](crate::state::StateManager::update), so a
/// reader never observes a half-applied change.
///
/// The passthrough fields (`world_generation_settings`, `mod_profiles`) are owned
/// by collaborators outside the core and are carried through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    // Server paths
    pub server_exe_path: Option<Utf8PathBuf>,
    pub data_path: Option<Utf8PathBuf>,
    pub port: u32,

    // Backup settings
    pub backup_root: Option<Utf8PathBuf>,
    pub backup_interval_minutes: i64,
    pub backup_retention_days: i64,
    pub backups_enabled: bool,

    // Passthrough
    pub world_generation_settings: IndexMap<String, serde_yaml_ng::Value>,
    pub mod_profiles: IndexMap<String, Vec<String>>,

    // Stamps
    pub last_started_at: Option<DateTime<Local>>,
    pub last_backup_at: Option<DateTime<Local>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            server_exe_path: None,
            data_path: None,
            port: DEFAULT_PORT,

            backup_root: None,
            backup_interval_minutes: 60,
            backup_retention_days: 7,
            backups_enabled: false,

            world_generation_settings: IndexMap::new(),
            mod_profiles: IndexMap::new(),

            last_started_at: None,
            last_backup_at: None,
        }
    }
}

impl AppState {
    /// Both the executable and the data directory are set.
    pub fn is_server_configured(&self) -> bool {
        self.server_exe_path.is_some() && self.data_path.is_some()
    }

    /// Directory holding the world saves, i.e. `<data_path>/<saves_dir_name>`.
    pub fn saves_dir(&self, saves_dir_name: &str) -> Option<Utf8PathBuf> {
        self.data_path.as_deref().map(|p| p.join(saves_dir_name))
    }

    /// Backup root, ignoring an empty string left behind by a hand-edited file.
    pub fn backup_root(&self) -> Option<&Utf8Path> {
        self.backup_root
            .as_deref()
            .filter(|p| !p.as_str().trim().is_empty())
    }

    /// One-line description for status displays.
    pub fn backup_summary(&self) -> String {
        let last = self
            .last_backup_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());

        if self.backups_enabled {
            format!(
                "Backups every {} min, keep {} days, last: {}",
                self.backup_interval_minutes, self.backup_retention_days, last
            )
        } else {
            format!("Scheduled backups disabled, last: {}", last)
        }
    }
}
