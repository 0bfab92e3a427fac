use crate::models::{AppState, ManagerSettings};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// File name of the persisted [`AppState`] document.
pub const STATE_FILE_NAME: &str = "VS Server Manager.yaml";

/// File name of the optional [`ManagerSettings`] overrides.
pub const SETTINGS_FILE_NAME: &str = "VS Manager Settings.yaml";

/// Prefix for environment overrides, e.g. `VSSM_GRACEFUL_STOP_TIMEOUT_SECS=10`.
pub const ENV_PREFIX: &str = "VSSM";

/// Configuration manager for the persisted state document and the manager settings.
///
/// Manages two files in one directory (normally beside the executable):
/// - State (`VS Server Manager.yaml`): server paths, backup settings, passthrough data
/// - Settings (`VS Manager Settings.yaml`): optional tunables, layered with env vars
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    state_path: Utf8PathBuf,
    settings_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// The directory is created if it doesn't exist.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            state_path: config_dir.join(STATE_FILE_NAME),
            settings_path: config_dir.join(SETTINGS_FILE_NAME),
            config_dir,
        })
    }

    /// Load the persisted application state.
    ///
    /// Never fails: a missing, unreadable or corrupt document falls back to
    /// [`AppState::default()`] with a warning, so a bad file cannot block startup.
    pub fn load_state(&self) -> AppState {
        if !self.state_path.exists() {
            tracing::warn!(
                "State file not found at {}, using defaults",
                self.state_path
            );
            return AppState::default();
        }

        match self.read_state() {
            Ok(state) => {
                tracing::info!("Loaded state from {}", self.state_path);
                state
            }
            Err(e) => {
                tracing::warn!("{:#}; falling back to defaults", e);
                AppState::default()
            }
        }
    }

    fn read_state(&self) -> Result<AppState> {
        let file_contents = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state file: {}", self.state_path))?;

        serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse state file: {}", self.state_path))
    }

    /// Save the application state.
    ///
    /// Writes a sibling temp file first and renames it over the document, so a crash
    /// mid-write leaves the previous document intact.
    pub fn save_state(&self, state: &AppState) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(state).context("Failed to serialize state to YAML")?;

        let tmp_path = self.state_path.with_extension("yaml.tmp");
        fs::write(&tmp_path, yaml_string)
            .with_context(|| format!("Failed to write state file: {}", tmp_path))?;
        fs::rename(&tmp_path, &self.state_path)
            .with_context(|| format!("Failed to replace state file: {}", self.state_path))?;

        tracing::info!("Saved state to {}", self.state_path);
        Ok(())
    }

    /// Load manager settings: defaults, then the settings file, then `VSSM_*` env vars.
    pub fn load_settings(&self) -> Result<ManagerSettings> {
        self.load_settings_from(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Load settings with an explicit environment source (used to inject overrides in tests).
    pub fn load_settings_from(&self, env: config::Environment) -> Result<ManagerSettings> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(self.settings_path.as_std_path())
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(env.try_parsing(true))
            .build()
            .with_context(|| format!("Failed to load settings: {}", self.settings_path))?
            .try_deserialize::<ManagerSettings>()
            .with_context(|| format!("Invalid settings in {}", self.settings_path))?;

        tracing::debug!("Manager settings: {:?}", settings);
        Ok(settings)
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    /// Path of the persisted state document.
    pub fn state_path(&self) -> &Utf8Path {
        &self.state_path
    }

    /// Path of the optional settings file.
    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}
