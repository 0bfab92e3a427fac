use crate::models::AppState;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// A configuration value that makes the requested action impossible
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Server executable path is not set")]
    ExecutableNotSet,

    #[error("Server executable not found: {0}")]
    ExecutableNotFound(Utf8PathBuf),

    #[error("Data folder path is not set")]
    DataDirNotSet,

    #[error("Data folder not found: {0}")]
    DataDirNotFound(Utf8PathBuf),

    #[error("Port must be between 1 and 65535 (got {0})")]
    PortOutOfRange(u32),

    #[error("Backup folder path is not set")]
    BackupRootNotSet,

    #[error("Backup interval must be at least 1 minute (got {0})")]
    IntervalNotPositive(i64),

    #[error("Backup retention days cannot be negative (got {0})")]
    NegativeRetention(i64),
}

/// Everything `startServer()` needs, checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub exe_path: Utf8PathBuf,
    pub data_dir: Utf8PathBuf,
    pub port: u16,
}

/// Check the port is a usable TCP port
pub fn validate_port(port: u32) -> Result<u16, ValidationError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ValidationError::PortOutOfRange(port))
}

/// Check the configured data directory exists
pub fn validate_data_dir(state: &AppState) -> Result<Utf8PathBuf, ValidationError> {
    let data_dir = non_blank(state.data_path.as_deref()).ok_or(ValidationError::DataDirNotSet)?;
    if !data_dir.is_dir() {
        return Err(ValidationError::DataDirNotFound(data_dir.to_path_buf()));
    }
    Ok(data_dir.to_path_buf())
}

/// Check executable, data folder and port before any process is launched
pub fn validate_paths_for_start(state: &AppState) -> Result<LaunchPlan, ValidationError> {
    let exe_path =
        non_blank(state.server_exe_path.as_deref()).ok_or(ValidationError::ExecutableNotSet)?;
    if !exe_path.is_file() {
        return Err(ValidationError::ExecutableNotFound(exe_path.to_path_buf()));
    }

    let data_dir = validate_data_dir(state)?;
    let port = validate_port(state.port)?;

    Ok(LaunchPlan {
        exe_path: exe_path.to_path_buf(),
        data_dir,
        port,
    })
}

/// Check the backup settings are usable by the scheduler
///
/// # Returns
/// The backup root
pub fn validate_backup_settings(state: &AppState) -> Result<Utf8PathBuf, ValidationError> {
    let root = state
        .backup_root()
        .ok_or(ValidationError::BackupRootNotSet)?
        .to_path_buf();

    if state.backup_interval_minutes <= 0 {
        return Err(ValidationError::IntervalNotPositive(
            state.backup_interval_minutes,
        ));
    }
    if state.backup_retention_days < 0 {
        return Err(ValidationError::NegativeRetention(
            state.backup_retention_days,
        ));
    }

    Ok(root)
}

fn non_blank(path: Option<&Utf8Path>) -> Option<&Utf8Path> {
    path.filter(|p| !p.as_str().trim().is_empty())
}
