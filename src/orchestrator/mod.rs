//! Orchestrator module - Composition and policy over the state store, the server process
//! and the backup engine.
//!
//! This is the only API the driver (console, GUI, or tests) talks to. It decides *whether*
//! an action may run; the [`services`](crate::services) decide *how*.
//!
//! # Policy
//!
//! - `start_server()` validates the executable, data folder and port before any process
//!   is created, and refuses with [`OrchestratorError::Busy`] while an archive operation
//!   is in progress.
//! - Backups (manual or scheduled) are refused while the server is running unless
//!   `allow_backup_while_running` is set. Restores are always refused while it runs.
//! - Snapshot creation and restore share a single archive permit. The "server running"
//!   check happens after the permit is acquired, so it cannot go stale before the
//!   filesystem work starts.
//! - A successful scheduled backup is followed by retention pruning with the retention
//!   window current at that moment. Pruning problems never invalidate the new archive.
//! - Timestamps (`last_started_at`, `last_backup_at`) are written through
//!   [`StateManager::update`](crate::state::StateManager::update) only.
//!
//! # Threading
//!
//! Synchronous methods return within milliseconds and can be called from the driver
//! thread directly. The `async` methods either wait on the server (graceful stop) or
//! do archive I/O on `spawn_blocking`; a plain thread drives them with
//! `Handle::block_on`.

pub mod validation;

pub use validation::{
    LaunchPlan, ValidationError, validate_backup_settings, validate_data_dir,
    validate_paths_for_start, validate_port,
};

use crate::config::ConfigManager;
use crate::metrics::Metrics;
use crate::models::{AppState, ManagerSettings};
use crate::services::{
    BackupEngine, BackupError, BackupRecord, BackupScheduler, ProcessError, ProcessPhase,
    ServerProcess, StopOutcome, is_port_listening,
};
use crate::state::StateManager;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Errors surfaced to the driver
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Server is not running")]
    NotRunning,

    #[error("Cannot {0} while the server is running")]
    ServerRunning(&'static str),

    #[error("A backup or restore is in progress")]
    Busy,

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What asked for a backup; selects the archive name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTrigger {
    Manual,
    Scheduled,
}

impl BackupTrigger {
    pub fn prefix(self) -> &'static str {
        match self {
            BackupTrigger::Manual => "Manual",
            BackupTrigger::Scheduled => "Backup",
        }
    }
}

/// The parts shared with the scheduler task
#[derive(Clone)]
struct Core {
    state: StateManager,
    server: Arc<ServerProcess>,
    engine: BackupEngine,
    settings: Arc<ManagerSettings>,
    metrics: Arc<Metrics>,
    archive_gate: Arc<Semaphore>,
}

impl Core {
    async fn create_backup(&self, trigger: BackupTrigger) -> Result<Utf8PathBuf, OrchestratorError> {
        let state = self.state.snapshot();
        let backup_root = state
            .backup_root()
            .ok_or(ValidationError::BackupRootNotSet)?
            .to_path_buf();
        let data_dir = validate_data_dir(&state)?;

        let _permit = self
            .archive_gate
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Busy)?;

        if !self.settings.allow_backup_while_running && self.server.is_running() {
            self.metrics.record_backup_refused();
            tracing::info!("{:?} backup refused: server is running", trigger);
            return Err(OrchestratorError::ServerRunning("create a backup"));
        }

        tracing::info!("{:?} backup started", trigger);
        let engine = self.engine.clone();
        let root = backup_root.clone();
        let started = Instant::now();
        let created = tokio::task::spawn_blocking(move || {
            engine.create_snapshot(&data_dir, &root, trigger.prefix())
        })
        .await?;

        let archive = match created {
            Ok(archive) => archive,
            Err(e) => {
                self.metrics.record_backup_failed();
                tracing::error!("{:?} backup failed: {}", trigger, e);
                return Err(e.into());
            }
        };

        self.metrics.record_backup_created(started.elapsed());
        self.state.mark_backup_completed(Local::now());
        self.metrics.record_state_update();

        if trigger == BackupTrigger::Scheduled {
            self.prune(backup_root).await;
        }

        Ok(archive)
    }

    /// Apply the current retention window; failures are logged only
    async fn prune(&self, backup_root: Utf8PathBuf) {
        let retention_days = self.state.read(|s| s.backup_retention_days);
        let engine = self.engine.clone();

        match tokio::task::spawn_blocking(move || engine.prune_older_than(&backup_root, retention_days))
            .await
        {
            Ok(removed) => {
                self.metrics.record_snapshots_pruned(removed);
                if removed > 0 {
                    tracing::info!("Pruned {} old backup(s)", removed);
                }
            }
            Err(e) => tracing::warn!("Retention pruning did not complete: {}", e),
        }
    }

    /// Scheduler callback: refusals are expected while the server runs and are not failures
    async fn scheduled_backup(self) -> anyhow::Result<()> {
        match self.create_backup(BackupTrigger::Scheduled).await {
            Ok(_) => Ok(()),
            Err(OrchestratorError::ServerRunning(_)) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context("Scheduled backup failed")),
        }
    }
}

/// The manager's single coherent API
pub struct Orchestrator {
    core: Core,
    scheduler: BackupScheduler,
    config: ConfigManager,
    runtime: Handle,
}

impl Orchestrator {
    /// Create an orchestrator with the state persisted in `config`
    pub fn new(runtime: Handle, config: ConfigManager, settings: ManagerSettings) -> Self {
        let state = StateManager::with_state(config.load_state());
        Self::with_state(runtime, config, settings, state)
    }

    /// Create an orchestrator around an existing state store
    pub fn with_state(
        runtime: Handle,
        config: ConfigManager,
        settings: ManagerSettings,
        state: StateManager,
    ) -> Self {
        let server = ServerProcess::new(runtime.clone(), settings.shutdown_command.clone());
        let scheduler = BackupScheduler::new(
            settings.scheduler_tick(),
            settings.scheduler_stop_timeout(),
        );

        Self {
            core: Core {
                state,
                server: Arc::new(server),
                engine: BackupEngine::new(settings.saves_dir_name.clone()),
                settings: Arc::new(settings),
                metrics: Arc::new(Metrics::new()),
                archive_gate: Arc::new(Semaphore::new(1)),
            },
            scheduler,
            config,
            runtime,
        }
    }

    // === Server ===

    /// Validate the configuration and launch the server
    pub fn start_server(&self) -> Result<(), OrchestratorError> {
        let plan = validate_paths_for_start(&self.core.state.snapshot())?;

        // Held across the launch so a backup cannot slip in between check and start
        let _permit = self
            .core
            .archive_gate
            .try_acquire()
            .map_err(|_| OrchestratorError::Busy)?;

        self.core
            .server
            .start(&plan.exe_path, &plan.data_dir, plan.port)?;

        self.core.metrics.record_server_start();
        self.core.state.mark_server_started(Local::now());
        self.core.metrics.record_state_update();
        Ok(())
    }

    /// Ask the server to stop, escalating if it does not exit in time
    pub async fn stop_server_graceful(&self) -> Result<StopOutcome, OrchestratorError> {
        self.require_running()?;
        self.core.metrics.record_stop_request();

        let outcome = self
            .core
            .server
            .stop_graceful(self.core.settings.graceful_stop_timeout())
            .await;
        tracing::info!("Server stop outcome: {:?}", outcome);
        Ok(outcome)
    }

    /// Send the terminate signal
    pub fn stop_server_force(&self) -> Result<(), OrchestratorError> {
        self.require_running()?;
        self.core.metrics.record_stop_request();
        self.core.server.stop_force();
        Ok(())
    }

    /// Kill the server immediately
    pub fn kill_server(&self) -> Result<(), OrchestratorError> {
        self.require_running()?;
        self.core.metrics.record_stop_request();
        self.core.server.kill();
        Ok(())
    }

    /// Send a console command to the server
    pub async fn send_command(&self, text: &str) -> Result<(), OrchestratorError> {
        match self.core.server.write_command(text).await {
            Ok(()) => {
                self.core.metrics.record_command_sent();
                Ok(())
            }
            Err(ProcessError::NotRunning) => Err(OrchestratorError::NotRunning),
            Err(e) => Err(e.into()),
        }
    }

    /// One pump cycle for the driver: observe a possible exit, then drain queued output
    pub fn poll_output_and_exit(&self, max_lines: usize) -> Vec<String> {
        if let Some(code) = self.core.server.poll_exit() {
            tracing::trace!("Server exit observed with code {}", code);
        }

        let lines = self.core.server.drain_output(max_lines);
        self.core.metrics.record_lines_drained(lines.len());
        lines
    }

    pub fn is_server_running(&self) -> bool {
        self.core.server.is_running()
    }

    pub fn server_phase(&self) -> ProcessPhase {
        self.core.server.phase()
    }

    fn require_running(&self) -> Result<(), OrchestratorError> {
        if self.core.server.is_running() {
            Ok(())
        } else {
            tracing::info!("No server running; nothing to stop");
            Err(OrchestratorError::NotRunning)
        }
    }

    // === Backups ===

    /// Create a snapshot of the world saves now
    ///
    /// # Returns
    /// Path of the new archive
    pub async fn create_backup(&self, trigger: BackupTrigger) -> Result<Utf8PathBuf, OrchestratorError> {
        self.core.create_backup(trigger).await
    }

    /// Replace the world saves with the contents of `archive_path`
    ///
    /// The current saves folder is moved aside first.
    ///
    /// # Returns
    /// Where the previous saves were moved, if there were any
    pub async fn restore_backup(
        &self,
        archive_path: &Utf8Path,
    ) -> Result<Option<Utf8PathBuf>, OrchestratorError> {
        let data_dir = validate_data_dir(&self.core.state.snapshot())?;

        let _permit = self
            .core
            .archive_gate
            .acquire()
            .await
            .map_err(|_| OrchestratorError::Busy)?;

        if self.core.server.is_running() {
            tracing::warn!("Restore refused: server is running");
            return Err(OrchestratorError::ServerRunning("restore a backup"));
        }

        let engine = self.core.engine.clone();
        let archive = archive_path.to_path_buf();
        let target = data_dir.join(engine.saves_dir_name());
        tracing::info!("Restoring {} into {}", archive, target);

        let renamed = tokio::task::spawn_blocking(move || {
            engine.restore_snapshot(&archive, &target, true)
        })
        .await??;

        self.core.metrics.record_restore();
        Ok(renamed)
    }

    /// Archives in the configured backup root, newest first
    ///
    /// Empty when no backup root is configured.
    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>, OrchestratorError> {
        let Some(root) = self
            .core
            .state
            .read(|s| s.backup_root().map(Utf8Path::to_path_buf))
        else {
            return Ok(Vec::new());
        };

        let engine = self.core.engine.clone();
        let records = tokio::task::spawn_blocking(move || engine.list_snapshots(&root)).await?;
        Ok(records)
    }

    /// Turn scheduled backups on or off
    ///
    /// Enabling validates the backup settings in the same atomic update, so an invalid
    /// configuration is never stored as enabled.
    pub fn set_backups_enabled(&self, enabled: bool) -> Result<AppState, OrchestratorError> {
        let state = self.core.state.try_update(|mut state| {
            if enabled {
                validate_backup_settings(&state)?;
            }
            state.backups_enabled = enabled;
            Ok::<_, ValidationError>(state)
        })?;

        self.core.metrics.record_state_update();
        tracing::info!("Scheduled backups {}", if enabled { "enabled" } else { "disabled" });
        Ok(state)
    }

    /// Start the background scheduler
    ///
    /// Validates the backup settings first when backups are enabled. Idempotent.
    ///
    /// # Returns
    /// `true` if a new scheduler task was started
    pub fn start_backup_scheduler(&self) -> Result<bool, OrchestratorError> {
        let state = self.core.state.snapshot();
        if state.backups_enabled {
            validate_backup_settings(&state)?;
        }

        let interval_state = self.core.state.clone();
        let settings = Arc::clone(&self.core.settings);
        let enabled_state = self.core.state.clone();
        let core = self.core.clone();

        Ok(self.scheduler.start(
            &self.runtime,
            move || settings.backup_interval(interval_state.read(|s| s.backup_interval_minutes)),
            move || enabled_state.read(|s| s.backups_enabled),
            move || core.clone().scheduled_backup(),
        ))
    }

    /// Stop the background scheduler; no-op if it was never started
    pub async fn stop_backup_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler.is_running()
    }

    // === State ===

    /// Snapshot of the current state
    pub fn state(&self) -> AppState {
        self.core.state.snapshot()
    }

    /// Apply a transform to the state atomically
    pub fn update_state<F>(&self, transform: F) -> AppState
    where
        F: FnOnce(AppState) -> AppState,
    {
        let state = self.core.state.update(transform);
        self.core.metrics.record_state_update();
        state
    }

    /// The underlying store, for subscribing to change events
    pub fn state_manager(&self) -> &StateManager {
        &self.core.state
    }

    /// Reload the persisted document, replacing the in-memory state
    pub fn load_state(&self) -> AppState {
        let state = self.config.load_state();
        self.core.state.set(state.clone());
        self.core.metrics.record_state_update();
        state
    }

    /// Persist the current state
    pub fn save_state(&self) -> anyhow::Result<()> {
        self.config.save_state(&self.core.state.snapshot())
    }

    // === Misc ===

    /// Whether something listens on `port` (or the configured port) on localhost
    pub async fn is_port_listening(&self, port: Option<u32>) -> bool {
        let port = port.unwrap_or_else(|| self.core.state.read(|s| s.port));
        is_port_listening(port).await
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.core.settings
    }

    pub fn metrics(&self) -> &Metrics {
        &self.core.metrics
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    /// Stop the scheduler, stop a live server, and log the session metrics
    ///
    /// # Returns
    /// How the server stopped, if one was running
    pub async fn shutdown(&self) -> Option<StopOutcome> {
        tracing::info!("Shutting down");
        self.scheduler.stop().await;

        let outcome = match self.stop_server_graceful().await {
            Ok(outcome) => Some(outcome),
            Err(_) => None,
        };

        self.core.metrics.log_summary();
        outcome
    }
}
