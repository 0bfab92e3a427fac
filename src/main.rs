//! VS Server Manager - Headless supervisor for a Vintage Story dedicated server
//!
//! Main entry point for the console application.
//!
//! # Overview
//!
//! This binary wires the library together and hands the terminal to the console driver.
//! It initializes:
//! - Manager settings ([`ConfigManager::load_settings`]: defaults, settings file, `VSSM_*`)
//! - Logging infrastructure (daily file rotation + optional console output)
//! - Tokio async runtime (4 worker threads for output readers, scheduler, archive I/O)
//! - The [`Orchestrator`] with the persisted state
//! - The [`ConsoleController`] loop
//!
//! The application uses a hybrid threading model:
//! - **Main thread**: Runs the console loop (blocking, synchronous)
//! - **Tokio workers**: Server output readers, backup scheduler, archive work
//! - **Input thread**: Reads stdin lines and hands them to the main thread
//!
//! # Configuration Files
//!
//! Read from the directory given as the first argument (default: the current directory):
//! - `VS Server Manager.yaml`: Server paths, backup settings (created on first save)
//! - `VS Manager Settings.yaml`: Manager tunables (optional)

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::sync::Arc;
use vs_server_manager::console::ConsoleController;
use vs_server_manager::{APP_NAME, ConfigManager, Orchestrator, VERSION};

const WORKER_THREADS: usize = 4;

/// Main entry point for the server manager
///
/// # Errors
///
/// This function can fail if:
/// - The configuration directory cannot be created
/// - The settings file or environment overrides are invalid
/// - Logging initialization fails (disk space, permissions)
/// - Tokio runtime creation fails (system resources)
fn main() -> Result<()> {
    let config_dir = std::env::args()
        .nth(1)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from("."));

    let config_manager = ConfigManager::new(&config_dir)?;
    let settings = config_manager.load_settings()?;

    let log_dir = config_dir.join(&settings.log_dir);
    let _log_guard = vs_server_manager::logging::setup_logging_with_console(
        &log_dir,
        &settings.log_prefix,
        settings.debug_mode,
        settings.console_output,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(WORKER_THREADS)
        .thread_name("vssm-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    tracing::info!(
        "Tokio runtime initialized with {} worker threads",
        WORKER_THREADS
    );

    let orchestrator = Arc::new(Orchestrator::new(
        runtime.handle().clone(),
        config_manager,
        settings,
    ));

    // Scheduler runs even when disabled so `!backups on` takes effect without a restart
    if let Err(e) = orchestrator.start_backup_scheduler() {
        tracing::warn!("Backup scheduler not started: {}", e);
    }

    let controller = ConsoleController::new(Arc::clone(&orchestrator), runtime.handle().clone());
    let result = controller.run();

    drop(orchestrator);
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    tracing::info!("Application shutdown complete");
    result
}
