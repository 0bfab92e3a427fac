//! Services module - The components that touch the OS: the server process, the save
//! archives and the port probe.
//!
//! None of these know about [`AppState`](crate::models::AppState) or policy; they take
//! explicit paths and values, which keeps them testable against temp directories and
//! stand-in executables. The [`Orchestrator`](crate::orchestrator::Orchestrator) composes
//! them and decides when each may run.
//!
//! # Components
//!
//! - [`ServerProcess`]: Owns the zero-or-one dedicated server process. Handles:
//!   - Launching with `--dataPath`/`--port` and piped stdio
//!   - Line-by-line output capture into a drainable queue (with an end-of-stream sentinel)
//!   - Commands on stdin, graceful stop with escalation, terminate and kill
//!
//! - [`BackupEngine`]: Blocking archive work on the `Saves` folder:
//!   - Snapshot creation (`{prefix}_{timestamp}.zip`, written under a partial name first)
//!   - Newest-first listing and age-based retention pruning
//!   - Restore with a timestamped safety rename of the current saves
//!
//! - [`BackupScheduler`]: Tokio task that fires a backup callback when the configured
//!   interval elapses, with an explicit start/stop handle.
//!
//! - [`is_port_listening`]: Local TCP probe for the game port.
//!
//! # Usage Example
//!
//! ```ignore
//! use vs_server_manager::services::{BackupEngine, ServerProcess};
//!
//! let process = ServerProcess::new(runtime.handle().clone(), "/stop");
//! process.start(&exe_path, &data_path, 42420)?;
//!
//! for line in process.drain_output(200) {
//!     println!("{line}");
//! }
//!
//! let engine = BackupEngine::default();
//! let archive = engine.create_snapshot(&data_path, &backup_root, "Manual")?;
//! ```

pub mod backup;
pub mod port_check;
pub mod server_process;

pub use backup::{ARCHIVE_EXTENSION, BackupEngine, BackupError, BackupRecord, BackupScheduler};
pub use port_check::{PORT_PROBE_TIMEOUT, is_port_listening};
pub use server_process::{
    COMMAND_WRITE_TIMEOUT, OUTPUT_ENDED_LINE, ProcessError, ProcessPhase, ServerProcess,
    StopOutcome,
};
