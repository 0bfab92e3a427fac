// Console Controller - Bridges a line-oriented terminal with the Orchestrator
//
// This module contains the ConsoleController which coordinates between:
// - The terminal (stdin lines in, server output and replies out)
// - Orchestrator (server, backups, state)
// - The tokio runtime (async orchestrator calls are driven with block_on)
//
// It handles:
// - Pumping server output on a fixed period
// - Interpreting !commands and forwarding everything else to the server
// - Logging state change events

use crate::console::command::{ConsoleCommand, HELP_TEXT};
use crate::orchestrator::{BackupTrigger, Orchestrator, OrchestratorError};
use crate::services::ProcessPhase;
use crate::state::StateChange;
use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;

/// What the loop should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Console controller that wires terminal input and output to the orchestrator
///
/// Runs on a plain thread (normally `main`). It must not be used from inside a tokio
/// runtime worker because async orchestrator calls are driven with `Handle::block_on`.
///
/// # Example
/// ```ignore
/// let runtime = tokio::runtime::Runtime::new()?;
/// let orchestrator = Arc::new(Orchestrator::new(runtime.handle().clone(), config, settings));
///
/// let controller = ConsoleController::new(orchestrator, runtime.handle().clone());
/// controller.run()?;  // Blocks until !quit or end of input
/// ```
pub struct ConsoleController {
    orchestrator: Arc<Orchestrator>,
    runtime: Handle,
}

impl ConsoleController {
    pub fn new(orchestrator: Arc<Orchestrator>, runtime: Handle) -> Self {
        Self {
            orchestrator,
            runtime,
        }
    }

    /// Run the console loop until `!quit` or end of input, then shut everything down
    pub fn run(self) -> Result<()> {
        self.setup_state_subscription();

        let lines = spawn_stdin_reader()?;
        let poll_interval = self.orchestrator.settings().poll_interval();
        let stdout = io::stdout();

        writeln!(stdout.lock(), "Type !help for manager commands.")?;

        loop {
            self.pump(&mut stdout.lock())?;

            match lines.recv_timeout(poll_interval) {
                Ok(line) => {
                    let Some(command) = ConsoleCommand::parse(&line) else {
                        continue;
                    };
                    if self.execute(command, &mut stdout.lock())? == Flow::Quit {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("Console input closed");
                    break;
                }
            }
        }

        self.shutdown(&mut stdout.lock())
    }

    /// Drain queued server output to `out`
    ///
    /// # Returns
    /// Number of lines written
    pub fn pump<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let max_lines = self.orchestrator.settings().max_lines_per_poll;
        let lines = self.orchestrator.poll_output_and_exit(max_lines);
        for line in &lines {
            writeln!(out, "{}", line)?;
        }
        out.flush()?;
        Ok(lines.len())
    }

    /// Execute one console command, writing its reply to `out`
    ///
    /// Orchestrator failures are reported to `out` and never end the loop.
    pub fn execute<W: Write>(&self, command: ConsoleCommand, out: &mut W) -> io::Result<Flow> {
        tracing::debug!("Console command: {:?}", command);
        let orch = &self.orchestrator;

        match command {
            ConsoleCommand::Start => match orch.start_server() {
                Ok(()) => writeln!(out, "Server starting...")?,
                Err(e) => report(out, &e)?,
            },
            ConsoleCommand::Stop => {
                writeln!(out, "Stopping server...")?;
                match self.runtime.block_on(orch.stop_server_graceful()) {
                    Ok(outcome) => writeln!(out, "Server stopped ({:?})", outcome)?,
                    Err(e) => report(out, &e)?,
                }
            }
            ConsoleCommand::Force => match orch.stop_server_force() {
                Ok(()) => writeln!(out, "Terminate signal sent")?,
                Err(e) => report(out, &e)?,
            },
            ConsoleCommand::Kill => match orch.kill_server() {
                Ok(()) => writeln!(out, "Server killed")?,
                Err(e) => report(out, &e)?,
            },
            ConsoleCommand::Backup => {
                match self.runtime.block_on(orch.create_backup(BackupTrigger::Manual)) {
                    Ok(path) => writeln!(out, "Backup created: {}", path)?,
                    Err(e) => report(out, &e)?,
                }
            }
            ConsoleCommand::List => match self.runtime.block_on(orch.list_backups()) {
                Ok(records) if records.is_empty() => writeln!(out, "No backups found")?,
                Ok(records) => {
                    for record in records {
                        writeln!(
                            out,
                            "{}  {:>10.1} KiB  {}",
                            record.modified_local(),
                            record.size_kib(),
                            record.path
                        )?;
                    }
                }
                Err(e) => report(out, &e)?,
            },
            ConsoleCommand::Restore(path) => {
                match self.runtime.block_on(orch.restore_backup(&path)) {
                    Ok(Some(aside)) => writeln!(
                        out,
                        "Backup restored. Previous saves moved to {}",
                        aside
                    )?,
                    Ok(None) => writeln!(out, "Backup restored")?,
                    Err(e) => report(out, &e)?,
                }
            }
            ConsoleCommand::SetBackups(enabled) => match orch.set_backups_enabled(enabled) {
                Ok(state) => {
                    writeln!(out, "{}", state.backup_summary())?;
                    if enabled {
                        if let Err(e) = orch.start_backup_scheduler() {
                            report(out, &e)?;
                        }
                    }
                    self.save_state(out)?;
                }
                Err(e) => report(out, &e)?,
            },
            ConsoleCommand::Status => self.write_status(out)?,
            ConsoleCommand::Help => writeln!(out, "{}", HELP_TEXT)?,
            ConsoleCommand::Quit => return Ok(Flow::Quit),
            ConsoleCommand::Forward(text) => {
                if let Err(e) = self.runtime.block_on(orch.send_command(&text)) {
                    report(out, &e)?;
                }
            }
            ConsoleCommand::Invalid(reason) => writeln!(out, "{}", reason)?,
        }

        out.flush()?;
        Ok(Flow::Continue)
    }

    fn write_status<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let orch = &self.orchestrator;
        let state = orch.state();

        let phase = match orch.server_phase() {
            ProcessPhase::Idle => "stopped".to_string(),
            ProcessPhase::Running => "running".to_string(),
            ProcessPhase::Stopping => "stopping".to_string(),
            ProcessPhase::Exited(code) => format!("exited with code {}", code),
        };
        let listening = self.runtime.block_on(orch.is_port_listening(None));

        writeln!(out, "Server: {}", phase)?;
        writeln!(
            out,
            "Port {}: {}",
            state.port,
            if listening { "listening on localhost" } else { "not listening" }
        )?;
        if let Some(at) = state.last_started_at {
            writeln!(out, "Last started: {}", at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        writeln!(out, "{}", state.backup_summary())?;
        writeln!(
            out,
            "Scheduler: {}",
            if orch.is_scheduler_running() { "running" } else { "stopped" }
        )
    }

    fn save_state<W: Write>(&self, out: &mut W) -> io::Result<()> {
        if let Err(e) = self.orchestrator.save_state() {
            tracing::error!("Failed to save state: {:#}", e);
            writeln!(out, "Warning: settings not saved: {:#}", e)?;
        }
        Ok(())
    }

    fn shutdown<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.orchestrator.is_server_running() {
            writeln!(out, "Stopping server before exit...")?;
        }
        let outcome = self.runtime.block_on(self.orchestrator.shutdown());
        if let Some(outcome) = outcome {
            writeln!(out, "Server stopped ({:?})", outcome)?;
        }

        // Exit notice and the tail of the server's output
        self.pump(out)?;
        self.save_state(out)?;
        Ok(())
    }

    /// Log state change events as they happen
    fn setup_state_subscription(&self) {
        let mut rx = self.orchestrator.state_manager().subscribe();

        self.runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(StateChange::ServerStarted { at }) => {
                        tracing::info!("Server start recorded at {}", at)
                    }
                    Ok(StateChange::BackupRecorded { at }) => {
                        tracing::info!("Backup recorded at {}", at)
                    }
                    Ok(change) => tracing::debug!("State change: {:?}", change),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("State listener lagged, skipped {} events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

fn report<W: Write>(out: &mut W, error: &OrchestratorError) -> io::Result<()> {
    tracing::warn!("Command failed: {}", error);
    writeln!(out, "Error: {}", error)
}

/// Read stdin lines on a dedicated thread
///
/// The channel disconnects when stdin reaches end of input or fails.
fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();

    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read console input: {}", e);
                        break;
                    }
                }
            }
        })
        .context("Failed to spawn console input thread")?;

    Ok(rx)
}
