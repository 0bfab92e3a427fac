use camino::{Utf8Path, Utf8PathBuf};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

/// Line enqueued once both output pipes have closed.
pub const OUTPUT_ENDED_LINE: &str = "[INFO] Server output stream ended.";

/// How often [`ServerProcess::stop_graceful`] re-checks liveness while waiting.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the wait after the terminate signal before escalating to kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on delivering one line to stdin. A server that stops reading fills the pipe.
pub const COMMAND_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle phase of the managed server
///
/// `Idle -> Running -> {Stopping -> Exited | Exited} -> Idle`.
/// Launching is synchronous, so `start()` moves straight from `Idle` (or `Exited`) to
/// `Running`; the exited handle is reaped by the next `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPhase {
    Idle,
    Running,
    Stopping,
    Exited(i32),
}

/// How a graceful stop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    AlreadyStopped,
    /// The server honored the shutdown command
    Graceful { exit_code: i32 },
    /// The server exited after the terminate signal
    Terminated,
    /// The server had to be killed
    Killed,
}

/// Errors that can occur while controlling the server process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Server executable not found: {0}")]
    ExecutableNotFound(Utf8PathBuf),

    #[error("Server executable is not executable: {0}")]
    NotExecutable(Utf8PathBuf),

    #[error("Failed to launch {path}: {source}")]
    Launch {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Server stdin is closed")]
    StdinClosed,

    #[error("Failed to write to server stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("Server did not accept input within {0:?}")]
    StdinTimeout(Duration),
}

/// The live child plus what we know about it
struct RunningServer {
    child: Child,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    pid: Option<u32>,
    stopping: bool,
    exit_code: Option<i32>,
    /// Hands the exit code to the output pump, which queues the notice after the last line
    exit_tx: Option<oneshot::Sender<i32>>,
}

impl RunningServer {
    /// Non-blocking liveness check; records the exit code the first time it is seen.
    ///
    /// # Returns
    /// `Some(code)` once the process has exited
    fn observe_exit(&mut self, output_tx: &mpsc::UnboundedSender<String>) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }

        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                let code = exit_code(status);
                tracing::info!("Server process {:?} exited with code {}", self.pid, code);
                self.record_exit(code, output_tx);
                Some(code)
            }
            Err(e) => {
                // The child can no longer be waited on; treat it as gone
                tracing::warn!("Failed to poll server process {:?}: {}", self.pid, e);
                self.record_exit(-1, output_tx);
                Some(-1)
            }
        }
    }

    fn record_exit(&mut self, code: i32, output_tx: &mpsc::UnboundedSender<String>) {
        self.exit_code = Some(code);
        let pending = match self.exit_tx.take() {
            Some(exit_tx) => exit_tx.send(code).err(),
            None => Some(code),
        };
        // The pump is gone (runtime shutting down); queue the notice directly
        if let Some(code) = pending {
            let _ = output_tx.send(exit_notice(code));
        }
    }
}

fn exit_notice(code: i32) -> String {
    format!("[WARN] Server exited with code {}", code)
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Owner of the zero-or-one server process
///
/// Output from stdout and stderr is pumped line by line on the tokio runtime into one
/// unbounded queue that the driver drains with [`drain_output()`](Self::drain_output).
/// Only this type ever signals the OS process.
///
/// All methods except [`write_command()`](Self::write_command) and
/// [`stop_graceful()`](Self::stop_graceful) are synchronous and return within microseconds
/// (plus OS process creation for `start()`), so the driver thread can call them directly.
pub struct ServerProcess {
    runtime: tokio::runtime::Handle,
    server: Mutex<Option<RunningServer>>,
    output_tx: mpsc::UnboundedSender<String>,
    output_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    shutdown_command: String,
}

impl ServerProcess {
    /// Create an idle manager
    ///
    /// # Arguments
    /// * `runtime` - Runtime for the output reader tasks
    /// * `shutdown_command` - Line the server recognizes as an orderly shutdown (e.g. `/stop`)
    pub fn new(runtime: tokio::runtime::Handle, shutdown_command: impl Into<String>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            server: Mutex::new(None),
            output_tx,
            output_rx: Mutex::new(output_rx),
            shutdown_command: shutdown_command.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the launch arguments for the server
    pub fn build_launch_args(data_dir: &Utf8Path, port: u16) -> Vec<String> {
        vec![
            "--dataPath".to_string(),
            data_dir.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]
    }

    /// Launch the server
    ///
    /// Fails if a server is already live, if `exe_path` is missing or not executable, or if
    /// the OS refuses to create the process. An exited-but-unreaped previous process is
    /// reaped first.
    pub fn start(&self, exe_path: &Utf8Path, data_dir: &Utf8Path, port: u16) -> Result<(), ProcessError> {
        let mut slot = self.lock();

        if let Some(server) = slot.as_mut() {
            if server.observe_exit(&self.output_tx).is_none() {
                tracing::warn!("Server already running (pid {:?})", server.pid);
                return Err(ProcessError::AlreadyRunning);
            }
        }
        // Exited -> Idle
        *slot = None;

        check_executable(exe_path)?;

        let args = Self::build_launch_args(data_dir, port);
        tracing::info!("Starting server: {} {}", exe_path, args.join(" "));

        let mut command = Command::new(exe_path.as_std_path());
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = exe_path.parent().filter(|d| !d.as_str().is_empty()) {
            command.current_dir(dir);
        }

        // tokio needs a runtime context to register the child and its pipes
        let _guard = self.runtime.enter();
        let mut child = command.spawn().map_err(|source| ProcessError::Launch {
            path: exe_path.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = oneshot::channel();
        self.runtime
            .spawn(pump_output(stdout, stderr, exit_rx, self.output_tx.clone()));

        *slot = Some(RunningServer {
            child,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            pid,
            stopping: false,
            exit_code: None,
            exit_tx: Some(exit_tx),
        });

        tracing::info!("Server started with pid {:?}", pid);
        Ok(())
    }

    /// Non-blocking liveness check
    pub fn is_running(&self) -> bool {
        match self.lock().as_mut() {
            Some(server) => server.observe_exit(&self.output_tx).is_none(),
            None => false,
        }
    }

    /// Exit code of the most recent process once it has exited
    ///
    /// Idempotent: repeated calls keep returning the same code until the next `start()`.
    /// The first call that observes the exit enqueues an exit notice into the output queue.
    pub fn poll_exit(&self) -> Option<i32> {
        self.lock()
            .as_mut()
            .and_then(|server| server.observe_exit(&self.output_tx))
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> ProcessPhase {
        match self.lock().as_mut() {
            None => ProcessPhase::Idle,
            Some(server) => match server.observe_exit(&self.output_tx) {
                Some(code) => ProcessPhase::Exited(code),
                None if server.stopping => ProcessPhase::Stopping,
                None => ProcessPhase::Running,
            },
        }
    }

    /// OS process id of the live server
    pub fn pid(&self) -> Option<u32> {
        let mut slot = self.lock();
        let server = slot.as_mut()?;
        if server.observe_exit(&self.output_tx).is_some() {
            return None;
        }
        server.pid
    }

    /// Send one line to the server's stdin
    ///
    /// A newline is appended and the pipe flushed. A broken pipe is reported as
    /// [`ProcessError::Stdin`] and closes our end; it never panics. Delivery is bounded by
    /// [`COMMAND_WRITE_TIMEOUT`]: a server that has stopped reading its input yields
    /// [`ProcessError::StdinTimeout`] instead of blocking the caller.
    pub async fn write_command(&self, text: &str) -> Result<(), ProcessError> {
        let stdin = {
            let mut slot = self.lock();
            let Some(server) = slot.as_mut() else {
                return Err(ProcessError::NotRunning);
            };
            if server.observe_exit(&self.output_tx).is_some() {
                return Err(ProcessError::NotRunning);
            }
            Arc::clone(&server.stdin)
        };

        let line = format!("{}\n", text.trim_end_matches(['\r', '\n']));
        match tokio::time::timeout(COMMAND_WRITE_TIMEOUT, deliver_line(&stdin, &line)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    "Server did not accept command within {:?}: {}",
                    COMMAND_WRITE_TIMEOUT,
                    line.trim_end()
                );
                Err(ProcessError::StdinTimeout(COMMAND_WRITE_TIMEOUT))
            }
        }
    }

    /// Ask the server to shut down and wait up to `timeout` for it to exit
    ///
    /// Sends the shutdown command; if the server is still alive after `timeout` (or the
    /// command could not be delivered), escalates to [`stop_force()`](Self::stop_force)
    /// and then [`kill()`](Self::kill).
    pub async fn stop_graceful(&self, timeout: Duration) -> StopOutcome {
        if !self.mark_stopping() {
            return StopOutcome::AlreadyStopped;
        }

        tracing::info!("Attempting graceful stop...");
        let delivered = match self.write_command(&self.shutdown_command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Shutdown command not delivered ({}); escalating", e);
                false
            }
        };

        if delivered {
            if let Some(exit_code) = self.wait_for_exit(timeout).await {
                tracing::info!("Server stopped gracefully");
                return StopOutcome::Graceful { exit_code };
            }
            tracing::warn!("Server still running after {:?}", timeout);
        }

        self.stop_force();
        if self.wait_for_exit(timeout.min(TERMINATE_GRACE)).await.is_some() {
            return StopOutcome::Terminated;
        }

        self.kill();
        StopOutcome::Killed
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll_exit() {
                return Some(code);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Flag the live server as stopping. Returns false if nothing is live.
    fn mark_stopping(&self) -> bool {
        let mut slot = self.lock();
        let Some(server) = slot.as_mut() else {
            return false;
        };
        if server.observe_exit(&self.output_tx).is_some() {
            return false;
        }
        server.stopping = true;
        true
    }

    /// Request cooperative termination (SIGTERM on Unix)
    ///
    /// No-op when nothing is running; tolerates the process exiting between the check and
    /// the signal. On platforms without a terminate signal this is the same as `kill()`.
    pub fn stop_force(&self) {
        let mut slot = self.lock();
        let Some(server) = slot.as_mut() else {
            return;
        };
        if server.observe_exit(&self.output_tx).is_some() {
            return;
        }

        tracing::warn!("Forcing server termination...");
        server.stopping = true;
        send_terminate(server);
    }

    /// Terminate immediately (SIGKILL on Unix)
    ///
    /// No-op when nothing is running; never fails on an already-exited process.
    pub fn kill(&self) {
        let mut slot = self.lock();
        let Some(server) = slot.as_mut() else {
            return;
        };
        if server.observe_exit(&self.output_tx).is_some() {
            return;
        }

        tracing::warn!("Killing server process {:?}", server.pid);
        server.stopping = true;
        if let Err(e) = server.child.start_kill() {
            // InvalidInput means it was already reaped
            tracing::debug!("Kill of {:?} not delivered: {}", server.pid, e);
        }
    }

    /// Remove and return up to `max_lines` queued output lines, oldest first
    ///
    /// Never blocks; returns an empty list when nothing is queued.
    pub fn drain_output(&self, max_lines: usize) -> Vec<String> {
        let mut rx = self.output_rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut lines = Vec::new();
        while lines.len() < max_lines {
            match rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(_) => break,
            }
        }
        lines
    }
}

/// Write and flush one line, closing our end of the pipe if the server hung up
async fn deliver_line(
    stdin: &tokio::sync::Mutex<Option<ChildStdin>>,
    line: &str,
) -> Result<(), ProcessError> {
    let mut guard = stdin.lock().await;
    let Some(writer) = guard.as_mut() else {
        return Err(ProcessError::StdinClosed);
    };

    let result = match writer.write_all(line.as_bytes()).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::debug!("Sent command to server: {}", line.trim_end());
            Ok(())
        }
        Err(e) => {
            tracing::error!("Failed to send command: {}", e);
            if e.kind() == io::ErrorKind::BrokenPipe {
                *guard = None;
            }
            Err(ProcessError::Stdin(e))
        }
    }
}

#[cfg(unix)]
fn send_terminate(server: &mut RunningServer) {
    let Some(pid) = server.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions. The pid belongs to our unreaped
    // child, so it cannot have been recycled for another process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            "SIGTERM to {} not delivered: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(server: &mut RunningServer) {
    if let Err(e) = server.child.start_kill() {
        tracing::debug!("Terminate of {:?} not delivered: {}", server.pid, e);
    }
}

fn check_executable(exe_path: &Utf8Path) -> Result<(), ProcessError> {
    let metadata = std::fs::metadata(exe_path)
        .map_err(|_| ProcessError::ExecutableNotFound(exe_path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(ProcessError::ExecutableNotFound(exe_path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ProcessError::NotExecutable(exe_path.to_path_buf()));
        }
    }

    Ok(())
}

/// Forward both pipes into the queue, then the exit notice, then the end-of-stream sentinel
///
/// The notice waits until the exit has been observed; if the handle is dropped without
/// that happening, only the sentinel is queued.
async fn pump_output<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    exit_rx: oneshot::Receiver<i32>,
    tx: mpsc::UnboundedSender<String>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    tokio::join!(forward_lines(stdout, &tx), forward_lines(stderr, &tx));
    if let Ok(code) = exit_rx.await {
        let _ = tx.send(exit_notice(code));
    }
    let _ = tx.send(OUTPUT_ENDED_LINE.to_string());
}

async fn forward_lines<R>(reader: Option<R>, tx: &mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Servers occasionally emit non-UTF-8; keep the line rather than drop it
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Server output read failed: {}", e);
                break;
            }
        }
    }
}
