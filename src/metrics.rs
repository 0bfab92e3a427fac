// Operational metrics module
//
// Provides lightweight counters for what the manager did during one session

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Session metrics
///
/// Uses atomic operations for thread-safe tracking without locks. The orchestrator,
/// the scheduler task and the driver thread all record into one shared instance,
/// and the summary is logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Successful server launches
    pub server_starts: AtomicU64,

    /// Graceful, forced and kill requests against a live server
    pub stop_requests: AtomicU64,

    /// Commands written to the server's stdin
    pub commands_sent: AtomicU64,

    /// Output lines handed to the driver
    pub lines_drained: AtomicU64,

    /// Snapshots written successfully
    pub backups_created: AtomicU64,

    /// Snapshot attempts that failed
    pub backups_failed: AtomicU64,

    /// Snapshot attempts refused by policy (server running, busy)
    pub backups_refused: AtomicU64,

    /// Archives removed by retention pruning
    pub snapshots_pruned: AtomicU64,

    /// Completed restores
    pub restores: AtomicU64,

    /// Number of state updates performed
    pub state_updates: AtomicU64,

    /// Total time spent writing snapshots in milliseconds
    pub total_backup_time_ms: AtomicU64,

    /// Session start time
    start_time: Instant,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self {
            server_starts: AtomicU64::new(0),
            stop_requests: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            lines_drained: AtomicU64::new(0),
            backups_created: AtomicU64::new(0),
            backups_failed: AtomicU64::new(0),
            backups_refused: AtomicU64::new(0),
            snapshots_pruned: AtomicU64::new(0),
            restores: AtomicU64::new(0),
            state_updates: AtomicU64::new(0),
            total_backup_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_server_start(&self) {
        self.server_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stop_request(&self) {
        self.stop_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lines_drained(&self, count: usize) {
        self.lines_drained.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a completed snapshot and how long it took
    pub fn record_backup_created(&self, duration: Duration) {
        self.backups_created.fetch_add(1, Ordering::Relaxed);
        self.total_backup_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_backup_failed(&self) {
        self.backups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backup_refused(&self) {
        self.backups_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshots_pruned(&self, count: usize) {
        self.snapshots_pruned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_restore(&self) {
        self.restores.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a state update
    pub fn record_state_update(&self) {
        self.state_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get average snapshot time in milliseconds
    pub fn avg_backup_time_ms(&self) -> f64 {
        let total = self.total_backup_time_ms.load(Ordering::Relaxed);
        let count = self.backups_created.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        let uptime = self.uptime();
        tracing::info!("=== Session Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", uptime.as_secs_f64());
        tracing::info!(
            "Server: {} starts, {} stop requests, {} commands sent, {} lines drained",
            self.server_starts.load(Ordering::Relaxed),
            self.stop_requests.load(Ordering::Relaxed),
            self.commands_sent.load(Ordering::Relaxed),
            self.lines_drained.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Backups: {} created, {} failed, {} refused (avg: {:.2}ms per backup)",
            self.backups_created.load(Ordering::Relaxed),
            self.backups_failed.load(Ordering::Relaxed),
            self.backups_refused.load(Ordering::Relaxed),
            self.avg_backup_time_ms()
        );
        tracing::info!(
            "Pruned: {}, restores: {}, state updates: {}",
            self.snapshots_pruned.load(Ordering::Relaxed),
            self.restores.load(Ordering::Relaxed),
            self.state_updates.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
