use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, BufReader, BufWriter};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Extension of snapshot archives; listing and pruning only consider these files.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Suffix of an archive still being written. Never matched by listing or pruning.
const PARTIAL_SUFFIX: &str = "partial";

const SECONDS_PER_DAY: u64 = 86_400;

/// Descriptor of a snapshot archive, rebuilt from filesystem metadata on every listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub file_name: String,
    pub path: Utf8PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl BackupRecord {
    pub fn size_kib(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    /// Modification time formatted for display.
    pub fn modified_local(&self) -> String {
        DateTime::<Local>::from(self.modified)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

/// Errors that can occur while archiving or restoring
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Save data directory not found: {0}")]
    SourceMissing(Utf8PathBuf),

    #[error("Backup archive not found: {0}")]
    ArchiveNotFound(Utf8PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Archive error in {path}: {source}")]
    Archive {
        path: Utf8PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

impl BackupError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn archive(path: &Utf8Path, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Snapshot creation, listing, retention pruning and restore for a save directory
///
/// All operations are blocking filesystem work; async callers run them on
/// `tokio::task::spawn_blocking`.
///
/// # Archive layout
///
/// A snapshot of `<data>/Saves` contains every file below `Saves` with paths relative to
/// it (forward slashes), plus explicit entries for empty directories. Restoring into an
/// empty directory reproduces the original tree byte for byte.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    saves_dir_name: String,
}

impl BackupEngine {
    /// Create an engine that archives `<data_dir>/<saves_dir_name>`
    pub fn new(saves_dir_name: impl Into<String>) -> Self {
        Self {
            saves_dir_name: saves_dir_name.into(),
        }
    }

    pub fn saves_dir_name(&self) -> &str {
        &self.saves_dir_name
    }

    /// Archive the save directory of `data_dir` into `backup_root`
    ///
    /// The archive is written as `<name>.zip.partial` and renamed to
    /// `{prefix}_{timestamp}.zip` only once complete, so readers never see a truncated
    /// archive under its final name.
    ///
    /// # Returns
    /// Path of the new archive
    pub fn create_snapshot(
        &self,
        data_dir: &Utf8Path,
        backup_root: &Utf8Path,
        prefix: &str,
    ) -> Result<Utf8PathBuf, BackupError> {
        let saves_dir = data_dir.join(&self.saves_dir_name);
        if !saves_dir.is_dir() {
            return Err(BackupError::SourceMissing(saves_dir));
        }

        if !backup_root.exists() {
            fs::create_dir_all(backup_root).map_err(|e| {
                BackupError::io(format!("Failed to create backup root {}", backup_root), e)
            })?;
        }

        let archive_path = unique_archive_path(backup_root, prefix, Local::now());
        let partial_path =
            Utf8PathBuf::from(format!("{}.{}", archive_path, PARTIAL_SUFFIX));

        tracing::info!("Archiving {} -> {}", saves_dir, archive_path);

        if let Err(e) = write_archive(&saves_dir, &partial_path) {
            if let Err(cleanup) = fs::remove_file(&partial_path) {
                tracing::debug!("No partial archive to clean up at {}: {}", partial_path, cleanup);
            }
            return Err(e);
        }

        fs::rename(&partial_path, &archive_path).map_err(|e| {
            BackupError::io(format!("Failed to finalize archive {}", archive_path), e)
        })?;

        tracing::info!("Snapshot written: {}", archive_path);
        Ok(archive_path)
    }

    /// List snapshot archives in `backup_root`, newest first
    ///
    /// A missing root yields an empty list. Entries whose metadata can't be read are
    /// skipped rather than failing the whole listing.
    pub fn list_snapshots(&self, backup_root: &Utf8Path) -> Vec<BackupRecord> {
        if !backup_root.exists() {
            return Vec::new();
        }

        let entries = match backup_root.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to list backups in {}: {}", backup_root, e);
                return Vec::new();
            }
        };

        let mut records: Vec<BackupRecord> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry in {}: {}", backup_root, e);
                    None
                }
            })
            .filter(|entry| entry.path().extension() == Some(ARCHIVE_EXTENSION))
            .filter_map(|entry| {
                let metadata = match entry.metadata() {
                    Ok(metadata) if metadata.is_file() => metadata,
                    Ok(_) => return None,
                    Err(e) => {
                        tracing::debug!("Skipping {}: {}", entry.path(), e);
                        return None;
                    }
                };
                let modified = metadata.modified().ok()?;

                Some(BackupRecord {
                    file_name: entry.file_name().to_string(),
                    path: entry.path().to_path_buf(),
                    size_bytes: metadata.len(),
                    modified,
                })
            })
            .collect();

        records.sort_by(|a, b| b.modified.cmp(&a.modified));
        records
    }

    /// Delete archives older than `retention_days`
    ///
    /// A retention of zero or less disables pruning. Individual deletion failures are
    /// logged and skipped.
    ///
    /// # Returns
    /// Number of archives removed
    pub fn prune_older_than(&self, backup_root: &Utf8Path, retention_days: i64) -> usize {
        let Ok(days) = u64::try_from(retention_days) else {
            return 0;
        };
        if days == 0 {
            return 0;
        }

        let max_age = Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY));
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return 0;
        };

        let mut removed = 0;
        for record in self.list_snapshots(backup_root) {
            if record.modified >= cutoff {
                continue;
            }

            match fs::remove_file(&record.path) {
                Ok(()) => {
                    tracing::info!("Pruned old backup {}", record.file_name);
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to delete old backup {}: {}", record.file_name, e);
                }
            }
        }

        removed
    }

    /// Extract `archive_path` into `target_dir`
    ///
    /// With `safety_rename`, an existing `target_dir` is first moved aside to
    /// `{target_dir}.bak_{timestamp}` (plus `_N` if that name is taken). If extraction then
    /// fails, the partial target is removed and the original is moved back; if that
    /// rollback itself fails, the `.bak_` folder is left in place for manual recovery.
    ///
    /// # Returns
    /// Where the previous contents were moved, or `None` if nothing was moved
    pub fn restore_snapshot(
        &self,
        archive_path: &Utf8Path,
        target_dir: &Utf8Path,
        safety_rename: bool,
    ) -> Result<Option<Utf8PathBuf>, BackupError> {
        if !archive_path.is_file() {
            return Err(BackupError::ArchiveNotFound(archive_path.to_path_buf()));
        }

        let mut renamed = None;
        if target_dir.exists() && safety_rename {
            let aside = unique_aside_path(target_dir, Local::now());
            fs::rename(target_dir, &aside).map_err(|e| {
                tracing::error!("Restore safety move failed: {}", e);
                BackupError::io(format!("Failed to move {} aside", target_dir), e)
            })?;
            tracing::info!("Moved {} aside to {}", target_dir, aside);
            renamed = Some(aside);
        }

        match extract_archive(archive_path, target_dir) {
            Ok(count) => {
                tracing::info!("Restored {} entries from {} into {}", count, archive_path, target_dir);
                Ok(renamed)
            }
            Err(e) => {
                if let Some(aside) = &renamed {
                    roll_back_restore(target_dir, aside);
                }
                Err(e)
            }
        }
    }
}

impl Default for BackupEngine {
    fn default() -> Self {
        Self::new(crate::models::DEFAULT_SAVES_DIR)
    }
}

fn unique_archive_path(backup_root: &Utf8Path, prefix: &str, now: DateTime<Local>) -> Utf8PathBuf {
    let stem = format!("{}_{}", prefix, now.format("%Y-%m-%d_%H-%M-%S"));
    let mut candidate = backup_root.join(format!("{}.{}", stem, ARCHIVE_EXTENSION));
    let mut n = 1;
    while candidate.exists() {
        candidate = backup_root.join(format!("{}_{}.{}", stem, n, ARCHIVE_EXTENSION));
        n += 1;
    }
    candidate
}

fn unique_aside_path(target_dir: &Utf8Path, now: DateTime<Local>) -> Utf8PathBuf {
    let base = format!("{}.bak_{}", target_dir, now.format("%Y%m%d_%H%M%S"));
    let mut candidate = Utf8PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = Utf8PathBuf::from(format!("{}_{}", base, n));
        n += 1;
    }
    candidate
}

fn roll_back_restore(target_dir: &Utf8Path, aside: &Utf8Path) {
    if target_dir.exists() {
        if let Err(e) = fs::remove_dir_all(target_dir) {
            tracing::error!(
                "Restore failed and partial target {} could not be removed ({}); previous data kept at {}",
                target_dir,
                e,
                aside
            );
            return;
        }
    }

    match fs::rename(aside, target_dir) {
        Ok(()) => tracing::warn!("Restore failed; previous data moved back to {}", target_dir),
        Err(e) => tracing::error!(
            "Restore failed and rollback failed ({}); previous data kept at {}",
            e,
            aside
        ),
    }
}

/// Collect files and directories below `root`, relative paths using `/`
///
/// Symlinks are not followed into directories, so a link loop cannot recurse. A link to a
/// regular file is archived with the target's contents; other links are skipped.
fn collect_entries(
    root: &Utf8Path,
    dir: &Utf8Path,
    files: &mut Vec<(Utf8PathBuf, String)>,
    dirs: &mut Vec<String>,
) -> Result<(), BackupError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|e| BackupError::io(format!("Failed to read {}", dir), e))?;

    let mut children: Vec<(Utf8PathBuf, fs::FileType)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(format!("Failed to read {}", dir), e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| BackupError::io(format!("Failed to inspect {}", entry.path()), e))?;
        children.push((entry.into_path(), file_type));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));

    if children.is_empty() && dir != root {
        dirs.push(archive_name(root, dir));
    }

    for (path, file_type) in children {
        if file_type.is_dir() {
            collect_entries(root, &path, files, dirs)?;
        } else if file_type.is_symlink() && !path.is_file() {
            tracing::warn!("Skipping symlink {} in backup source", path);
        } else {
            let name = archive_name(root, &path);
            files.push((path, name));
        }
    }
    Ok(())
}

fn archive_name(root: &Utf8Path, path: &Utf8Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_archive(source_dir: &Utf8Path, archive_path: &Utf8Path) -> Result<(), BackupError> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    collect_entries(source_dir, source_dir, &mut files, &mut dirs)?;

    let file = File::create(archive_path)
        .map_err(|e| BackupError::io(format!("Failed to create {}", archive_path), e))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for dir in &dirs {
        writer
            .add_directory(dir.as_str(), options)
            .map_err(|e| BackupError::archive(archive_path, e))?;
    }

    for (path, name) in &files {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| BackupError::archive(archive_path, e))?;
        let mut source = File::open(path)
            .map_err(|e| BackupError::io(format!("Failed to open {}", path), e))?;
        io::copy(&mut source, &mut writer)
            .map_err(|e| BackupError::io(format!("Failed to archive {}", path), e))?;
    }

    let buffered = writer
        .finish()
        .map_err(|e| BackupError::archive(archive_path, e))?;
    let file = buffered
        .into_inner()
        .map_err(|e| BackupError::io(format!("Failed to flush {}", archive_path), e.into_error()))?;
    file.sync_all()
        .map_err(|e| BackupError::io(format!("Failed to sync {}", archive_path), e))?;

    tracing::debug!(
        "Archived {} files and {} empty directories into {}",
        files.len(),
        dirs.len(),
        archive_path
    );
    Ok(())
}

fn extract_archive(archive_path: &Utf8Path, target_dir: &Utf8Path) -> Result<usize, BackupError> {
    fs::create_dir_all(target_dir)
        .map_err(|e| BackupError::io(format!("Failed to create {}", target_dir), e))?;

    let file = File::open(archive_path)
        .map_err(|e| BackupError::io(format!("Failed to open {}", archive_path), e))?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|e| BackupError::archive(archive_path, e))?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BackupError::archive(archive_path, e))?;

        // Entries escaping the target (absolute paths, `..`) are never written
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = target_dir.as_std_path().join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| {
                BackupError::io(format!("Failed to create {}", out_path.display()), e)
            })?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    BackupError::io(format!("Failed to create {}", parent.display()), e)
                })?;
            }
            let mut out = File::create(&out_path).map_err(|e| {
                BackupError::io(format!("Failed to create {}", out_path.display()), e)
            })?;
            io::copy(&mut entry, &mut out).map_err(|e| {
                BackupError::io(format!("Failed to extract {}", out_path.display()), e)
            })?;
        }
        extracted += 1;
    }

    Ok(extracted)
}

/// Handle of a running scheduler task
struct SchedulerTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background timer that fires a backup callback when the configured interval elapses
///
/// The interval and enabled flag are re-read through the supplied closures on every tick,
/// so configuration edits apply without restarting the scheduler. The callback runs on
/// the scheduler's own task, one fire at a time, and the last-fire time is reset whether
/// or not it succeeded.
pub struct BackupScheduler {
    tick: Duration,
    join_timeout: Duration,
    task: Mutex<Option<SchedulerTask>>,
}

impl BackupScheduler {
    /// Create a stopped scheduler
    ///
    /// # Arguments
    /// * `tick` - How often the task wakes to check whether a backup is due
    /// * `join_timeout` - How long [`stop()`](Self::stop) waits for the task to finish
    pub fn new(tick: Duration, join_timeout: Duration) -> Self {
        Self {
            tick,
            join_timeout,
            task: Mutex::new(None),
        }
    }

    /// Whether a scheduler task is active
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the scheduler task on `runtime`
    ///
    /// Calling this while a task is already active does nothing.
    ///
    /// # Returns
    /// `true` if a new task was spawned
    pub fn start<I, E, F, Fut>(
        &self,
        runtime: &tokio::runtime::Handle,
        get_interval: I,
        get_enabled: E,
        on_due: F,
    ) -> bool
    where
        I: Fn() -> Duration + Send + 'static,
        E: Fn() -> bool + Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            tracing::debug!("Backup scheduler already running");
            return false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let tick = self.tick;
        let handle = runtime.spawn(scheduler_loop(
            tick,
            stop_rx,
            get_interval,
            get_enabled,
            on_due,
        ));

        *slot = Some(SchedulerTask { stop_tx, handle });
        tracing::info!("Backup scheduler started (tick {:?})", tick);
        true
    }

    /// Signal the task to exit and wait up to the join timeout for it
    ///
    /// After this returns no further fires start; a fire already in flight may still
    /// complete. Safe to call when the scheduler was never started.
    pub async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(SchedulerTask { stop_tx, handle }) = task else {
            return;
        };

        let _ = stop_tx.send(true);
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.join_timeout, handle).await {
            Ok(Ok(())) => tracing::info!("Backup scheduler stopped"),
            Ok(Err(e)) => tracing::warn!("Backup scheduler task ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Backup scheduler did not stop within {:?}; aborting",
                    self.join_timeout
                );
                abort.abort();
            }
        }
    }
}

async fn scheduler_loop<I, E, F, Fut>(
    tick: Duration,
    mut stop_rx: watch::Receiver<bool>,
    get_interval: I,
    get_enabled: E,
    on_due: F,
) where
    I: Fn() -> Duration,
    E: Fn() -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut last_fire = Instant::now();

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                // Sender dropped counts as a stop request
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }

        if *stop_rx.borrow() {
            break;
        }

        if !get_enabled() {
            continue;
        }

        let interval = get_interval();
        if interval.is_zero() || last_fire.elapsed() < interval {
            continue;
        }

        tracing::info!("Scheduled backup due");
        // A separate task turns a panicking callback into a JoinError instead of killing the loop
        match tokio::spawn(on_due()).await {
            Ok(Ok(())) => tracing::debug!("Scheduled backup callback finished"),
            Ok(Err(e)) => tracing::warn!("Scheduled backup failed: {:#}", e),
            Err(e) => tracing::error!("Scheduled backup callback aborted: {}", e),
        }
        last_fire = Instant::now();
    }

    tracing::debug!("Backup scheduler loop exited");
}
