// State management module
//
// This module provides the StateManager which owns the single AppState record behind
// one mutex and emits change events for the driver/UI.

use crate::models::AppState;
use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use std::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

thread_local! {
    /// Identity of the store whose transform is currently running on this thread.
    static ACTIVE_TRANSFORM: Cell<usize> = const { Cell::new(0) };
}

/// Change events emitted when state is modified
///
/// These let the driver refresh its displays without polling the whole record.
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// Executable or data path has been updated
    ServerPathsChanged { is_server_configured: bool },

    /// Game port has been updated
    PortChanged { port: u32 },

    /// Backup root, interval or retention has been updated
    BackupSettingsChanged,

    /// Scheduled backups were switched on or off
    BackupsToggled { enabled: bool },

    /// A server launch was stamped
    ServerStarted { at: DateTime<Local> },

    /// A completed backup was stamped
    BackupRecorded { at: DateTime<Local> },

    /// World generation settings or mod profiles changed
    PassthroughChanged,

    /// The whole record was replaced (e.g. loaded from disk)
    StateReplaced,
}

/// Thread-safe owner of the [`AppState`] record with event emission
///
/// All reads and writes go through one mutex:
/// - [`snapshot()`](Self::snapshot) returns an independent copy
/// - [`set()`](Self::set) replaces the record
/// - [`update()`](Self::update) applies a transform to a copy and stores the result
///
/// Two concurrent `update()` calls never interleave their read-modify-write. The lock is
/// only held long enough to clone the record and run the transform, never across I/O.
///
/// # Re-entrancy
///
/// Transforms must be pure functions of the copy they receive. Calling back into the same
/// store from inside a transform panics instead of deadlocking.
pub struct StateManager {
    /// The application state, guarded by a single mutex
    state: Arc<Mutex<AppState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

/// Resets the re-entry marker even if a transform panics.
struct TransformScope {
    previous: usize,
}

impl TransformScope {
    fn enter(id: usize) -> Self {
        let previous = ACTIVE_TRANSFORM.with(|active| active.replace(id));
        Self { previous }
    }
}

impl Drop for TransformScope {
    fn drop(&mut self) {
        ACTIVE_TRANSFORM.with(|active| active.set(self.previous));
    }
}

impl StateManager {
    /// Create a new StateManager with default state
    ///
    /// The broadcast channel buffers 100 events per subscriber.
    pub fn new() -> Self {
        Self::with_state(AppState::default())
    }

    /// Create a StateManager seeded with `initial`
    pub fn with_state(initial: AppState) -> Self {
        let (state_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(Mutex::new(initial)),
            state_tx,
        }
    }

    fn store_id(&self) -> usize {
        Arc::as_ptr(&self.state) as *const () as usize
    }

    fn lock(&self) -> MutexGuard<'_, AppState> {
        if ACTIVE_TRANSFORM.with(|active| active.get()) == self.store_id() {
            panic!("StateManager re-entered from inside its own update transform");
        }
        // Critical sections only swap whole values, so a poisoned record is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get an independent copy of the current state
    pub fn snapshot(&self) -> AppState {
        self.lock().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let enabled = state_manager.read(|state| state.backups_enabled);
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&AppState) -> R,
    {
        let state = self.lock();
        f(&state)
    }

    /// Replace the stored state
    ///
    /// # Returns
    /// The change events that were emitted
    pub fn set(&self, new_state: AppState) -> Vec<StateChange> {
        let mut state = self.lock();
        let old_state = std::mem::replace(&mut *state, new_state);

        let mut changes = Self::detect_changes(&old_state, &state);
        changes.push(StateChange::StateReplaced);
        self.emit(&changes);

        changes
    }

    /// Apply `transform` to a copy of the current state, store and return the result
    ///
    /// This is the only way components mutate state. The transform receives an owned copy,
    /// so a panicking transform leaves the stored record untouched.
    ///
    /// # Example
    /// ```ignore
    /// state_manager.update(|mut state| {
    ///     state.backups_enabled = true;
    ///     state
    /// });
    /// ```
    pub fn update<F>(&self, transform: F) -> AppState
    where
        F: FnOnce(AppState) -> AppState,
    {
        match self.try_update(|draft| Ok::<_, std::convert::Infallible>(transform(draft))) {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }

    /// Like [`update()`](Self::update), but the transform may reject the change
    ///
    /// Validation and mutation happen under the same lock, so an `Err` leaves nothing
    /// partially applied.
    pub fn try_update<F, E>(&self, transform: F) -> Result<AppState, E>
    where
        F: FnOnce(AppState) -> Result<AppState, E>,
    {
        let mut state = self.lock();
        let draft = state.clone();

        let updated = {
            let _scope = TransformScope::enter(self.store_id());
            transform(draft)?
        };

        let old_state = std::mem::replace(&mut *state, updated);
        let changes = Self::detect_changes(&old_state, &state);
        self.emit(&changes);

        Ok(state.clone())
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn emit(&self, changes: &[StateChange]) {
        for change in changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }
    }

    /// Detect what changed between two states and generate events
    fn detect_changes(old: &AppState, new: &AppState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if old.server_exe_path != new.server_exe_path || old.data_path != new.data_path {
            changes.push(StateChange::ServerPathsChanged {
                is_server_configured: new.is_server_configured(),
            });
        }

        if old.port != new.port {
            changes.push(StateChange::PortChanged { port: new.port });
        }

        if old.backup_root != new.backup_root
            || old.backup_interval_minutes != new.backup_interval_minutes
            || old.backup_retention_days != new.backup_retention_days
        {
            changes.push(StateChange::BackupSettingsChanged);
        }

        if old.backups_enabled != new.backups_enabled {
            changes.push(StateChange::BackupsToggled {
                enabled: new.backups_enabled,
            });
        }

        if old.last_started_at != new.last_started_at {
            if let Some(at) = new.last_started_at {
                changes.push(StateChange::ServerStarted { at });
            }
        }

        if old.last_backup_at != new.last_backup_at {
            if let Some(at) = new.last_backup_at {
                changes.push(StateChange::BackupRecorded { at });
            }
        }

        if old.world_generation_settings != new.world_generation_settings
            || old.mod_profiles != new.mod_profiles
        {
            changes.push(StateChange::PassthroughChanged);
        }

        changes
    }

    // Convenience methods for common state updates

    /// Set the server executable and data paths
    pub fn set_server_paths(
        &self,
        server_exe_path: Option<Utf8PathBuf>,
        data_path: Option<Utf8PathBuf>,
    ) -> AppState {
        self.update(|mut state| {
            state.server_exe_path = server_exe_path;
            state.data_path = data_path;
            state
        })
    }

    /// Stamp a successful server launch
    pub fn mark_server_started(&self, at: DateTime<Local>) -> AppState {
        self.update(|mut state| {
            state.last_started_at = Some(at);
            state
        })
    }

    /// Stamp a completed backup
    pub fn mark_backup_completed(&self, at: DateTime<Local>) -> AppState {
        self.update(|mut state| {
            state.last_backup_at = Some(at);
            state
        })
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// Make StateManager cloneable for sharing across threads
impl Clone for StateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}
