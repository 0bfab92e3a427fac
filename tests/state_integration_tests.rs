//! Integration tests for StateManager with state change events
//!
//! These tests verify that the StateManager correctly:
//! - Emits state change events on mutations
//! - Supports multiple subscribers
//! - Serializes concurrent updates from multiple threads
//! - Hands out snapshots that are isolated from later mutations

use camino::Utf8PathBuf;
use chrono::Local;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use tokio::time::{Duration, timeout};
use vs_server_manager::{AppState, StateChange, StateManager};

#[tokio::test]
async fn test_state_change_events_emitted() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    state.set_server_paths(
        Some(Utf8PathBuf::from("/srv/vs/VintagestoryServer")),
        Some(Utf8PathBuf::from("/srv/vs/data")),
    );

    let event = timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed");

    assert!(
        matches!(
            event,
            StateChange::ServerPathsChanged {
                is_server_configured: true
            }
        ),
        "Expected ServerPathsChanged event, got: {:?}",
        event
    );
}

#[tokio::test]
async fn test_multiple_subscribers_receive_events() {
    let state = Arc::new(StateManager::new());
    let mut rx1 = state.subscribe();
    let mut rx2 = state.subscribe();

    state.update(|mut s| {
        s.backups_enabled = true;
        s
    });

    for rx in [&mut rx1, &mut rx2] {
        let event = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("Timeout")
            .expect("Channel closed");
        assert_eq!(event, StateChange::BackupsToggled { enabled: true });
    }
}

#[tokio::test]
async fn test_stamps_emit_events() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    let started = Local::now();
    state.mark_server_started(started);
    let backed_up = Local::now();
    state.mark_backup_completed(backed_up);

    let first = rx.recv().await.expect("Channel closed");
    let second = rx.recv().await.expect("Channel closed");
    assert_eq!(first, StateChange::ServerStarted { at: started });
    assert_eq!(second, StateChange::BackupRecorded { at: backed_up });
}

#[tokio::test]
async fn test_no_event_for_no_op_update() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    state.update(|s| s);

    assert!(
        timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "An unchanged state should not emit events"
    );
}

#[tokio::test]
async fn test_set_emits_state_replaced() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    let replacement = AppState {
        port: 42421,
        ..AppState::default()
    };
    let changes = state.set(replacement);

    assert_eq!(
        changes,
        vec![
            StateChange::PortChanged { port: 42421 },
            StateChange::StateReplaced
        ]
    );
    assert_eq!(rx.recv().await.unwrap(), StateChange::PortChanged { port: 42421 });
    assert_eq!(rx.recv().await.unwrap(), StateChange::StateReplaced);
}

#[test]
fn test_failed_try_update_stores_nothing() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    let result: Result<AppState, String> = state.try_update(|mut s| {
        s.port = 1;
        s.backups_enabled = true;
        Err("rejected".to_string())
    });

    assert_eq!(result, Err("rejected".to_string()));
    assert_eq!(state.snapshot(), AppState::default());
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_snapshot_isolated_from_later_updates() {
    let state = StateManager::new();
    let before = state.snapshot();

    state.update(|mut s| {
        s.backup_interval_minutes = 5;
        s.mod_profiles
            .insert("vanilla".to_string(), vec!["game".to_string()]);
        s
    });

    assert_eq!(before.backup_interval_minutes, 60);
    assert!(before.mod_profiles.is_empty());
    assert_eq!(state.read(|s| s.backup_interval_minutes), 5);
}

#[test]
fn test_concurrent_updates_are_serialized() {
    let state = StateManager::new();
    let threads = 8;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let state = state.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    state.update(|mut s| {
                        s.backup_retention_days += 1;
                        s
                    });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Updater thread panicked");
    }

    assert_eq!(
        state.read(|s| s.backup_retention_days),
        7 + (threads * per_thread) as i64
    );
}

#[test]
fn test_clones_share_the_same_record() {
    let state = StateManager::new();
    let other = state.clone();

    other.update(|mut s| {
        s.port = 50000;
        s
    });

    assert_eq!(state.read(|s| s.port), 50000);
}

#[test]
fn test_reentrant_update_panics() {
    let state = StateManager::new();
    let inner = state.clone();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        state.update(|s| {
            let _ = inner.snapshot();
            s
        })
    }));

    assert!(result.is_err(), "Re-entering the store must be detected");
    // The store stays usable afterwards
    assert_eq!(state.snapshot(), AppState::default());
}

proptest! {
    #[test]
    fn prop_interleaved_increments_all_land(increments in proptest::collection::vec(1i64..20, 1..6)) {
        let state = StateManager::new();

        let handles: Vec<_> = increments
            .iter()
            .map(|&count| {
                let state = state.clone();
                thread::spawn(move || {
                    for _ in 0..count {
                        state.update(|mut s| {
                            s.backup_interval_minutes += 1;
                            s
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = 60 + increments.iter().sum::<i64>();
        prop_assert_eq!(state.read(|s| s.backup_interval_minutes), expected);
    }

    #[test]
    fn prop_yaml_round_trip_preserves_state(
        port in 1u32..=65535,
        interval in 1i64..10_000,
        retention in 0i64..365,
        enabled in any::<bool>(),
        profiles in proptest::collection::vec("[a-z]{1,8}", 0..4),
    ) {
        let mut state = AppState {
            port,
            backup_interval_minutes: interval,
            backup_retention_days: retention,
            backups_enabled: enabled,
            backup_root: Some(Utf8PathBuf::from("/backups")),
            ..AppState::default()
        };
        for name in &profiles {
            state.mod_profiles.insert(name.clone(), vec![format!("{}-mod", name)]);
        }

        let yaml = serde_yaml_ng::to_string(&state).unwrap();
        let back: AppState = serde_yaml_ng::from_str(&yaml).unwrap();
        prop_assert_eq!(back, state);
    }
}
