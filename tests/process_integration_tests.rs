//! Integration tests for ServerProcess against a stand-in server
//!
//! The stand-in is a small POSIX shell script that echoes its arguments and its input,
//! so these tests only run on Unix.
//!
//! These tests verify:
//! - Launch arguments and merged stdout/stderr capture
//! - Command injection through stdin
//! - The single-live-process guarantee
//! - Graceful stop, escalation, terminate and kill against live and exited processes
//! - Exit notices and the end-of-stream sentinel

#![cfg(unix)]

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use vs_server_manager::services::{
    COMMAND_WRITE_TIMEOUT, OUTPUT_ENDED_LINE, ProcessError, ProcessPhase, ServerProcess,
    StopOutcome,
};

const ECHO_SERVER: &str = r#"#!/bin/sh
echo "args: $*"
echo "stderr hello" >&2
while IFS= read -r line; do
  case "$line" in
    /stop) echo "stopping"; exit 0 ;;
    /crash) exit 3 ;;
    *) echo "echo: $line" ;;
  esac
done
"#;

/// Ignores the shutdown command and SIGTERM; only SIGKILL ends it
const STUBBORN_SERVER: &str = r#"#!/bin/sh
trap '' TERM
echo "stubborn"
while IFS= read -r line; do
  :
done
"#;

struct Fixture {
    _temp: TempDir,
    exe: Utf8PathBuf,
    data: Utf8PathBuf,
}

/// Never reads stdin, so the pipe fills up; dies on SIGTERM
const HUNG_SERVER: &str = r#"#!/bin/sh
echo "up"
exec sleep 1000
"#;

fn fixture(script: &str) -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
    let exe = root.join("VintagestoryServer");
    fs::write(&exe, script).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    let data = root.join("data");
    fs::create_dir(&data).unwrap();

    Fixture {
        _temp: temp,
        exe,
        data,
    }
}

fn process() -> ServerProcess {
    ServerProcess::new(Handle::current(), "/stop")
}

/// Drain output until `predicate` matches a line or the timeout passes
async fn collect_until(
    process: &ServerProcess,
    seen: &mut Vec<String>,
    predicate: impl Fn(&str) -> bool,
) -> bool {
    for _ in 0..100 {
        seen.extend(process.drain_output(100));
        if seen.iter().any(|l| predicate(l)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn wait_for_exit(process: &ServerProcess) -> Option<i32> {
    for _ in 0..100 {
        if let Some(code) = process.poll_exit() {
            return Some(code);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

fn start(process: &ServerProcess, fx: &Fixture) {
    process.start(&fx.exe, &fx.data, 42420).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_captures_args_and_both_streams() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    assert!(process.is_running());
    assert_eq!(process.phase(), ProcessPhase::Running);
    assert!(process.pid().is_some());

    let mut seen = Vec::new();
    let expected_args = format!("args: --dataPath {} --port 42420", fx.data);
    assert!(collect_until(&process, &mut seen, |l| l == expected_args).await, "{:?}", seen);
    assert!(collect_until(&process, &mut seen, |l| l == "stderr hello").await, "{:?}", seen);

    process.kill();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_reach_stdin_in_order() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    process.write_command("/time").await.unwrap();
    process.write_command("/weather\n").await.unwrap();

    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == "echo: /weather").await);
    let time = seen.iter().position(|l| l == "echo: /time").unwrap();
    let weather = seen.iter().position(|l| l == "echo: /weather").unwrap();
    assert!(time < weather);

    process.kill();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_start_is_refused() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);
    let pid = process.pid();

    let second = process.start(&fx.exe, &fx.data, 42420);

    assert!(matches!(second, Err(ProcessError::AlreadyRunning)));
    assert_eq!(process.pid(), pid);
    process.kill();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_stop() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    let outcome = process.stop_graceful(Duration::from_secs(5)).await;

    assert_eq!(outcome, StopOutcome::Graceful { exit_code: 0 });
    assert!(!process.is_running());
    assert_eq!(process.phase(), ProcessPhase::Exited(0));

    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == OUTPUT_ENDED_LINE).await);
    assert_eq!(
        seen.iter()
            .filter(|l| *l == "[WARN] Server exited with code 0")
            .count(),
        1
    );

    // Last server line, then the exit notice, then the sentinel
    let last_line = seen.iter().position(|l| l == "stopping").unwrap();
    let notice = seen
        .iter()
        .position(|l| l == "[WARN] Server exited with code 0")
        .unwrap();
    let sentinel = seen.iter().position(|l| l == OUTPUT_ENDED_LINE).unwrap();
    assert!(last_line < notice && notice < sentinel, "{:?}", seen);

    // Stopping again is harmless
    assert_eq!(
        process.stop_graceful(Duration::from_secs(1)).await,
        StopOutcome::AlreadyStopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poll_exit_is_idempotent() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    process.write_command("/crash").await.unwrap();
    assert_eq!(wait_for_exit(&process).await, Some(3));
    assert_eq!(process.poll_exit(), Some(3));
    assert_eq!(process.poll_exit(), Some(3));

    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == OUTPUT_ENDED_LINE).await);
    let notices = seen
        .iter()
        .filter(|l| l.starts_with("[WARN] Server exited"))
        .count();
    assert_eq!(notices, 1);

    assert!(matches!(
        process.write_command("/help").await,
        Err(ProcessError::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_force_terminates() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    process.stop_force();

    // Killed by a signal, so there is no exit status code
    assert_eq!(wait_for_exit(&process).await, Some(-1));
    assert!(!process.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stubborn_server_is_killed() {
    let fx = fixture(STUBBORN_SERVER);
    let process = process();
    start(&process, &fx);

    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == "stubborn").await);

    let outcome = process.stop_graceful(Duration::from_millis(300)).await;

    assert_eq!(outcome, StopOutcome::Killed);
    assert!(wait_for_exit(&process).await.is_some());
    assert!(!process.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hung_server_input_does_not_block_stop() {
    let fx = fixture(HUNG_SERVER);
    let process = process();
    start(&process, &fx);

    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == "up").await);

    // Fill the stdin pipe until a write gives up
    let chunk = "x".repeat(8 * 1024);
    let mut timed_out = false;
    for _ in 0..64 {
        match process.write_command(&chunk).await {
            Ok(()) => continue,
            Err(ProcessError::StdinTimeout(limit)) => {
                assert_eq!(limit, COMMAND_WRITE_TIMEOUT);
                timed_out = true;
                break;
            }
            Err(e) => panic!("unexpected write error: {}", e),
        }
    }
    assert!(timed_out, "stdin never filled up");

    // The shutdown command cannot be delivered either, so the stop escalates
    let outcome = tokio::time::timeout(
        Duration::from_secs(15),
        process.stop_graceful(Duration::from_millis(500)),
    )
    .await
    .expect("graceful stop must not hang on a full stdin pipe");

    assert_eq!(outcome, StopOutcome::Terminated);
    assert!(wait_for_exit(&process).await.is_some());
    assert!(!process.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signals_after_exit_are_noops() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    process.kill();
    process.kill();
    assert!(wait_for_exit(&process).await.is_some());

    process.stop_force();
    process.kill();
    assert!(!process.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_after_exit() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);
    let first_pid = process.pid();

    process.write_command("/stop").await.unwrap();
    assert_eq!(wait_for_exit(&process).await, Some(0));

    start(&process, &fx);
    assert!(process.is_running());
    assert_ne!(process.pid(), first_pid);
    assert_eq!(process.poll_exit(), None);

    process.kill();
}

#[tokio::test]
async fn test_drain_respects_max_lines() {
    let fx = fixture(ECHO_SERVER);
    let process = process();
    start(&process, &fx);

    for i in 0..5 {
        process.write_command(&format!("line {}", i)).await.unwrap();
    }
    let mut seen = Vec::new();
    assert!(collect_until(&process, &mut seen, |l| l == "echo: line 4").await);
    process.kill();
    assert!(wait_for_exit(&process).await.is_some());

    // Everything seen so far came in batches no larger than requested
    assert!(process.drain_output(2).len() <= 2);
    assert!(process.drain_output(0).is_empty());
}

#[tokio::test]
async fn test_missing_executable_is_reported() {
    let fx = fixture(ECHO_SERVER);
    let process = process();

    let result = process.start(Utf8Path::new("/nonexistent/VintagestoryServer"), &fx.data, 42420);

    assert!(matches!(result, Err(ProcessError::ExecutableNotFound(_))));
    assert!(!process.is_running());
}
