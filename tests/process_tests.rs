// Subprocess execution: outcomes, sinks and cancellation
#![cfg(unix)]

mod test_utils;

use async_trait::async_trait;
use langhost::error::{ProcessError, Result};
use langhost::{BufferedSink, ExecutionOutcome, Invocation, LaunchFailure, OutputSink, ProcessRunner};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use test_utils::{read_pid_file, wait_for_exit, write_script};
use tokio_util::sync::CancellationToken;

fn shell(script: &str) -> Invocation {
    Invocation::new("/bin/sh").with_args(["-c", script])
}

async fn run(invocation: &Invocation) -> (ExecutionOutcome, BufferedSink, BufferedSink) {
    let mut stdout = BufferedSink::new();
    let mut stderr = BufferedSink::new();
    let outcome = ProcessRunner::new()
        .run(invocation, &mut stdout, &mut stderr, &CancellationToken::new())
        .await
        .unwrap();
    (outcome, stdout, stderr)
}

/// Sink whose every write fails
struct BrokenSink;

#[async_trait]
impl OutputSink for BrokenSink {
    async fn write(&mut self, _data: &[u8]) -> Result<()> {
        Err(ProcessError::OutputCaptureFailed {
            command: "test".to_string(),
            message: "sink closed".to_string(),
        }
        .into())
    }
}

#[tokio::test]
async fn test_successful_command_captures_output() {
    let (outcome, _, stderr) = run(&shell("echo hello world; echo warning >&2")).await;

    match outcome {
        ExecutionOutcome::Success { stdout } => assert_eq!(stdout, "hello world\n"),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(stderr.text(), "warning\n");
}

#[tokio::test]
async fn test_non_zero_exit() {
    let (outcome, stdout, _) = run(&shell("echo partial; exit 3")).await;

    assert!(matches!(outcome, ExecutionOutcome::NonZeroExit { code: 3 }));
    assert!(!outcome.already_reported());
    assert_eq!(stdout.text(), "partial\n");
}

#[tokio::test]
async fn test_actionable_error_exit_code() {
    let (outcome, _, _) = run(&shell("exit 32")).await;
    assert!(outcome.already_reported());
}

#[tokio::test]
async fn test_missing_program_is_a_launch_failure() {
    let (outcome, _, _) = run(&Invocation::new("/nonexistent/langhost-test-binary")).await;

    match outcome {
        ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Spawn(error),
        } => assert_eq!(error.kind(), std::io::ErrorKind::NotFound),
        other => panic!("expected launch failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_killed_by_signal() {
    let (outcome, _, _) = run(&shell("kill -9 $$")).await;

    match outcome {
        ExecutionOutcome::Signaled { description } => {
            assert_eq!(description, "terminated by signal SIGKILL")
        }
        other => panic!("expected signal outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_kills_process() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let mut stdout = BufferedSink::new();
    let mut stderr = BufferedSink::new();
    let outcome = ProcessRunner::new()
        .run(&shell("exec sleep 30"), &mut stdout, &mut stderr, &cancel)
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
}

fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
}

#[tokio::test]
async fn test_cancellation_does_not_wait_for_children_of_the_shell() {
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(200));

    let started = Instant::now();
    let mut stdout = BufferedSink::new();
    let mut stderr = BufferedSink::new();
    let outcome = ProcessRunner::new()
        .run(&shell("sleep 4; echo done"), &mut stdout, &mut stderr, &cancel)
        .await
        .unwrap();

    assert!(outcome.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stdout.text(), "");
}

#[tokio::test]
async fn test_cancellation_kills_background_descendants() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("descendant.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let cancel = CancellationToken::new();
    let runner = ProcessRunner::new();
    let invocation = shell(&script);
    let mut stdout = BufferedSink::new();
    let mut stderr = BufferedSink::new();
    let run = runner.run(&invocation, &mut stdout, &mut stderr, &cancel);
    tokio::pin!(run);

    let descendant = tokio::select! {
        pid = read_pid_file(&pid_file) => pid,
        _ = &mut run => panic!("script finished before writing its pid"),
    };
    cancel.cancel();

    let started = Instant::now();
    assert!(run.await.unwrap().is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(wait_for_exit(descendant, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_failing_sink_kills_process() {
    let started = Instant::now();
    let mut stderr = BufferedSink::new();
    let result = ProcessRunner::new()
        .run(
            &shell("echo first; exec sleep 30"),
            &mut BrokenSink,
            &mut stderr,
            &CancellationToken::new(),
        )
        .await;

    let error = result.unwrap_err();
    assert!(error.to_string().contains("sink closed"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_environment_is_replaced_when_not_inherited() {
    std::env::set_var("LANGHOST_PARENT_ONLY", "leaked");
    let mut env = HashMap::new();
    env.insert("LANGHOST_CHILD".to_string(), "given".to_string());

    let invocation = shell("echo \"[$LANGHOST_PARENT_ONLY][$LANGHOST_CHILD]\"")
        .with_inherit_env(false)
        .with_environment(env);
    let (outcome, _, _) = run(&invocation).await;

    match outcome {
        ExecutionOutcome::Success { stdout } => assert_eq!(stdout, "[][given]\n"),
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn test_working_directory() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "where.sh", "pwd");
    let expected = dir.path().canonicalize().unwrap();

    let (outcome, _, _) = run(&Invocation::new(&script).with_working_dir(dir.path())).await;

    match outcome {
        ExecutionOutcome::Success { stdout } => {
            let reported = std::path::PathBuf::from(stdout.trim()).canonicalize().unwrap();
            assert_eq!(reported, expected);
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn test_spawned_process_reports_pid() {
    let process = ProcessRunner::new()
        .spawn(&shell("exit 0"))
        .unwrap();
    assert!(process.pid() > 0);
    assert_eq!(process.command(), "sh -c exit 0");
}
