// Debugger attach handshake raced against program execution

use crate::engine::Engine;
use crate::error::{DebugError, Result};
use crate::process::{ExecutionOutcome, LaunchFailure, OutputSink, RunningProcess};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub const DEBUG_SESSION_NAME: &str = "Pulumi: Program (Dotnet)";
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(60);

/// Launch configuration handed to the engine's debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSessionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub request: String,
    pub process_id: u32,
}

impl DebugSessionConfig {
    pub fn attach(process_id: u32) -> Self {
        Self {
            name: DEBUG_SESSION_NAME.to_string(),
            kind: "coreclr".to_string(),
            request: "attach".to_string(),
            process_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDebuggingRequest {
    pub config: DebugSessionConfig,
    pub message: String,
}

impl StartDebuggingRequest {
    pub fn for_process(process_id: u32) -> Self {
        Self {
            config: DebugSessionConfig::attach(process_id),
            message: format!("on process id {process_id}"),
        }
    }
}

/// Lifecycle of a supervised program, traced at each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Idle,
    Launching,
    Running,
    Attaching,
    Terminated,
}

/// Where to send the debug handshake, and how long to wait for it
#[derive(Clone, Copy)]
pub struct AttachTarget<'a> {
    pub engine: &'a dyn Engine,
    pub timeout: Duration,
}

/// Ask the engine to attach to `process_id`, giving up after `timeout` or
/// when `cancel` fires.
pub async fn attach(
    engine: &dyn Engine,
    process_id: u32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let request = StartDebuggingRequest::for_process(process_id);
    debug!(process_id, ?timeout, "Requesting debugger attach");

    tokio::select! {
        _ = cancel.cancelled() => Err(DebugError::Cancelled { process_id }.into()),
        result = tokio::time::timeout(timeout, engine.start_debugging(request)) => match result {
            Err(_) => Err(DebugError::Timeout { process_id, timeout }.into()),
            Ok(Err(e)) => Err(DebugError::Rejected {
                process_id,
                message: e.to_string(),
            }
            .into()),
            Ok(Ok(())) => Ok(()),
        },
    }
}

enum First {
    Exited(Result<std::process::ExitStatus>),
    Attached(Result<()>),
}

/// Wait for a spawned program while optionally performing the attach
/// handshake.
///
/// A failed handshake kills the program and is returned as an error once the
/// process has been reaped. Cancelling `cancel` kills the program and yields
/// `LaunchFailure::Cancelled`.
pub async fn supervise(
    mut process: RunningProcess,
    stdout: Option<&mut dyn OutputSink>,
    stderr: Option<&mut dyn OutputSink>,
    attach_to: Option<AttachTarget<'_>>,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome> {
    let pid = process.pid();
    let kill_switch = cancel.child_token();
    trace!(pid, state = ?AttachState::Running, "Program running");

    let wait = process.wait_with_output(stdout, stderr, &kill_switch);
    tokio::pin!(wait);

    let status = match attach_to {
        None => wait.await?,
        Some(target) => {
            trace!(pid, state = ?AttachState::Attaching, "Attaching debugger");
            let handshake = attach(target.engine, pid, target.timeout, &kill_switch);
            tokio::pin!(handshake);

            let first = tokio::select! {
                status = &mut wait => First::Exited(status),
                attached = &mut handshake => First::Attached(attached),
            };

            match first {
                First::Exited(status) => {
                    debug!(pid, "Program exited before the debugger attached");
                    status?
                }
                First::Attached(Ok(())) => {
                    debug!(pid, "Debugger attached");
                    wait.await?
                }
                First::Attached(Err(e)) => {
                    error!(pid, error = %e, "Unable to start debugging, killing program");
                    kill_switch.cancel();
                    let reaped = wait.await;
                    trace!(pid, state = ?AttachState::Terminated, reaped = reaped.is_ok(), "Program terminated");
                    return Err(e);
                }
            }
        }
    };
    trace!(pid, state = ?AttachState::Terminated, %status, "Program terminated");

    if cancel.is_cancelled() {
        return Ok(ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Cancelled,
        });
    }
    Ok(ExecutionOutcome::from_status(status, String::new()))
}
