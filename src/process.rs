// Subprocess execution with output sinks, outcome classification and
// cancellation

use crate::error::{exit_codes, ProcessError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

const PIPE_CHUNK_SIZE: usize = 8 * 1024;

/// How the child's stdout and stderr are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the host's own stdout/stderr
    Inherit,
    /// Pipe both streams back to the host
    Piped,
}

/// One command to execute
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub inherit_env: bool,
    pub output: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            environment: HashMap::new(),
            inherit_env: true,
            output: OutputMode::Piped,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_environment(mut self, env: HashMap<String, String>) -> Self {
        self.environment = env;
        self
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Command line as shown to users, e.g. `dotnet build -nologo`.
    pub fn command_line(&self) -> String {
        let name = self
            .program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());

        std::iter::once(name)
            .chain(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if !self.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&self.environment);

        match self.output {
            OutputMode::Piped => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        // Own group, so a kill reaches whatever the child spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// Why a process never ran to completion
#[derive(Debug)]
pub enum LaunchFailure {
    /// The OS refused to start the process (missing binary, permissions)
    Spawn(std::io::Error),
    /// The caller's cancellation token fired and the process was killed
    Cancelled,
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchFailure::Spawn(error) => write!(f, "{error}"),
            LaunchFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of running one invocation
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success { stdout: String },
    NonZeroExit { code: i32 },
    Signaled { description: String },
    LaunchFailure { cause: LaunchFailure },
}

impl ExecutionOutcome {
    /// Classify an exit status, attaching captured stdout on success.
    pub fn from_status(status: ExitStatus, stdout: String) -> Self {
        match status.code() {
            Some(0) => ExecutionOutcome::Success { stdout },
            Some(code) => ExecutionOutcome::NonZeroExit { code },
            None => ExecutionOutcome::Signaled {
                description: describe_termination(status),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// The process exited with the sentinel code: it already printed an
    /// actionable error and nothing else should be reported.
    pub fn already_reported(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::NonZeroExit {
                code: exit_codes::ACTIONABLE_ERROR_REPORTED
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::LaunchFailure {
                cause: LaunchFailure::Cancelled
            }
        )
    }
}

#[cfg(unix)]
fn describe_termination(status: ExitStatus) -> String {
    match status.signal() {
        Some(signal) => match nix::sys::signal::Signal::try_from(signal) {
            Ok(name) => format!("terminated by signal {name}"),
            Err(_) => format!("terminated by signal {signal}"),
        },
        None => format!("{status}"),
    }
}

#[cfg(not(unix))]
fn describe_termination(status: ExitStatus) -> String {
    format!("{status}")
}

/// Destination for one of a child's output streams
#[async_trait]
pub trait OutputSink: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Bytes retained by this sink, if it keeps any.
    fn captured(&self) -> Option<&[u8]> {
        None
    }
}

/// Sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct BufferedSink {
    pub data: Vec<u8>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[async_trait]
impl OutputSink for BufferedSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn captured(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

/// Launches invocations and classifies how they ended
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Start a process without waiting for it.
    pub fn spawn(&self, invocation: &Invocation) -> std::io::Result<RunningProcess> {
        let command_line = invocation.command_line();
        debug!(command = %command_line, cwd = ?invocation.working_dir, "Launching process");

        let child = invocation.to_command().spawn()?;
        let pid = child.id().unwrap_or_default();
        debug!(command = %command_line, pid, "Process started");

        Ok(RunningProcess {
            child,
            pid,
            command: command_line,
        })
    }

    /// Run an invocation to completion, pumping its output into the sinks.
    ///
    /// Returns `Err` only when a sink fails; the process is killed first.
    pub async fn run(
        &self,
        invocation: &Invocation,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let invocation = invocation.clone().with_output(OutputMode::Piped);
        let mut process = match self.spawn(&invocation) {
            Ok(process) => process,
            Err(error) => {
                warn!(command = %invocation.command_line(), %error, "Failed to launch process");
                return Ok(ExecutionOutcome::LaunchFailure {
                    cause: LaunchFailure::Spawn(error),
                });
            }
        };

        let kill_switch = cancel.child_token();
        let status = process
            .wait_with_output(Some(&mut *stdout), Some(&mut *stderr), &kill_switch)
            .await?;

        if cancel.is_cancelled() {
            return Ok(ExecutionOutcome::LaunchFailure {
                cause: LaunchFailure::Cancelled,
            });
        }

        let captured = stdout
            .captured()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        Ok(ExecutionOutcome::from_status(status, captured))
    }
}

/// A spawned child process
#[derive(Debug)]
pub struct RunningProcess {
    child: Child,
    pid: u32,
    command: String,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Pump piped output into the sinks and wait for the process to exit.
    ///
    /// The process is killed as soon as `kill_switch` fires, and also when a
    /// sink fails. Firing the switch more than once is harmless.
    pub async fn wait_with_output(
        &mut self,
        stdout_sink: Option<&mut dyn OutputSink>,
        stderr_sink: Option<&mut dyn OutputSink>,
        kill_switch: &CancellationToken,
    ) -> Result<ExitStatus> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        let command = self.command.clone();

        let pid = self.pid;
        let pumps = async {
            let pumped = async {
                tokio::try_join!(
                    pump(stdout, stdout_sink, &command),
                    pump(stderr, stderr_sink, &command)
                )
            };
            tokio::select! {
                result = pumped => {
                    if result.is_err() {
                        kill_switch.cancel();
                    }
                    result.map(|_| ())
                }
                // Output after a kill is discarded; a surviving descendant
                // must not keep the pipes and this call open.
                _ = kill_switch.cancelled() => {
                    kill_process_group(pid);
                    Ok(())
                }
            }
        };

        let child = &mut self.child;
        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = kill_switch.cancelled() => {
                    debug!(pid, "Killing process group");
                    kill_process_group(pid);
                    // Fails only if the process already exited.
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        };

        let (pumped, status) = tokio::join!(pumps, wait);
        pumped?;

        let status = status.map_err(|e| ProcessError::WaitFailed {
            command: self.command.clone(),
            error: e.to_string(),
        })?;
        debug!(command = %self.command, pid = self.pid, %status, "Process exited");
        Ok(status)
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            kill_process_group(self.pid);
        }
    }
}

/// SIGKILL every process in the group led by `pid`. A group that is
/// already gone is not an error.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if pid == 0 {
        return;
    }
    if let Err(errno) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, %errno, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

async fn pump<R>(
    reader: Option<R>,
    sink: Option<&mut dyn OutputSink>,
    command: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut sink = sink;
    let mut buf = vec![0u8; PIPE_CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ProcessError::OutputCaptureFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;
        if n == 0 {
            return Ok(());
        }
        if let Some(sink) = sink.as_deref_mut() {
            sink.write(&buf[..n]).await?;
        }
    }
}

/// Environment builder for process execution
pub struct ProcessEnvironment {
    base_env: HashMap<String, String>,
}

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self {
            base_env: HashMap::new(),
        }
    }

    pub fn set_var(&mut self, key: &str, value: &str) -> &mut Self {
        self.base_env.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the variable only when `value` is non-empty.
    pub fn set_non_empty(&mut self, key: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.set_var(key, value);
        }
        self
    }

    pub fn build(&self) -> HashMap<String, String> {
        self.base_env.clone()
    }
}

impl Default for ProcessEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Current directory, used when an invocation names none.
pub fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
}
