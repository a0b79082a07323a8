// The dotnet toolchain and the subcommands the host drives

use crate::discovery::{parse_package_directory, parse_package_list, PackageRecord};
use crate::engine::Engine;
use crate::error::{HostError, ProcessError, Result, ToolchainError};
use crate::logging::utils::command_span;
use crate::logstream::CommandStreams;
use crate::process::{ExecutionOutcome, Invocation, LaunchFailure, OutputSink, ProcessRunner};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

pub const DOTNET: &str = "dotnet";

/// Output directory for debugging builds, relative to the program
pub const DEBUGGING_OUTPUT_DIR: &str = "bin/pulumi-debugging";

/// Shared inputs of one toolchain command
#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    pub engine: &'a Arc<dyn Engine>,
    pub working_dir: &'a Path,
    pub cancel: &'a CancellationToken,
}

/// Where the buffered output of a quiet command goes when it fails
#[derive(Debug, Clone, Default)]
pub enum FailureOutput {
    /// The host's own stdout and stderr
    #[default]
    Host,
    /// Kept in memory
    Captured(Arc<Mutex<CapturedOutput>>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A located `dotnet` executable
#[derive(Debug, Clone)]
pub struct Toolchain {
    executable: PathBuf,
    runner: ProcessRunner,
    failure_output: FailureOutput,
}

impl Toolchain {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            runner: ProcessRunner::new(),
            failure_output: FailureOutput::default(),
        }
    }

    pub fn with_failure_output(mut self, output: FailureOutput) -> Self {
        self.failure_output = output;
        self
    }

    /// Use `executor` when given, otherwise find `dotnet` on the `$PATH`.
    pub fn locate(executor: Option<&Path>) -> Result<Self> {
        if let Some(path) = executor {
            debug!(executable = %path.display(), "Using configured executor");
            return Ok(Self::new(path));
        }

        let executable = which::which(DOTNET).map_err(|e| ToolchainError::NotFound {
            executable: DOTNET.to_string(),
            error: e.to_string(),
        })?;
        debug!(executable = %executable.display(), "Found dotnet");
        Ok(Self::new(executable))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Invocation::new(&self.executable).with_args(args)
    }

    /// Run a toolchain command through a fresh pair of log streams.
    ///
    /// With `log_to_user` the output is streamed to the engine as it arrives;
    /// otherwise it stays buffered and is written to the host's own
    /// stdout/stderr only if the command fails. Returns captured stdout.
    pub async fn run_command(
        &self,
        ctx: CommandContext<'_>,
        args: &[&str],
        log_to_user: bool,
    ) -> Result<String> {
        let invocation = self.invocation(args).with_working_dir(ctx.working_dir);
        let command = invocation.command_line();
        self.run_streams(ctx, &invocation, &command, log_to_user)
            .instrument(command_span(&command))
            .await
    }

    async fn run_streams(
        &self,
        ctx: CommandContext<'_>,
        invocation: &Invocation,
        command: &str,
        log_to_user: bool,
    ) -> Result<String> {
        let mut streams = CommandStreams::new(ctx.engine, log_to_user);
        if log_to_user {
            streams.log_to_user(&format!("running '{command}'")).await?;
        }

        let outcome = self
            .runner
            .run(invocation, &mut streams.info, &mut streams.error, ctx.cancel)
            .await?;

        if let ExecutionOutcome::Success { stdout } = outcome {
            if log_to_user {
                streams
                    .log_to_user(&format!("'{command}' completed successfully"))
                    .await?;
            }
            return Ok(stdout);
        }

        let stdout = streams.info.buffered_text();
        let stderr = streams.error.buffered_text();
        if !streams.is_streaming() {
            match self.failure_output {
                FailureOutput::Host => {
                    streams
                        .flush_to(&mut tokio::io::stdout(), &mut tokio::io::stderr())
                        .await?
                }
                FailureOutput::Captured(ref captured) => {
                    let (mut out, mut err) = (Vec::new(), Vec::new());
                    streams.flush_to(&mut out, &mut err).await?;
                    let mut captured = captured.lock();
                    captured.stdout.extend(out);
                    captured.stderr.extend(err);
                }
            }
        }
        Err(command_failure(command, outcome, stdout, stderr))
    }

    /// Run a toolchain command with its output going to caller-supplied sinks.
    pub async fn run_with_sinks(
        &self,
        invocation: &Invocation,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command = invocation.command_line();
        let outcome = self
            .runner
            .run(invocation, stdout, stderr, cancel)
            .instrument(command_span(&command))
            .await?;

        match outcome {
            ExecutionOutcome::Success { .. } => Ok(()),
            outcome => Err(command_failure(&command, outcome, String::new(), String::new())),
        }
    }

    /// `dotnet build -nologo [entry]`, streamed to the user.
    pub async fn build(&self, ctx: CommandContext<'_>, entry: Option<&str>) -> Result<()> {
        let mut args = vec!["build", "-nologo"];
        args.extend(entry);
        self.run_command(ctx, &args, true).await.map(|_| ())
    }

    /// `dotnet build -nologo -o bin/pulumi-debugging [entry]`, run quietly.
    pub async fn build_for_debugging(
        &self,
        ctx: CommandContext<'_>,
        entry: Option<&str>,
    ) -> Result<()> {
        let mut args = vec!["build", "-nologo", "-o", DEBUGGING_OUTPUT_DIR];
        args.extend(entry);
        self.run_command(ctx, &args, false).await.map(|_| ())
    }

    /// Raw `dotnet list package` output.
    pub async fn list_packages(&self, ctx: CommandContext<'_>, transitive: bool) -> Result<String> {
        let mut args = vec!["list", "package"];
        if transitive {
            args.push("--include-transitive");
        }
        self.run_command(ctx, &args, false).await
    }

    /// Packages referenced by the program, excluding the SDK itself.
    pub async fn referenced_packages(&self, ctx: CommandContext<'_>) -> Result<Vec<PackageRecord>> {
        let output = self.list_packages(ctx, true).await?;
        parse_package_list(&output, "dotnet list package --include-transitive")
    }

    /// Location of the local package cache.
    pub async fn global_packages_dir(&self, ctx: CommandContext<'_>) -> Result<PathBuf> {
        let args = ["nuget", "locals", "global-packages", "--list"];
        let output = self.run_command(ctx, &args, false).await?;
        parse_package_directory(&output, "dotnet nuget locals global-packages --list")
    }

    /// `dotnet --version`, trimmed.
    pub async fn version(&self, ctx: CommandContext<'_>) -> Result<String> {
        let output = self.run_command(ctx, &["--version"], false).await?;
        Ok(output.trim().to_string())
    }

    /// `dotnet pack -o <destination>`.
    pub async fn pack(&self, ctx: CommandContext<'_>, destination: &Path) -> Result<()> {
        let destination = destination.to_string_lossy().into_owned();
        self.run_command(ctx, &["pack", "-o", destination.as_str()], false)
            .await
            .map(|_| ())
    }
}

fn command_failure(
    command: &str,
    outcome: ExecutionOutcome,
    stdout: String,
    stderr: String,
) -> HostError {
    if outcome.already_reported() {
        return HostError::Bail {
            command: command.to_string(),
        };
    }

    match outcome {
        ExecutionOutcome::NonZeroExit { code } => ToolchainError::NonZeroExit {
            command: command.to_string(),
            exit_code: code,
            stdout,
            stderr,
        }
        .into(),
        ExecutionOutcome::Signaled { description } => ToolchainError::Terminated {
            command: command.to_string(),
            description,
        }
        .into(),
        ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Spawn(error),
        } => ToolchainError::LaunchFailed {
            command: command.to_string(),
            error: error.to_string(),
        }
        .into(),
        ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Cancelled,
        } => ProcessError::Cancelled {
            command: command.to_string(),
        }
        .into(),
        ExecutionOutcome::Success { .. } => ProcessError::WaitFailed {
            command: command.to_string(),
            error: "command succeeded".to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_with_executor() {
        let toolchain = Toolchain::locate(Some(Path::new("/opt/dotnet/dotnet"))).unwrap();
        assert_eq!(toolchain.executable(), Path::new("/opt/dotnet/dotnet"));
    }

    #[test]
    fn test_invocation_command_line() {
        let toolchain = Toolchain::new("/usr/bin/dotnet");
        let invocation = toolchain.invocation(["list", "package"]);
        assert_eq!(invocation.command_line(), "dotnet list package");
    }

    #[test]
    fn test_command_failure_classification() {
        let error = command_failure(
            "dotnet build",
            ExecutionOutcome::NonZeroExit { code: 32 },
            String::new(),
            String::new(),
        );
        assert!(error.is_bail());

        let error = command_failure(
            "dotnet build",
            ExecutionOutcome::NonZeroExit { code: 1 },
            "out".to_string(),
            "err".to_string(),
        );
        assert_eq!(
            error.to_string(),
            "'dotnet build' exited with non-zero exit code: 1"
        );
    }
}
