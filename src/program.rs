// Launching user programs and plugins

use crate::config::{HostConfig, RunRequest};
use crate::debug::AttachState;
use crate::error::{HostError, ProcessError, Result, ToolchainError};
use crate::process::{ExecutionOutcome, Invocation, LaunchFailure, OutputMode, ProcessEnvironment};
use crate::protocol::RunResponse;
use crate::toolchain::{CommandContext, Toolchain, DEBUGGING_OUTPUT_DIR};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::{DirEntry, WalkDir};

const PROJECT_EXTENSIONS: [&str; 3] = ["csproj", "fsproj", "vbproj"];

/// How a program is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Portable assembly, run as `dotnet <dll>`
    Assembly(PathBuf),
    /// Self-contained executable, run directly
    Binary(PathBuf),
    /// `dotnet run` against the sources
    Source { entry: Option<String>, no_build: bool },
}

impl LaunchMode {
    pub fn from_binary(binary: &str) -> Self {
        if binary.ends_with(".dll") {
            LaunchMode::Assembly(PathBuf::from(binary))
        } else {
            LaunchMode::Binary(PathBuf::from(binary))
        }
    }

    /// Pick the launch mode for a program run.
    pub fn for_program(binary: Option<&str>, entry: Option<&str>, built: bool) -> Self {
        let mode = match binary {
            Some(binary) => Self::from_binary(binary),
            None => LaunchMode::Source {
                entry: entry.map(str::to_string),
                no_build: built,
            },
        };
        trace!(state = ?AttachState::Idle, ?mode, "Selected launch mode");
        mode
    }

    pub fn needs_toolchain(&self) -> bool {
        !matches!(self, LaunchMode::Binary(_))
    }

    /// Command that runs the program.
    pub fn program_invocation(&self, toolchain: Option<&Toolchain>) -> Result<Invocation> {
        let invocation = match self {
            LaunchMode::Assembly(dll) => require(toolchain)?.invocation([dll.as_os_str()]),
            LaunchMode::Binary(binary) => Invocation::new(binary),
            LaunchMode::Source { entry, no_build } => {
                let mut args = vec!["run"];
                if *no_build {
                    args.push("--no-build");
                }
                args.extend(entry.as_deref());
                require(toolchain)?.invocation(args)
            }
        };
        trace!(state = ?AttachState::Launching, command = %invocation.command_line(), "Launching program");
        Ok(invocation)
    }

    /// Command that runs a plugin, with the plugin's own arguments appended.
    pub fn plugin_invocation(
        &self,
        toolchain: Option<&Toolchain>,
        program: &str,
        args: &[String],
    ) -> Result<Invocation> {
        let mut invocation = match self {
            LaunchMode::Source { .. } => {
                let mut base = vec!["run"];
                if !program.is_empty() {
                    base.extend(["--project", program]);
                }
                require(toolchain)?.invocation(base)
            }
            mode => mode.program_invocation(toolchain)?,
        };
        invocation.args.extend(args.iter().map(Into::into));
        Ok(invocation)
    }
}

fn require(toolchain: Option<&Toolchain>) -> Result<&Toolchain> {
    toolchain.ok_or_else(|| {
        HostError::from(ToolchainError::NotFound {
            executable: crate::toolchain::DOTNET.to_string(),
            error: "no toolchain was located at startup".to_string(),
        })
    })
}

/// Variables passed to a program on top of the host's environment. Empty
/// values are left out.
pub fn program_environment(
    request: &RunRequest,
    host: &HostConfig,
) -> Result<HashMap<String, String>> {
    let config = request.config_json()?;
    let secret_keys = request.config_secret_keys_json()?;
    let pwd = request.pwd.to_string_lossy();

    let mut env = ProcessEnvironment::new();
    env.set_non_empty("PULUMI_MONITOR", &request.monitor_address)
        .set_non_empty("PULUMI_ENGINE", host.engine_address.as_deref().unwrap_or_default())
        .set_non_empty("PULUMI_ORGANIZATION", &request.organization)
        .set_non_empty("PULUMI_PROJECT", &request.project)
        .set_non_empty("PULUMI_STACK", &request.stack)
        .set_non_empty("PULUMI_PWD", &pwd)
        .set_non_empty("PULUMI_DRY_RUN", &request.dry_run.to_string())
        .set_non_empty("PULUMI_QUERY_MODE", &request.query_mode.to_string())
        .set_non_empty("PULUMI_PARALLEL", &request.parallel.to_string())
        .set_non_empty("PULUMI_TRACING", host.tracing.as_deref().unwrap_or_default())
        .set_non_empty("PULUMI_CONFIG", &config)
        .set_non_empty("PULUMI_CONFIG_SECRET_KEYS", &secret_keys)
        .set_non_empty("PULUMI_ATTACH_DEBUGGER", &request.attach_debugger.to_string());
    Ok(env.build())
}

/// Full invocation for `run`: launch command, working directory and
/// environment, with output shared with the host.
pub fn run_invocation(
    mode: &LaunchMode,
    toolchain: Option<&Toolchain>,
    request: &RunRequest,
    host: &HostConfig,
) -> Result<Invocation> {
    let mut invocation = mode
        .program_invocation(toolchain)?
        .with_environment(program_environment(request, host)?)
        .with_output(OutputMode::Inherit);
    if !request.pwd.as_os_str().is_empty() {
        invocation = invocation.with_working_dir(&request.pwd);
    }
    Ok(invocation)
}

fn is_project_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PROJECT_EXTENSIONS.contains(&ext))
}

fn is_build_output(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && matches!(entry.file_name().to_str(), Some("bin" | "obj"))
}

/// Locate the project file for `dir`. An entry point naming a project file
/// wins; otherwise the first project file in a sorted walk is used.
pub fn find_project_file(dir: &Path, entry: Option<&str>) -> Result<PathBuf> {
    if let Some(entry) = entry.map(Path::new).filter(|e| is_project_file(e)) {
        return Ok(dir.join(entry));
    }

    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_build_output(e))
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && is_project_file(e.path()))
        .map(|e| e.into_path())
        .ok_or_else(|| {
            ToolchainError::ProjectNotFound {
                directory: dir.to_path_buf(),
            }
            .into()
        })
}

/// Split a plugin's `program` into the directory to build in and the project
/// file to build, if it names one.
pub fn plugin_project(pwd: &Path, program: &str) -> (PathBuf, Option<String>) {
    let path = pwd.join(program);
    if !is_project_file(&path) {
        return (path, None);
    }
    let entry = path.file_name().map(|name| name.to_string_lossy().into_owned());
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| pwd.to_path_buf());
    (dir, entry)
}

/// Build the program into the debugging output directory and return the
/// assembly to launch, relative to `ctx.working_dir`.
pub async fn build_debugging_assembly(
    toolchain: &Toolchain,
    ctx: CommandContext<'_>,
    entry: Option<&str>,
) -> Result<PathBuf> {
    let project = find_project_file(ctx.working_dir, entry)?;
    let Some(stem) = project.file_stem() else {
        return Err(ToolchainError::ProjectNotFound {
            directory: ctx.working_dir.to_path_buf(),
        }
        .into());
    };

    toolchain.build_for_debugging(ctx, entry).await?;

    let mut assembly = PathBuf::from(DEBUGGING_OUTPUT_DIR).join(stem);
    assembly.set_extension("dll");
    debug!(assembly = %assembly.display(), "Built debugging assembly");
    Ok(assembly)
}

fn describe_exit(outcome: &ExecutionOutcome) -> Option<String> {
    match outcome {
        ExecutionOutcome::Success { .. } => None,
        ExecutionOutcome::NonZeroExit { code } => {
            Some(format!("Program exited with non-zero exit code: {code}"))
        }
        ExecutionOutcome::Signaled { description } => {
            Some(format!("Program exited unexpectedly: {description}"))
        }
        ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Spawn(error),
        } => Some(format!(
            "Problem executing program (could not run language executor): {error}"
        )),
        ExecutionOutcome::LaunchFailure {
            cause: LaunchFailure::Cancelled,
        } => Some("Program was cancelled".to_string()),
    }
}

/// Turn how a program ended into the `run` response. A program that already
/// showed the user an actionable error bails quietly.
pub fn run_response(command: &str, outcome: ExecutionOutcome) -> Result<RunResponse> {
    if outcome.already_reported() {
        return Ok(RunResponse::bail());
    }
    if outcome.is_cancelled() {
        return Err(ProcessError::Cancelled {
            command: command.to_string(),
        }
        .into());
    }
    Ok(match describe_exit(&outcome) {
        None => RunResponse::success(),
        Some(message) => RunResponse::failed(message),
    })
}

/// Plugins have no bail channel: any failure is an error.
pub fn plugin_result(command: &str, outcome: ExecutionOutcome) -> Result<()> {
    if outcome.is_cancelled() {
        return Err(ProcessError::Cancelled {
            command: command.to_string(),
        }
        .into());
    }
    match describe_exit(&outcome) {
        None => Ok(()),
        Some(message) => Err(ProcessError::ProgramFailed { message }.into()),
    }
}
