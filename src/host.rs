// The language host: one handler per RPC, each failing in isolation

use crate::config::{BuildCache, HostConfig, RunRequest};
use crate::debug::{supervise, AttachTarget};
use crate::discovery::{parse_dependency_list, resolve_plugins, DependencyInfo, PluginDescriptor};
use crate::engine::{DetachedEngine, Engine, EngineClient};
use crate::error::{Result, ToolchainError};
use crate::process::{
    default_working_dir, ExecutionOutcome, LaunchFailure, OutputMode, OutputSink, ProcessRunner,
};
use crate::program::{
    build_debugging_assembly, plugin_project, plugin_result, run_invocation, run_response,
    LaunchMode,
};
use crate::protocol::{
    AboutResponse, GetProgramDependenciesRequest, GetRequiredPluginsRequest,
    InstallDependenciesRequest, PackRequest, RunPluginRequest, RunResponse,
};
use crate::toolchain::{CommandContext, Toolchain};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LanguageHost {
    config: HostConfig,
    toolchain: Option<Toolchain>,
    engine: Arc<dyn Engine>,
    runner: ProcessRunner,
    builds: BuildCache,
}

impl LanguageHost {
    pub fn new(config: HostConfig, toolchain: Option<Toolchain>, engine: Arc<dyn Engine>) -> Self {
        Self {
            config,
            toolchain,
            engine,
            runner: ProcessRunner::new(),
            builds: BuildCache::new(),
        }
    }

    /// Locate the toolchain and connect to the engine.
    ///
    /// A self-contained binary needs no toolchain; everything else fails
    /// here when `dotnet` cannot be found.
    pub async fn from_config(config: HostConfig) -> Result<Self> {
        let toolchain = match (&config.executor, &config.binary) {
            (Some(executor), _) => Some(Toolchain::locate(Some(executor.as_path()))?),
            (None, Some(binary)) if !LaunchMode::from_binary(binary).needs_toolchain() => {
                info!("A self-contained binary needs no toolchain");
                None
            }
            (None, _) => Some(Toolchain::locate(None)?),
        };

        let engine: Arc<dyn Engine> = match config.engine_address {
            Some(ref address) => Arc::new(EngineClient::connect(address.clone()).await?),
            None => {
                warn!("No engine address given, logging locally");
                Arc::new(DetachedEngine)
            }
        };

        Ok(Self::new(config, toolchain, engine))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn builds(&self) -> &BuildCache {
        &self.builds
    }

    fn toolchain(&self) -> Result<&Toolchain> {
        self.toolchain.as_ref().ok_or_else(|| {
            ToolchainError::NotFound {
                executable: crate::toolchain::DOTNET.to_string(),
                error: "the host was started for a self-contained binary".to_string(),
            }
            .into()
        })
    }

    fn context<'a>(&'a self, working_dir: &'a Path, cancel: &'a CancellationToken) -> CommandContext<'a> {
        CommandContext {
            engine: &self.engine,
            working_dir,
            cancel,
        }
    }

    fn launch_mode(&self, entry: Option<&str>, working_dir: &Path) -> LaunchMode {
        LaunchMode::for_program(
            self.config.binary.as_deref(),
            entry,
            self.builds.contains(working_dir),
        )
    }

    /// Build the program and work out which plugins its packages need.
    pub async fn get_required_plugins(
        &self,
        request: &GetRequiredPluginsRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<PluginDescriptor>> {
        if self.config.has_binary() {
            debug!("No plugins can be listed when a binary is specified");
            return Ok(Vec::new());
        }

        let toolchain = self.toolchain()?;
        let ctx = self.context(&request.program_directory, cancel);

        toolchain.build(ctx, request.program.as_deref()).await?;
        self.builds.record(&request.program_directory);

        let packages = toolchain.referenced_packages(ctx).await?;
        let package_dir = toolchain.global_packages_dir(ctx).await?;
        let plugins = resolve_plugins(&package_dir, &packages)?;
        info!(count = plugins.len(), "Resolved required plugins");
        Ok(plugins)
    }

    /// Run the user program to completion.
    pub async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunResponse> {
        request.validate()?;

        let working_dir = if request.pwd.as_os_str().is_empty() {
            default_working_dir()
        } else {
            request.pwd.clone()
        };

        let mut mode = self.launch_mode(request.entry_point(), &working_dir);
        if request.attach_debugger && matches!(mode, LaunchMode::Source { .. }) {
            let ctx = self.context(&working_dir, cancel);
            let assembly =
                build_debugging_assembly(self.toolchain()?, ctx, request.entry_point()).await?;
            mode = LaunchMode::Assembly(assembly);
        }

        let invocation = run_invocation(&mode, self.toolchain.as_ref(), request, &self.config)?
            .with_working_dir(&working_dir);
        let command = invocation.command_line();

        let process = match self.runner.spawn(&invocation) {
            Ok(process) => process,
            Err(error) => {
                return run_response(
                    &command,
                    ExecutionOutcome::LaunchFailure {
                        cause: LaunchFailure::Spawn(error),
                    },
                )
            }
        };
        info!(pid = process.pid(), command = %command, "Program started");

        let attach_to = request.attach_debugger.then(|| AttachTarget {
            engine: self.engine.as_ref(),
            timeout: self.config.debug_attach_timeout,
        });
        let outcome = supervise(process, None, None, attach_to, cancel).await?;
        run_response(&command, outcome)
    }

    /// List the program's package references.
    pub async fn get_program_dependencies(
        &self,
        request: &GetProgramDependenciesRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<DependencyInfo>> {
        if self.config.has_binary() {
            return Err(ToolchainError::BinaryConfigured {
                operation: "get dependencies".to_string(),
            }
            .into());
        }

        let toolchain = self.toolchain()?;
        let ctx = self.context(&request.program_directory, cancel);
        let output = toolchain.list_packages(ctx, request.transitive).await?;

        let command = if request.transitive {
            "dotnet list package --include-transitive"
        } else {
            "dotnet list package"
        };
        parse_dependency_list(&output, command)
    }

    /// Restore and build, streaming the toolchain's output live.
    pub async fn install_dependencies(
        &self,
        request: &InstallDependenciesRequest,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(directory = %request.directory.display(), is_terminal = request.is_terminal, "Installing dependencies");
        stdout.write(b"Installing dependencies...\n\n").await?;

        let toolchain = self.toolchain()?;
        let invocation = toolchain
            .invocation(["build"])
            .with_working_dir(&request.directory);
        toolchain
            .run_with_sinks(&invocation, stdout, stderr, cancel)
            .await?;
        self.builds.record(&request.directory);

        stdout.write(b"Finished installing dependencies\n\n").await?;
        Ok(())
    }

    /// Run a plugin with exactly the environment it was given.
    pub async fn run_plugin(
        &self,
        request: &RunPluginRequest,
        stdout: &mut dyn OutputSink,
        stderr: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(program = %request.program, "Attempting to run plugin");

        let mut mode = match self.config.binary {
            Some(ref binary) => LaunchMode::from_binary(binary),
            None => LaunchMode::Source {
                entry: None,
                no_build: false,
            },
        };
        // `dotnet run` would hand the debugger its own pid, so debug the
        // plugin's assembly directly.
        if request.attach_debugger && matches!(mode, LaunchMode::Source { .. }) {
            let (project_dir, entry) = plugin_project(&request.pwd, &request.program);
            let ctx = self.context(&project_dir, cancel);
            let assembly =
                build_debugging_assembly(self.toolchain()?, ctx, entry.as_deref()).await?;
            mode = LaunchMode::Assembly(project_dir.join(assembly));
        }

        let invocation = mode
            .plugin_invocation(self.toolchain.as_ref(), &request.program, &request.args)?
            .with_working_dir(&request.pwd)
            .with_inherit_env(false)
            .with_environment(request.env.clone())
            .with_output(OutputMode::Piped);
        let command = invocation.command_line();

        let process = match self.runner.spawn(&invocation) {
            Ok(process) => process,
            Err(error) => {
                return plugin_result(
                    &command,
                    ExecutionOutcome::LaunchFailure {
                        cause: LaunchFailure::Spawn(error),
                    },
                )
            }
        };

        let attach_to = request.attach_debugger.then(|| AttachTarget {
            engine: self.engine.as_ref(),
            timeout: self.config.debug_attach_timeout,
        });
        let outcome = supervise(process, Some(stdout), Some(stderr), attach_to, cancel).await?;
        plugin_result(&command, outcome)
    }

    /// Package the program and return the produced `.nupkg`.
    pub async fn pack(&self, request: &PackRequest, cancel: &CancellationToken) -> Result<PathBuf> {
        let toolchain = self.toolchain()?;
        let ctx = self.context(&request.package_directory, cancel);

        tokio::fs::create_dir_all(&request.destination_directory).await?;
        toolchain.pack(ctx, &request.destination_directory).await?;
        newest_package(&request.destination_directory)
    }

    /// Toolchain location and version.
    pub async fn about(&self, cancel: &CancellationToken) -> Result<AboutResponse> {
        let toolchain = self.toolchain()?;
        let working_dir = default_working_dir();
        let version = toolchain
            .version(self.context(&working_dir, cancel))
            .await?;
        Ok(AboutResponse {
            executable: toolchain.executable().to_path_buf(),
            version,
        })
    }

    pub fn plugin_info(&self) -> String {
        crate::VERSION.to_string()
    }
}

fn newest_package(dir: &Path) -> Result<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("nupkg") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path).ok_or_else(|| {
        ToolchainError::ArtifactNotFound {
            directory: dir.to_path_buf(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_newest_package() {
        let dir = TempDir::new().unwrap();
        assert!(newest_package(dir.path()).is_err());

        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("App.1.0.0.nupkg"), "").unwrap();
        let found = newest_package(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "App.1.0.0.nupkg");
    }

    #[tokio::test]
    async fn test_binary_short_circuits() {
        let config = HostConfig::default().with_binary("bin/app");
        let host = LanguageHost::new(config, None, Arc::new(DetachedEngine));
        let cancel = CancellationToken::new();

        let plugins = host
            .get_required_plugins(
                &GetRequiredPluginsRequest {
                    program_directory: PathBuf::from("."),
                    program: None,
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(plugins.is_empty());

        let error = host
            .get_program_dependencies(
                &GetProgramDependenciesRequest {
                    program_directory: PathBuf::from("."),
                    transitive: false,
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            "Could not get dependencies because a binary was specified"
        );
    }
}
