// CLI interface for the language host using clap
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{HostConfig, DEFAULT_LISTEN_ADDRESS};
use crate::error::{exit_codes, Result};
use crate::host::LanguageHost;
use crate::logging::{init_logging, LogConfig, LogFormat};
use crate::server::{health_check, Server};

#[derive(Parser, Debug)]
#[command(
    name = "langhost",
    about = "Language host bridging the deployment engine to the dotnet toolchain",
    version = crate::VERSION,
    long_about = "Serves build, run and dependency requests for .NET programs. The port the host listens on is printed to stdout."
)]
pub struct Cli {
    /// Address of the engine's control channel
    #[arg(value_name = "ENGINE_ADDRESS")]
    pub engine_address: Option<String>,

    /// Emit tracing to a Zipkin-compatible tracing endpoint
    #[arg(long, value_name = "URL")]
    pub tracing: Option<String>,

    /// A relative or an absolute path to a precompiled .NET assembly or
    /// self-contained executable to run
    #[arg(long, value_name = "PATH")]
    pub binary: Option<String>,

    /// Project root path to use
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Use the given program as the executor instead of looking for one on PATH
    #[arg(long = "use-executor", value_name = "PATH")]
    pub use_executor: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen: String,

    /// Enable verbose diagnostics
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Diagnostic log format
    #[arg(long, value_enum, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,
}

impl Cli {
    /// Settings derived from flags and environment overrides.
    pub fn host_config(&self) -> Result<HostConfig> {
        let mut config = HostConfig {
            root: self.root.clone(),
            tracing: self.tracing.clone().filter(|t| !t.is_empty()),
            listen: self.listen.clone(),
            ..HostConfig::default()
        };
        if let Some(ref binary) = self.binary {
            config = config.with_binary(binary.clone());
        }
        if let Some(ref executor) = self.use_executor {
            config = config.with_executor(executor.clone());
        }
        if let Some(ref address) = self.engine_address {
            config = config.with_engine_address(address.clone());
        }
        config.apply_env_overrides()
    }

    pub async fn run(&self) -> Result<i32> {
        self.init_logging();

        let config = self.host_config()?;
        let host = Arc::new(LanguageHost::from_config(config).await?);
        let server = Server::bind(Arc::clone(&host), &host.config().listen).await?;

        // The spawner reads the port from our first line of output.
        println!("{}", server.local_addr()?.port());

        let shutdown = CancellationToken::new();
        if host.config().engine_address.is_some() {
            tokio::spawn(health_check(
                Arc::clone(host.engine()),
                host.config().health_check_interval,
                shutdown.clone(),
            ));
        }

        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted");
                    ctrl_c.cancel();
                }
                Err(e) => error!(error = %e, "Unable to listen for interrupts"),
            }
        });

        server.serve(shutdown).await?;
        Ok(exit_codes::SUCCESS)
    }

    fn init_logging(&self) {
        let log_config = LogConfig::from_cli(self.verbose, self.quiet, self.log_format);

        if let Err(e) = init_logging(log_config) {
            eprintln!("Failed to initialize logging: {e}");
        }
    }
}
