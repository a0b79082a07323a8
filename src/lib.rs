// langhost - Library module
// Language host bridging the deployment engine to the dotnet toolchain

pub mod cli;
pub mod config;
pub mod debug;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod logstream;
pub mod process;
pub mod program;
pub mod protocol;
pub mod server;
pub mod toolchain;

// Re-export main types for easier access
pub use config::{BuildCache, HostConfig, RunRequest};
pub use debug::{AttachState, DebugSessionConfig, StartDebuggingRequest};
pub use discovery::{DependencyInfo, PackageRecord, PluginDescriptor, PluginMetadata, VersionFile};
pub use engine::{DetachedEngine, Engine, EngineClient};
pub use error::{
    exit_codes, ConfigError, DebugError, DiscoveryError, EngineError, HostError, ProcessError,
    ProtocolError, Result, ToolchainError,
};
pub use host::LanguageHost;
pub use logging::{ColorConfig, LogConfig, LogFormat};
pub use logstream::{CommandStreams, LogEvent, LogSeverity, LogWriter, StreamId};
pub use process::{
    BufferedSink, ExecutionOutcome, Invocation, LaunchFailure, OutputMode, OutputSink,
    ProcessEnvironment, ProcessRunner, RunningProcess,
};
pub use program::LaunchMode;
pub use protocol::{Request, Response, RunResponse};
pub use server::Server;
pub use toolchain::{CapturedOutput, CommandContext, FailureOutput, Toolchain};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
