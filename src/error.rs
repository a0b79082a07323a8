// Error handling framework for the language host
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HostError>;

/// Main error type for the language host
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Toolchain(#[from] Box<ToolchainError>),

    #[error("{0}")]
    Discovery(#[from] Box<DiscoveryError>),

    #[error("Process execution failed: {0}")]
    Process(#[from] Box<ProcessError>),

    #[error("Unable to start debugging: {0}")]
    Debug(#[from] Box<DebugError>),

    #[error("Engine communication failed: {0}")]
    Engine(#[from] Box<EngineError>),

    #[error("Invalid request: {0}")]
    Config(#[from] Box<ConfigError>),

    #[error("Protocol error: {0}")]
    Protocol(#[from] Box<ProtocolError>),

    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// The subprocess already showed the user an actionable message.
    #[error("'{command}' reported an error to the user")]
    Bail { command: String },
}

/// Errors raised while driving the external toolchain
#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("could not find `{executable}` on the $PATH: {error}")]
    NotFound { executable: String, error: String },

    #[error("'{command}' exited with non-zero exit code: {exit_code}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("'{command}' exited unexpectedly: {description}")]
    Terminated { command: String, description: String },

    #[error("Problem executing '{command}': {error}")]
    LaunchFailed { command: String, error: String },

    #[error("Could not {operation} because a binary was specified")]
    BinaryConfigured { operation: String },

    #[error("failed to find a project file in {directory}, and could not start debugging")]
    ProjectNotFound { directory: PathBuf },

    #[error("no package was produced in {directory}")]
    ArtifactNotFound { directory: PathBuf },
}

/// Package discovery failures. Output that does not match the expected shape
/// is always a hard error.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Unexpected output from '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error(
        "unexpected output from '{command}'. Program does not appear to reference any '{sdk_package}.*' packages"
    )]
    NoPackages { command: String, sdk_package: String },

    #[error("failed to parse \"{line}\" from '{command}'")]
    MalformedRow { command: String, line: String },

    #[error("invalid package version {version:?} for {package}: {error}")]
    InvalidVersion {
        package: String,
        version: String,
        error: String,
    },

    #[error("failed to read plugin metadata {path}: {error}")]
    MetadataRead { path: PathBuf, error: String },

    #[error("failed to parse plugin metadata {path}: {error}")]
    MetadataParse { path: PathBuf, error: String },

    #[error("failed to read version file {path}: {error}")]
    VersionFileRead { path: PathBuf, error: String },
}

/// Process execution errors with detailed context
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Output capture failed for '{command}': {message}")]
    OutputCaptureFailed { command: String, message: String },

    #[error("Failed to wait for '{command}': {error}")]
    WaitFailed { command: String, error: String },

    #[error("'{command}' was cancelled")]
    Cancelled { command: String },

    #[error("{message}")]
    ProgramFailed { message: String },
}

/// Debugger attach handshake failures
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("debugger startup timed out after {timeout:?} (process id {process_id})")]
    Timeout { process_id: u32, timeout: Duration },

    #[error("engine rejected debug session for process id {process_id}: {message}")]
    Rejected { process_id: u32, message: String },

    #[error("debugger attach to process id {process_id} was cancelled")]
    Cancelled { process_id: u32 },
}

/// Control channel errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no engine address was provided")]
    NotConfigured,

    #[error("language host could not make connection to engine at {address}: {error}")]
    ConnectFailed { address: String, error: String },

    #[error("engine call `{method}` failed: {error}")]
    CallFailed { method: String, error: String },

    #[error("engine rejected `{method}`: {message}")]
    Rejected { method: String, message: String },
}

/// Request and host configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to serialize {what}: {error}")]
    Serialization { what: String, error: String },
}

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {message}")]
    Malformed { message: String },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,
}

macro_rules! impl_from_boxed {
    ($($kind:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$kind> for HostError {
                fn from(error: $kind) -> Self {
                    HostError::$variant(Box::new(error))
                }
            }
        )*
    };
}

impl_from_boxed!(
    ToolchainError => Toolchain,
    DiscoveryError => Discovery,
    ProcessError => Process,
    DebugError => Debug,
    EngineError => Engine,
    ConfigError => Config,
    ProtocolError => Protocol,
);

/// Format errors with colors and context
pub struct ErrorFormatter {
    use_colors: bool,
}

impl ErrorFormatter {
    pub fn new(use_colors: bool) -> Self {
        Self { use_colors }
    }

    /// Format an error with context and colors
    pub fn format_error(&self, error: &HostError) -> String {
        use tracing::error;

        error!(error_type = error.kind(), error = %error, "Request failed");

        let mut output = String::new();

        if self.use_colors {
            output.push_str("\x1b[31m");
        }
        output.push_str("Error: ");
        if self.use_colors {
            output.push_str("\x1b[0m");
        }

        output.push_str(&error.to_string());

        match error {
            HostError::Toolchain(toolchain_err) => {
                self.add_toolchain_context(&mut output, toolchain_err.as_ref());
            }
            HostError::Debug(debug_err) => {
                if let DebugError::Timeout { timeout, .. } = debug_err.as_ref() {
                    output.push_str(&format!("\n  Timeout: {timeout:?}"));
                    output.push_str("\n  Help: Make sure a debugger is listening for the session");
                }
            }
            HostError::Engine(engine_err) => {
                if let EngineError::NotConfigured = engine_err.as_ref() {
                    output.push_str("\n  Help: Pass the engine address as the first argument");
                }
            }
            _ => {}
        }

        output
    }

    fn add_toolchain_context(&self, output: &mut String, error: &ToolchainError) {
        match error {
            ToolchainError::NonZeroExit { stdout, stderr, .. } => {
                if !stdout.trim().is_empty() {
                    output.push_str(&format!("\n  Output: {}", stdout.trim_end()));
                }
                if !stderr.trim().is_empty() {
                    output.push_str(&format!("\n  Error output: {}", stderr.trim_end()));
                }
            }
            ToolchainError::NotFound { executable, .. } => {
                output.push_str(&format!(
                    "\n  Help: Install `{executable}` or pass --use-executor"
                ));
            }
            _ => {}
        }
    }
}

/// Exit codes used by the host process and recognized from subprocesses
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const TOOLCHAIN_NOT_FOUND: i32 = 3;
    pub const PROCESS_ERROR: i32 = 9;
    pub const ENGINE_ERROR: i32 = 10;
    /// A subprocess exits with this code after it has already shown the user
    /// an actionable message. Nothing more should be reported.
    pub const ACTIONABLE_ERROR_REPORTED: i32 = 32;
}

impl HostError {
    /// Short, stable name for structured logging
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Toolchain(_) => "toolchain",
            HostError::Discovery(_) => "discovery",
            HostError::Process(_) => "process",
            HostError::Debug(_) => "debug",
            HostError::Engine(_) => "engine",
            HostError::Config(_) => "config",
            HostError::Protocol(_) => "protocol",
            HostError::Io(_) => "io",
            HostError::Bail { .. } => "bail",
        }
    }

    /// Get the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            HostError::Toolchain(toolchain_err) => match toolchain_err.as_ref() {
                ToolchainError::NotFound { .. } => exit_codes::TOOLCHAIN_NOT_FOUND,
                _ => exit_codes::PROCESS_ERROR,
            },
            HostError::Process(_) | HostError::Debug(_) => exit_codes::PROCESS_ERROR,
            HostError::Engine(_) => exit_codes::ENGINE_ERROR,
            HostError::Config(_) => exit_codes::CONFIG_ERROR,
            HostError::Bail { .. } => exit_codes::ACTIONABLE_ERROR_REPORTED,
            HostError::Discovery(_) | HostError::Protocol(_) | HostError::Io(_) => {
                exit_codes::GENERAL_ERROR
            }
        }
    }

    /// Whether the caller should stay silent about this failure
    pub fn is_bail(&self) -> bool {
        matches!(self, HostError::Bail { .. })
    }

    /// Create a user-friendly error message with context
    pub fn user_message(&self, use_colors: bool) -> String {
        let formatter = ErrorFormatter::new(use_colors);
        formatter.format_error(self)
    }
}

impl From<serde_json::Error> for Box<ProtocolError> {
    fn from(error: serde_json::Error) -> Self {
        Box::new(ProtocolError::Malformed {
            message: error.to_string(),
        })
    }
}

impl From<serde_json::Error> for HostError {
    fn from(error: serde_json::Error) -> Self {
        HostError::Protocol(Box::<ProtocolError>::from(error))
    }
}
