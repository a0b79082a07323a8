// Diagnostic logging for the language host. Everything goes to stderr since
// stdout carries the port handshake.
use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, EnvFilter};

use crate::error::{ConfigError, Result};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Color output configuration
    pub color: ColorConfig,
    /// Whether to show targets (module names)
    pub show_targets: bool,
}

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    /// One JSON object per line, for log collectors
    Json,
    Compact,
}

/// Color output configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ColorConfig {
    Auto,
    Always,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            color: ColorConfig::Auto,
            show_targets: false,
        }
    }
}

impl LogConfig {
    /// Create logging configuration from CLI arguments
    pub fn from_cli(verbose: bool, quiet: bool, format: Option<LogFormat>) -> Self {
        let level = if quiet {
            Level::ERROR
        } else if verbose {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            level,
            format: format.unwrap_or(LogFormat::Compact),
            color: ColorConfig::Auto,
            show_targets: verbose,
        }
    }

    /// Check if colors should be used based on configuration and terminal
    pub fn should_use_colors(&self) -> bool {
        match self.color {
            ColorConfig::Always => true,
            ColorConfig::Never => false,
            ColorConfig::Auto => {
                io::stderr().is_terminal()
                    && std::env::var("TERM").map_or(true, |term| term != "dumb")
                    && std::env::var("NO_COLOR").is_err()
            }
        }
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let directive: Directive = format!("langhost={}", self.level)
            .parse()
            .map_err(|e: tracing_subscriber::filter::ParseError| ConfigError::InvalidValue {
                field: "log level".to_string(),
                message: e.to_string(),
            })?;
        Ok(EnvFilter::from_default_env().add_directive(directive))
    }
}

/// Initialize the logging system with the given configuration
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = config.env_filter()?;
    let ansi = config.should_use_colors();

    match config.format {
        LogFormat::Pretty => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .with_ansi(ansi)
            .with_target(config.show_targets)
            .pretty()
            .init(),
        LogFormat::Json => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .json()
            .init(),
        LogFormat::Compact => fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .with_ansi(ansi)
            .with_target(config.show_targets)
            .compact()
            .init(),
    }

    Ok(())
}

/// Span helpers shared by the server and the host
pub mod utils {
    use tracing::{info_span, Span};
    use uuid::Uuid;

    /// Span covering one RPC, tagged with a fresh request id
    pub fn request_span(method: &str) -> Span {
        let request_id = Uuid::new_v4();
        info_span!("request", method = %method, request_id = %request_id)
    }

    /// Span covering one toolchain command
    pub fn command_span(command: &str) -> Span {
        tracing::debug_span!("command", command = %command)
    }
}
