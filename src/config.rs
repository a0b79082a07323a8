// Host configuration and typed request payloads
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debug::DEFAULT_ATTACH_TIMEOUT;
use crate::error::{ConfigError, Result};

pub const DEBUG_ATTACH_TIMEOUT_ENV: &str = "LANGHOST_DEBUG_ATTACH_TIMEOUT_SECS";
pub const HEALTH_CHECK_INTERVAL_ENV: &str = "LANGHOST_HEALTH_CHECK_INTERVAL_SECS";
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:0";

/// Settings fixed for the lifetime of the host process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Explicit toolchain executable, bypassing `$PATH` lookup
    pub executor: Option<PathBuf>,
    /// Precompiled program: a `.dll` assembly or a self-contained binary
    pub binary: Option<String>,
    /// Project root, informational
    pub root: Option<PathBuf>,
    pub engine_address: Option<String>,
    /// Tracing endpoint forwarded to programs
    pub tracing: Option<String>,
    pub listen: String,
    pub debug_attach_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            executor: None,
            binary: None,
            root: None,
            engine_address: None,
            tracing: None,
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
            debug_attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }
}

impl HostConfig {
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into()).filter(|b| !b.is_empty());
        self
    }

    pub fn with_executor(mut self, executor: impl Into<PathBuf>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    pub fn with_engine_address(mut self, address: impl Into<String>) -> Self {
        self.engine_address = Some(address.into()).filter(|a| !a.is_empty());
        self
    }

    pub fn with_debug_attach_timeout(mut self, timeout: Duration) -> Self {
        self.debug_attach_timeout = timeout;
        self
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        if let Some(timeout) = env_seconds(DEBUG_ATTACH_TIMEOUT_ENV)? {
            self.debug_attach_timeout = timeout;
        }
        if let Some(interval) = env_seconds(HEALTH_CHECK_INTERVAL_ENV)? {
            self.health_check_interval = interval;
        }
        Ok(self)
    }

    /// Whether a precompiled program replaces building from source.
    pub fn has_binary(&self) -> bool {
        self.binary.is_some()
    }
}

fn env_seconds(name: &str) -> Result<Option<Duration>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let seconds: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
        ConfigError::InvalidValue {
            field: name.to_string(),
            message: format!("expected whole seconds, got {raw:?}: {e}"),
        }
    })?;
    if seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: name.to_string(),
            message: "must be greater than zero".to_string(),
        }
        .into());
    }
    Ok(Some(Duration::from_secs(seconds)))
}

/// Everything the engine passes when running a program
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub stack: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub pwd: PathBuf,
    /// Entry point, usually a project file
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub monitor_address: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub query_mode: bool,
    #[serde(default)]
    pub parallel: i32,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub config_secret_keys: Vec<String>,
    #[serde(default)]
    pub attach_debugger: bool,
}

impl RunRequest {
    pub fn validate(&self) -> Result<()> {
        if self.parallel < 0 {
            return Err(ConfigError::InvalidValue {
                field: "parallel".to_string(),
                message: format!("must not be negative, got {}", self.parallel),
            }
            .into());
        }

        Ok(())
    }

    pub fn entry_point(&self) -> Option<&str> {
        Some(self.program.as_str()).filter(|p| !p.is_empty())
    }

    /// Configuration as a JSON object.
    pub fn config_json(&self) -> Result<String> {
        serde_json::to_string(&self.config).map_err(|e| {
            ConfigError::Serialization {
                what: "configuration".to_string(),
                error: e.to_string(),
            }
            .into()
        })
    }

    /// Secret keys as a JSON array, `[]` when there are none.
    pub fn config_secret_keys_json(&self) -> Result<String> {
        serde_json::to_string(&self.config_secret_keys).map_err(|e| {
            ConfigError::Serialization {
                what: "configuration secret keys".to_string(),
                error: e.to_string(),
            }
            .into()
        })
    }
}

/// Program directories whose build succeeded during this process
#[derive(Debug, Default)]
pub struct BuildCache {
    built: Mutex<HashSet<PathBuf>>,
}

impl BuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, dir: &Path) {
        self.built.lock().insert(dir.to_path_buf());
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.built.lock().contains(dir)
    }
}
