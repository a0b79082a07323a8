// Shared test utilities: in-memory engines and fake toolchain scripts

use async_trait::async_trait;
use langhost::error::{EngineError, Result};
use langhost::{Engine, LogEvent, StartDebuggingRequest};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// How a [`RecordingEngine`] answers debug requests
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum DebugBehavior {
    Accept,
    Reject(String),
    /// Never answer
    Hang,
}

/// Engine that records every call
#[allow(dead_code)]
pub struct RecordingEngine {
    pub events: Mutex<Vec<LogEvent>>,
    pub debug_requests: Mutex<Vec<StartDebuggingRequest>>,
    pub debug_behavior: DebugBehavior,
    pub fail_logs: bool,
}

#[allow(dead_code)]
impl RecordingEngine {
    pub fn new() -> Self {
        Self::with_debug_behavior(DebugBehavior::Accept)
    }

    pub fn with_debug_behavior(debug_behavior: DebugBehavior) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            debug_requests: Mutex::new(Vec::new()),
            debug_behavior,
            fail_logs: false,
        }
    }

    pub fn failing_logs() -> Self {
        Self {
            fail_logs: true,
            ..Self::new()
        }
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn log(&self, event: LogEvent) -> Result<()> {
        if self.fail_logs {
            return Err(EngineError::CallFailed {
                method: "log".to_string(),
                error: "engine went away".to_string(),
            }
            .into());
        }
        self.events.lock().push(event);
        Ok(())
    }

    async fn start_debugging(&self, request: StartDebuggingRequest) -> Result<()> {
        self.debug_requests.lock().push(request);
        match self.debug_behavior {
            DebugBehavior::Accept => Ok(()),
            DebugBehavior::Reject(ref message) => Err(EngineError::Rejected {
                method: "start_debugging".to_string(),
                message: message.clone(),
            }
            .into()),
            DebugBehavior::Hang => std::future::pending().await,
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Write an executable shell script.
#[allow(dead_code)]
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Sample `dotnet list package --include-transitive` output
#[allow(dead_code)]
pub const LIST_PACKAGE_OUTPUT: &str = "\
Project 'Website' has the following package references
   [net8.0]:
   Top-level Package      Requested   Resolved
   > Pulumi               3.60.0      3.60.0
   > Pulumi.Aws           6.0.0       6.0.2
   > Pulumi.Random        4.13.0      4.13.0

   Transitive Package                 Resolved
   > Google.Protobuf                  3.22.0
   > Pulumi.Aws                       6.1.0
";

/// A fake `dotnet` answering every subcommand the host uses. Package listing
/// and cache lookups point at `packages_dir`.
#[allow(dead_code)]
#[cfg(unix)]
pub fn write_fake_dotnet(dir: &Path, packages_dir: &Path) -> PathBuf {
    let body = format!(
        r#"case "$1" in
  build)
    echo "Build succeeded."
    ;;
  list)
    cat <<'LISTING'
{LIST_PACKAGE_OUTPUT}LISTING
    ;;
  nuget)
    echo "info : global-packages: {packages}"
    ;;
  --version)
    echo "8.0.100"
    ;;
  pack)
    touch "$3/Website.1.0.0.nupkg"
    ;;
  run)
    echo "$*"
    echo "[$HOME][$PLUGIN_MODE]"
    ;;
  *.dll)
    sleep 0.2
    echo "$*"
    ;;
  *)
    echo "unexpected command: $*" >&2
    exit 1
    ;;
esac"#,
        packages = packages_dir.display()
    );
    write_script(dir, "dotnet", &body)
}

/// Create a restored package with optional sidecar files.
#[allow(dead_code)]
pub fn write_package(
    packages_dir: &Path,
    name: &str,
    version: &str,
    metadata: Option<&str>,
    version_txt: Option<&str>,
) {
    let content = packages_dir
        .join(name.to_lowercase())
        .join(version)
        .join("content");
    fs::create_dir_all(&content).unwrap();
    if let Some(metadata) = metadata {
        fs::write(content.join("pulumi-plugin.json"), metadata).unwrap();
    }
    if let Some(version_txt) = version_txt {
        fs::write(content.join("version.txt"), version_txt).unwrap();
    }
}

/// Whether a process with this pid is still running. Zombies waiting to be
/// reaped count as gone.
#[allow(dead_code)]
#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state field follows the parenthesised command name.
        return match stat.rsplit_once(')') {
            Some((_, rest)) => !rest.trim_start().starts_with('Z'),
            None => true,
        };
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Poll until `pid` is gone or `within` elapses. Returns whether it is gone.
#[allow(dead_code)]
#[cfg(unix)]
pub async fn wait_for_exit(pid: i32, within: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    !process_alive(pid)
}

/// Poll until `path` holds a pid written by a test script.
#[allow(dead_code)]
pub async fn read_pid_file(path: &Path) -> i32 {
    for _ in 0..100 {
        if let Ok(text) = fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("no pid written to {}", path.display());
}
