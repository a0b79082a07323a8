// Toolchain commands run against a scripted stand-in for dotnet
#![cfg(unix)]

mod test_utils;

use langhost::error::{HostError, ToolchainError};
use langhost::{CapturedOutput, CommandContext, Engine, FailureOutput, LogSeverity, Toolchain};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use test_utils::{write_fake_dotnet, write_script, RecordingEngine};
use tokio_util::sync::CancellationToken;

struct Fixture {
    dir: TempDir,
    recorder: Arc<RecordingEngine>,
    engine: Arc<dyn Engine>,
    cancel: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let recorder = Arc::new(RecordingEngine::new());
        let engine: Arc<dyn Engine> = recorder.clone();
        Self {
            dir: TempDir::new().unwrap(),
            recorder,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    fn ctx(&self) -> CommandContext<'_> {
        CommandContext {
            engine: &self.engine,
            working_dir: self.dir.path(),
            cancel: &self.cancel,
        }
    }

    fn toolchain(&self, body: &str) -> Toolchain {
        Toolchain::new(write_script(self.dir.path(), "dotnet", body))
    }

    /// Toolchain whose failure output is kept for inspection.
    fn capturing_toolchain(&self, body: &str) -> (Toolchain, Arc<Mutex<CapturedOutput>>) {
        let captured = Arc::new(Mutex::new(CapturedOutput::default()));
        let toolchain = self
            .toolchain(body)
            .with_failure_output(FailureOutput::Captured(captured.clone()));
        (toolchain, captured)
    }
}

#[tokio::test]
async fn test_quiet_command_sends_no_events() {
    let fixture = Fixture::new();
    let toolchain = fixture.toolchain("echo 8.0.100");

    let version = toolchain.version(fixture.ctx()).await.unwrap();
    assert_eq!(version, "8.0.100");
    assert!(fixture.recorder.events().is_empty());
}

#[tokio::test]
async fn test_streamed_build_reports_progress() {
    let fixture = Fixture::new();
    let toolchain = fixture.toolchain("echo \"Build succeeded.\"; echo \"warning NU1603\" >&2");

    toolchain.build(fixture.ctx(), Some("Website.csproj")).await.unwrap();

    let messages = fixture.recorder.messages();
    assert_eq!(messages.first().unwrap(), "running 'dotnet build -nologo Website.csproj'");
    assert_eq!(
        messages.last().unwrap(),
        "'dotnet build -nologo Website.csproj' completed successfully"
    );
    assert!(messages.contains(&"Build succeeded.\n".to_string()));

    let events = fixture.recorder.events();
    let warning = events
        .iter()
        .find(|e| e.message == "warning NU1603\n")
        .unwrap();
    assert_eq!(warning.severity, LogSeverity::Error);
    assert!(events.iter().all(|e| e.stream_id == events[0].stream_id));
}

#[tokio::test]
async fn test_failed_command_keeps_its_output() {
    let fixture = Fixture::new();
    let toolchain = fixture.toolchain("echo \"restoring\"; echo \"error NU1101\" >&2; exit 1");

    let error = toolchain.list_packages(fixture.ctx(), true).await.unwrap_err();
    match error {
        HostError::Toolchain(inner) => match *inner {
            ToolchainError::NonZeroExit {
                command,
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(command, "dotnet list package --include-transitive");
                assert_eq!(exit_code, 1);
                assert_eq!(stdout, "restoring\n");
                assert_eq!(stderr, "error NU1101\n");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        },
        other => panic!("expected toolchain error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_quiet_failure_surfaces_output_once() {
    let fixture = Fixture::new();
    let (toolchain, captured) = fixture
        .capturing_toolchain("echo \"restoring\"; echo \"error NU1101\" >&2; exit 1");

    assert!(toolchain.list_packages(fixture.ctx(), false).await.is_err());

    let captured = captured.lock().clone();
    assert_eq!(captured.stdout, b"restoring\n");
    assert_eq!(captured.stderr, b"error NU1101\n");
    assert!(fixture.recorder.events().is_empty());
}

#[tokio::test]
async fn test_quiet_success_surfaces_nothing() {
    let fixture = Fixture::new();
    let (toolchain, captured) = fixture.capturing_toolchain("echo 8.0.100; echo note >&2");

    toolchain.version(fixture.ctx()).await.unwrap();
    assert_eq!(*captured.lock(), CapturedOutput::default());
}

#[tokio::test]
async fn test_streamed_failure_surfaces_nothing() {
    let fixture = Fixture::new();
    let (toolchain, captured) =
        fixture.capturing_toolchain("echo \"Build FAILED.\"; echo \"error CS1002\" >&2; exit 1");

    assert!(toolchain.build(fixture.ctx(), None).await.is_err());
    assert_eq!(*captured.lock(), CapturedOutput::default());
    assert!(fixture
        .recorder
        .messages()
        .contains(&"error CS1002\n".to_string()));
}

#[tokio::test]
async fn test_actionable_error_bails() {
    let fixture = Fixture::new();
    let toolchain = fixture.toolchain("echo \"error: something the user must fix\" >&2; exit 32");

    let error = toolchain.build(fixture.ctx(), None).await.unwrap_err();
    assert!(error.is_bail());
}

#[tokio::test]
async fn test_package_discovery_commands() {
    let fixture = Fixture::new();
    let packages_dir = fixture.dir.path().join("packages");
    let toolchain = Toolchain::new(write_fake_dotnet(fixture.dir.path(), &packages_dir));

    let packages = toolchain.referenced_packages(fixture.ctx()).await.unwrap();
    let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["Pulumi.Aws", "Pulumi.Random", "Google.Protobuf"]);

    let dir = toolchain.global_packages_dir(fixture.ctx()).await.unwrap();
    assert_eq!(dir, packages_dir);
}

#[tokio::test]
async fn test_pack_writes_into_destination() {
    let fixture = Fixture::new();
    let destination = fixture.dir.path().join("out");
    std::fs::create_dir_all(&destination).unwrap();
    let toolchain = Toolchain::new(write_fake_dotnet(fixture.dir.path(), &PathBuf::from("/none")));

    toolchain.pack(fixture.ctx(), &destination).await.unwrap();
    assert!(destination.join("Website.1.0.0.nupkg").exists());
}

#[tokio::test]
async fn test_missing_toolchain_fails_to_launch() {
    let fixture = Fixture::new();
    let toolchain = Toolchain::new("/nonexistent/dotnet");

    let error = toolchain.version(fixture.ctx()).await.unwrap_err();
    assert!(error
        .to_string()
        .starts_with("Problem executing 'dotnet --version'"));
}
