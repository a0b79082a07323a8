// Newline-delimited JSON framing for host RPCs and engine calls

use crate::config::RunRequest;
use crate::debug::StartDebuggingRequest;
use crate::discovery::{DependencyInfo, PluginDescriptor};
use crate::error::{ProtocolError, Result};
use crate::logstream::LogEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    GetRequiredPlugins(GetRequiredPluginsRequest),
    Run(RunRequest),
    GetProgramDependencies(GetProgramDependenciesRequest),
    InstallDependencies(InstallDependenciesRequest),
    RunPlugin(RunPluginRequest),
    Pack(PackRequest),
    About,
    GetPluginInfo,
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetRequiredPlugins(_) => "get_required_plugins",
            Request::Run(_) => "run",
            Request::GetProgramDependencies(_) => "get_program_dependencies",
            Request::InstallDependencies(_) => "install_dependencies",
            Request::RunPlugin(_) => "run_plugin",
            Request::Pack(_) => "pack",
            Request::About => "about",
            Request::GetPluginInfo => "get_plugin_info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetRequiredPluginsRequest {
    pub program_directory: PathBuf,
    /// Entry point passed to `dotnet build`, usually a project file
    #[serde(default)]
    pub program: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetProgramDependenciesRequest {
    pub program_directory: PathBuf,
    #[serde(default)]
    pub transitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallDependenciesRequest {
    pub directory: PathBuf,
    #[serde(default)]
    pub is_terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPluginRequest {
    pub program: String,
    pub pwd: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// The complete plugin environment; nothing is inherited from the host.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub attach_debugger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackRequest {
    pub package_directory: PathBuf,
    pub destination_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunResponse {
    pub error: String,
    pub bail: bool,
}

impl RunResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            bail: false,
        }
    }

    pub fn bail() -> Self {
        Self {
            error: String::new(),
            bail: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutResponse {
    pub executable: PathBuf,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Plugins { plugins: Vec<PluginDescriptor> },
    Run(RunResponse),
    Dependencies { dependencies: Vec<DependencyInfo> },
    Stdout { data: String },
    Stderr { data: String },
    Completed,
    Packed { artifact_path: PathBuf },
    About(AboutResponse),
    PluginInfo { version: String },
    Error { message: String, bail: bool },
}

/// Calls the host makes on the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum EngineRequest {
    Log(LogEvent),
    StartDebugging(StartDebuggingRequest),
    Ping,
}

impl EngineRequest {
    pub fn method(&self) -> &'static str {
        match self {
            EngineRequest::Log(_) => "log",
            EngineRequest::StartDebugging(_) => "start_debugging",
            EngineRequest::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineResponse {
    Ok,
    Error { message: String },
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_FRAME_SIZE as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if read > MAX_FRAME_SIZE {
            if !line.ends_with('\n') {
                skip_line(reader).await?;
            }
            return Err(ProtocolError::FrameTooLarge {
                size: read,
                limit: MAX_FRAME_SIZE,
            }
            .into());
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(frame)?));
    }
}

/// Consume input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buffered = reader.fill_buf().await?;
        if buffered.is_empty() {
            return Ok(());
        }
        match buffered.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buffered.len();
                reader.consume(len);
            }
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    if bytes.len() >= MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            limit: MAX_FRAME_SIZE,
        }
        .into());
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_request_wire_shape() {
        let request: Request = serde_json::from_str(
            r#"{"method":"get_program_dependencies","params":{"program_directory":"/work","transitive":true}}"#,
        )
        .unwrap();
        assert_eq!(request.method(), "get_program_dependencies");

        let about: Request = serde_json::from_str(r#"{"method":"about"}"#).unwrap();
        assert_eq!(about, Request::About);
    }

    #[test]
    fn test_unknown_request_fields_rejected() {
        let result = serde_json::from_str::<Request>(
            r#"{"method":"pack","params":{"package_directory":"a","destination_directory":"b","extra":1}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_error_response_wire_shape() {
        let json = serde_json::to_value(Response::Error {
            message: "boom".to_string(),
            bail: false,
        })
        .unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &EngineResponse::Ok).await.unwrap();
        write_frame(
            &mut buffer,
            &EngineResponse::Error {
                message: "no debugger".to_string(),
            },
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(&buffer[..]);
        let first: Option<EngineResponse> = read_frame(&mut reader).await.unwrap();
        let second: Option<EngineResponse> = read_frame(&mut reader).await.unwrap();
        let end: Option<EngineResponse> = read_frame(&mut reader).await.unwrap();

        assert_eq!(first, Some(EngineResponse::Ok));
        assert!(matches!(second, Some(EngineResponse::Error { .. })));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let mut reader = BufReader::new(&b"{not json}\n"[..]);
        let result: Result<Option<EngineResponse>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(crate::error::HostError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped_whole() {
        let mut input = vec![b'x'; MAX_FRAME_SIZE + 100];
        input.extend_from_slice(b"\n{\"status\":\"ok\"}\n");
        let mut reader = BufReader::new(&input[..]);

        let oversized: Result<Option<EngineResponse>> = read_frame(&mut reader).await;
        match oversized {
            Err(crate::error::HostError::Protocol(e)) => {
                assert!(matches!(*e, ProtocolError::FrameTooLarge { .. }))
            }
            other => panic!("expected an oversized frame error, got {other:?}"),
        }

        let next: Option<EngineResponse> = read_frame(&mut reader).await.unwrap();
        assert_eq!(next, Some(EngineResponse::Ok));
    }
}
