// Severity-tagged log streams for toolchain commands
//
// Every command gets one stream id shared by its stdout (info) and stderr
// (error) writers. Writes are always buffered; when the command's output is
// meant for the user they are also forwarded to the engine as ephemeral log
// events.

use crate::engine::Engine;
use crate::error::Result;
use crate::process::OutputSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

static NEXT_STREAM_ID: AtomicI32 = AtomicI32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Correlates the log events of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(i32);

impl StreamId {
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub severity: LogSeverity,
    pub message: String,
    pub stream_id: StreamId,
    pub ephemeral: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
}

impl LogEvent {
    pub fn ephemeral(severity: LogSeverity, stream_id: StreamId, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            stream_id,
            ephemeral: true,
            urn: None,
        }
    }
}

/// One side of a command's output
pub struct LogWriter {
    severity: LogSeverity,
    stream_id: StreamId,
    engine: Option<Arc<dyn Engine>>,
    buffer: Vec<u8>,
}

impl LogWriter {
    pub fn new(severity: LogSeverity, stream_id: StreamId, engine: Option<Arc<dyn Engine>>) -> Self {
        Self {
            severity,
            stream_id,
            engine,
            buffer: Vec::new(),
        }
    }

    pub fn severity(&self) -> LogSeverity {
        self.severity
    }

    pub fn is_streaming(&self) -> bool {
        self.engine.is_some()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffered_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Send a message straight to the engine, outside the command's output.
    pub async fn log_to_user(&self, message: &str) -> Result<()> {
        if let Some(ref engine) = self.engine {
            engine
                .log(LogEvent::ephemeral(self.severity, self.stream_id, message))
                .await?;
        }
        Ok(())
    }

    /// Write everything buffered so far to `out` and forget it.
    pub async fn flush_to<W>(&mut self, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.buffer.is_empty() {
            return Ok(());
        }
        out.write_all(&self.buffer).await?;
        out.flush().await?;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl OutputSink for LogWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        if let Some(ref engine) = self.engine {
            let message = String::from_utf8_lossy(data).into_owned();
            engine
                .log(LogEvent::ephemeral(self.severity, self.stream_id, message))
                .await?;
        }
        Ok(())
    }

    fn captured(&self) -> Option<&[u8]> {
        Some(&self.buffer)
    }
}

/// The paired stdout/stderr writers of one command
pub struct CommandStreams {
    pub stream_id: StreamId,
    pub info: LogWriter,
    pub error: LogWriter,
}

impl CommandStreams {
    pub fn new(engine: &Arc<dyn Engine>, log_to_user: bool) -> Self {
        let stream_id = StreamId::next();
        let engine = log_to_user.then(|| Arc::clone(engine));
        Self {
            stream_id,
            info: LogWriter::new(LogSeverity::Info, stream_id, engine.clone()),
            error: LogWriter::new(LogSeverity::Error, stream_id, engine),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.info.is_streaming()
    }

    pub async fn log_to_user(&self, message: &str) -> Result<()> {
        self.info.log_to_user(message).await
    }

    /// Surface buffered output of a quiet command that failed.
    pub async fn flush_to<O, E>(&mut self, out: &mut O, err: &mut E) -> std::io::Result<()>
    where
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        self.info.flush_to(out).await?;
        self.error.flush_to(err).await
    }
}
