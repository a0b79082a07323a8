// Control channel back to the orchestrating engine

use crate::debug::StartDebuggingRequest;
use crate::error::{EngineError, HostError, Result};
use crate::logstream::{LogEvent, LogSeverity};
use crate::protocol::{read_frame, write_frame, EngineRequest, EngineResponse};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Calls the host makes on the engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Deliver one log event to the user.
    async fn log(&self, event: LogEvent) -> Result<()>;

    /// Ask the engine to attach a debugger. Resolves once the engine has
    /// acknowledged the session.
    async fn start_debugging(&self, request: StartDebuggingRequest) -> Result<()>;

    /// Liveness check behind the health check.
    async fn ping(&self) -> Result<()>;
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// TCP client speaking newline-delimited JSON to the engine.
///
/// Calls are serialized over one connection, which is (re)established lazily
/// and dropped after any I/O failure.
pub struct EngineClient {
    address: String,
    connection: Mutex<Option<Connection>>,
}

impl EngineClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: Mutex::new(None),
        }
    }

    /// Create a client and verify the engine is reachable.
    pub async fn connect(address: impl Into<String>) -> Result<Self> {
        let client = Self::new(address);
        let connection = client.open().await?;
        *client.connection.lock().await = Some(connection);
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<Connection> {
        debug!(address = %self.address, "Connecting to engine");
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| EngineError::ConnectFailed {
                address: self.address.clone(),
                error: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn call(&self, request: EngineRequest) -> Result<()> {
        let method = request.method();
        let mut guard = self.connection.lock().await;

        // Held outside the slot until a full reply is read, so a call dropped
        // mid-exchange leaves no half-read connection behind.
        let mut connection = match guard.take() {
            Some(connection) => connection,
            None => self.open().await?,
        };

        let exchanged = async {
            write_frame(&mut connection.writer, &request).await?;
            read_frame::<_, EngineResponse>(&mut connection.reader).await
        }
        .await;

        match exchanged {
            Ok(Some(EngineResponse::Ok)) => {
                *guard = Some(connection);
                Ok(())
            }
            Ok(Some(EngineResponse::Error { message })) => {
                *guard = Some(connection);
                Err(EngineError::Rejected {
                    method: method.to_string(),
                    message,
                }
                .into())
            }
            Ok(None) => Err(EngineError::CallFailed {
                method: method.to_string(),
                error: "connection closed by engine".to_string(),
            }
            .into()),
            Err(e) => {
                warn!(address = %self.address, method, error = %e, "Dropping engine connection");
                Err(EngineError::CallFailed {
                    method: method.to_string(),
                    error: e.to_string(),
                }
                .into())
            }
        }
    }
}

#[async_trait]
impl Engine for EngineClient {
    async fn log(&self, event: LogEvent) -> Result<()> {
        self.call(EngineRequest::Log(event)).await
    }

    async fn start_debugging(&self, request: StartDebuggingRequest) -> Result<()> {
        self.call(EngineRequest::StartDebugging(request)).await
    }

    async fn ping(&self) -> Result<()> {
        self.call(EngineRequest::Ping).await
    }
}

/// Stand-in used when the host was started without an engine address.
/// Log events go to the host's own diagnostics and debugging is refused.
#[derive(Debug, Default)]
pub struct DetachedEngine;

#[async_trait]
impl Engine for DetachedEngine {
    async fn log(&self, event: LogEvent) -> Result<()> {
        let message = event.message.trim_end();
        match event.severity {
            LogSeverity::Debug => debug!(stream_id = %event.stream_id, "{message}"),
            LogSeverity::Info => info!(stream_id = %event.stream_id, "{message}"),
            LogSeverity::Warning => warn!(stream_id = %event.stream_id, "{message}"),
            LogSeverity::Error => error!(stream_id = %event.stream_id, "{message}"),
        }
        Ok(())
    }

    async fn start_debugging(&self, _request: StartDebuggingRequest) -> Result<()> {
        Err(HostError::from(EngineError::NotConfigured))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
