// TCP front end: accepts connections, dispatches request frames to the host
// and streams responses back.

use crate::engine::Engine;
use crate::error::{HostError, ProtocolError, Result};
use crate::host::LanguageHost;
use crate::logging::utils::request_span;
use crate::process::OutputSink;
use crate::protocol::{read_frame, write_frame, Request, Response};
use async_trait::async_trait;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Which stream a [`FrameSink`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Output sink that turns each write into a response frame
pub struct FrameSink {
    kind: StreamKind,
    tx: mpsc::UnboundedSender<Response>,
}

impl FrameSink {
    pub fn new(kind: StreamKind, tx: mpsc::UnboundedSender<Response>) -> Self {
        Self { kind, tx }
    }
}

#[async_trait]
impl OutputSink for FrameSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let data = String::from_utf8_lossy(data).into_owned();
        let frame = match self.kind {
            StreamKind::Stdout => Response::Stdout { data },
            StreamKind::Stderr => Response::Stderr { data },
        };
        self.tx
            .send(frame)
            .map_err(|_| HostError::from(ProtocolError::ConnectionClosed))
    }
}

pub struct Server {
    host: Arc<LanguageHost>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(host: Arc<LanguageHost>, address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { host, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. In-flight requests are
    /// cancelled with it.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(address = %self.local_addr()?, "Language host listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down language host");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "Accepted connection");
                    let host = Arc::clone(&self.host);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(host, stream, cancel).await {
                            warn!(%peer, error = %e, "Connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    host: Arc<LanguageHost>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame::<_, Request>(&mut reader) => frame,
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(HostError::Protocol(e)) => {
                warn!(error = %e, "Rejecting malformed request");
                write_frame(&mut writer, &error_response(&HostError::Protocol(e))).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let span = request_span(request.method());
        let request_cancel = cancel.child_token();
        let hang_up = watch_for_hang_up(&mut reader, &request_cancel);
        tokio::select! {
            biased;
            dispatched = dispatch(&host, request, &mut writer, &request_cancel).instrument(span) => dispatched?,
            never = hang_up => match never {},
        }
    }
}

/// Cancel `request_cancel` once the peer closes its side of the connection.
/// Bytes of a pipelined next request are left unread.
async fn watch_for_hang_up<R>(reader: &mut R, request_cancel: &CancellationToken) -> Infallible
where
    R: AsyncBufRead + Unpin,
{
    match reader.fill_buf().await {
        Ok(buffered) if buffered.is_empty() => {
            debug!("Peer hung up, cancelling request");
            request_cancel.cancel();
        }
        Err(e) => {
            debug!(error = %e, "Connection failed, cancelling request");
            request_cancel.cancel();
        }
        Ok(_) => {}
    }
    std::future::pending().await
}

/// Run one request, forwarding streamed frames as they are produced and
/// finishing with a single terminal frame.
async fn dispatch<W>(
    host: &LanguageHost,
    request: Request,
    writer: &mut W,
    request_cancel: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = async {
        let terminal = match respond(host, request, tx.clone(), request_cancel).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        };
        // The receiver only goes away once the peer is gone.
        let _ = tx.send(terminal);
        drop(tx);
    };

    let forward = async {
        while let Some(response) = rx.recv().await {
            if let Err(e) = write_frame(&mut *writer, &response).await {
                request_cancel.cancel();
                return Err(e);
            }
        }
        Ok(())
    };

    let ((), forwarded) = tokio::join!(handler, forward);
    forwarded
}

async fn respond(
    host: &LanguageHost,
    request: Request,
    tx: mpsc::UnboundedSender<Response>,
    cancel: &CancellationToken,
) -> Result<Response> {
    let response = match request {
        Request::GetRequiredPlugins(request) => Response::Plugins {
            plugins: host.get_required_plugins(&request, cancel).await?,
        },
        Request::Run(request) => Response::Run(host.run(&request, cancel).await?),
        Request::GetProgramDependencies(request) => Response::Dependencies {
            dependencies: host.get_program_dependencies(&request, cancel).await?,
        },
        Request::InstallDependencies(request) => {
            let mut stdout = FrameSink::new(StreamKind::Stdout, tx.clone());
            let mut stderr = FrameSink::new(StreamKind::Stderr, tx);
            host.install_dependencies(&request, &mut stdout, &mut stderr, cancel)
                .await?;
            Response::Completed
        }
        Request::RunPlugin(request) => {
            let mut stdout = FrameSink::new(StreamKind::Stdout, tx.clone());
            let mut stderr = FrameSink::new(StreamKind::Stderr, tx);
            host.run_plugin(&request, &mut stdout, &mut stderr, cancel)
                .await?;
            Response::Completed
        }
        Request::Pack(request) => Response::Packed {
            artifact_path: host.pack(&request, cancel).await?,
        },
        Request::About => Response::About(host.about(cancel).await?),
        Request::GetPluginInfo => Response::PluginInfo {
            version: host.plugin_info(),
        },
    };
    Ok(response)
}

fn error_response(error: &HostError) -> Response {
    if error.is_bail() {
        debug!(error = %error, "Request bailed");
        return Response::Error {
            message: String::new(),
            bail: true,
        };
    }

    error!(error_type = error.kind(), error = %error, "Request failed");
    Response::Error {
        message: error.to_string(),
        bail: false,
    }
}

/// Ping the engine every `interval`; fire `shutdown` when it stops answering.
pub async fn health_check(engine: Arc<dyn Engine>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = engine.ping().await {
                    error!(error = %e, "Engine health check failed, shutting down");
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}
