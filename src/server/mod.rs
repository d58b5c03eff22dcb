//! HTTP endpoint - POST generate streams NDJSON frames, GET health reports the pack
//!
//! One tokio task per connection. Every connection carries exactly one
//! request and is closed after the response.

pub mod http;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Encoder;

use crate::error::{DraftwrightError, Result};
use crate::orchestrator::GenerationService;
use crate::protocol::{NdJsonCodec, StreamFrame};
use http::{ChunkedWriter, HttpError, RequestHead};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub generate_path: String,
    pub health_path: String,
    pub max_body_bytes: usize,
    /// How long a client may take to send the request line and headers
    pub head_timeout: Duration,
    /// How long in-flight streams may run after shutdown is requested
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            generate_path: "/api/generate".to_string(),
            health_path: "/health".to_string(),
            max_body_bytes: 1024 * 1024,
            head_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Bound listener plus the shared service.
pub struct HttpServer {
    listener: TcpListener,
    service: Arc<GenerationService>,
    config: Arc<ServerConfig>,
}

impl HttpServer {
    pub async fn bind(config: ServerConfig, service: Arc<GenerationService>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|e| DraftwrightError::Http(format!("Failed to bind {}: {}", config.bind, e)))?;
        Ok(Self {
            listener,
            service,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then give open streams the grace
    /// period before aborting them.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, path = %self.config.generate_path, "HTTP server listening");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(open = connections.len(), "Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&self.service);
                            let config = Arc::clone(&self.config);
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, service, config).await {
                                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!("Grace period elapsed, aborting open streams");
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<GenerationService>,
    config: Arc<ServerConfig>,
) -> std::result::Result<(), HttpError> {
    let mut reader = BufReader::new(stream);

    let head = tokio::time::timeout(config.head_timeout, http::read_head(&mut reader))
        .await
        .unwrap_or(Err(HttpError::Timeout));
    let outcome = match head {
        Ok(Some(head)) => route(&mut reader, &head, &config).await,
        Ok(None) => return Ok(()),
        Err(e) => Err(e),
    };

    match outcome {
        Ok(Route::Health) => {
            let body = serde_json::to_vec(&service.health()).map_err(|e| HttpError::BadRequest(e.to_string()))?;
            http::write_response(reader.get_mut(), (200, "OK"), "application/json", &[], &body).await?;
        }
        Ok(Route::Generate(body)) => {
            stream_frames(reader.into_inner(), &service, body).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::debug!(error = %e, "Rejecting request");
            http::write_error(reader.get_mut(), &e).await?;
        }
    }
    reader.get_mut().shutdown().await?;
    Ok(())
}

enum Route {
    Health,
    Generate(Vec<u8>),
}

async fn route(
    reader: &mut BufReader<TcpStream>,
    head: &RequestHead,
    config: &ServerConfig,
) -> std::result::Result<Route, HttpError> {
    if head.path == config.health_path {
        return match head.method.as_str() {
            "GET" => Ok(Route::Health),
            _ => Err(HttpError::MethodNotAllowed { allow: "GET" }),
        };
    }
    if head.path == config.generate_path {
        if head.method != "POST" {
            return Err(HttpError::MethodNotAllowed { allow: "POST" });
        }
        http::body_length(head, config.max_body_bytes)?;
        if head.expect_continue {
            http::write_continue(reader.get_mut()).await?;
        }
        let body = http::read_body(reader, head, config.max_body_bytes).await?;
        return Ok(Route::Generate(body));
    }
    Err(HttpError::NotFound)
}

/// Pump frames from a spawned run into chunked NDJSON. A failed write drops
/// the receiver, which the run observes as a disconnect.
async fn stream_frames(stream: TcpStream, service: &Arc<GenerationService>, body: Vec<u8>) -> std::io::Result<()> {
    let mut frames = service.spawn(body);
    let mut writer = ChunkedWriter::start(stream, NDJSON_CONTENT_TYPE).await?;
    let mut codec = NdJsonCodec::<StreamFrame>::new();
    let mut buf = BytesMut::new();

    while let Some(frame) = frames.recv().await {
        codec.encode(frame, &mut buf)?;
        let chunk = buf.split();
        if let Err(e) = writer.write_chunk(&chunk).await {
            tracing::info!(error = %e, "Client went away mid-stream");
            return Err(e);
        }
    }

    let mut stream = writer.finish().await?;
    stream.shutdown().await
}
