//! Connection acceptance and request dispatch.
//!
//! The server accepts connections in a loop and handles each one on its own
//! task: decode the JSON handshake, construct the negotiated codec, then read
//! header/body pairs until the stream ends. Every request runs on its own
//! task; responses are serialized through a per-connection write lock, so
//! they are emitted atomically in completion order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use plexrpc_common::{
    CodecKind, FrameReader, FrameWriter, Handshake, Header, Result, RpcError, WireReader,
    WireWriter,
};

use crate::service::{Method, Service};

/// Path the HTTP CONNECT upgrade is addressed to.
pub const DEFAULT_RPC_PATH: &str = "/_plexrpc_";

/// Status line sent back on a successful CONNECT upgrade.
pub const CONNECTED_STATUS: &str = "HTTP/1.0 200 Connected to plexrpc";

/// Upper bound on the HTTP request head read during a CONNECT upgrade.
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of requests executing concurrently on one connection.
    /// Further requests queue in arrival order until a slot frees up.
    pub max_inflight_per_conn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_conn: 1024,
        }
    }
}

/// RPC server: a registry of services plus the connection-handling loops.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use plexrpc_server::{Server, Service};
///
/// # #[tokio::main]
/// # async fn main() -> plexrpc_common::Result<()> {
/// let server = Arc::new(Server::new());
/// server.register(
///     Service::build("Echo")?.method("Echo", |s: String| async move { Ok(s) }),
/// )?;
///
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
/// server.serve(listener).await
/// # }
/// ```
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
    config: ServerConfig,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Registers a service. Fails if one with the same name already exists;
    /// registered entries are immutable afterwards.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        info!(service = service.name(), methods = ?service.method_names(), "rpc server: registered service");
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Accepts connections forever. Accept errors are logged and do not kill
    /// the listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "rpc server: connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                    });
                }
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                }
            }
        }
    }

    /// Like [`serve`](Self::serve), but each connection first performs an
    /// HTTP CONNECT upgrade before the normal handshake.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    debug!(%peer, "rpc server: http connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        match upgrade_http(&mut stream).await {
                            Ok(()) => server.serve_conn(stream).await,
                            Err(e) => debug!(%peer, "rpc server: http upgrade failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                }
            }
        }
    }

    /// Runs the per-connection protocol on an established stream.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FrameReader::new(read_half);

        // Handshake: first frame, always JSON.
        let handshake: Handshake = match frames.read_frame().await {
            Ok(Some(frame)) => match serde_json::from_slice(&frame) {
                Ok(handshake) => handshake,
                Err(e) => {
                    warn!("rpc server: handshake decode error: {}", e);
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!("rpc server: handshake read error: {}", e);
                return;
            }
        };
        let codec = match handshake.validate() {
            Ok(codec) => codec,
            Err(e) => {
                warn!("rpc server: rejecting connection: {}", e);
                return;
            }
        };

        let reader = WireReader::new(frames, codec);
        let writer = Arc::new(Mutex::new(WireWriter::new(FrameWriter::new(write_half), codec)));
        self.serve_codec(reader, writer, handshake.handler_timeout())
            .await;
    }

    async fn serve_codec<R, W>(
        &self,
        mut reader: WireReader<R>,
        writer: Arc<Mutex<WireWriter<W>>>,
        handler_timeout: Option<Duration>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = reader.codec();
        let tracker = TaskTracker::new();
        let inflight = Arc::new(Semaphore::new(self.config.max_inflight_per_conn));

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => {
                    debug!("rpc server: read header: {}", e);
                    break;
                }
            };
            // The body frame is consumed unconditionally so a failed dispatch
            // cannot leave the stream out of frame.
            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(e) => {
                    debug!("rpc server: read body: {}", e);
                    break;
                }
            };

            let method = match self.find_method(&header.service_method) {
                Ok(method) => method,
                Err(message) => {
                    send_response(&writer, header, Err(message)).await;
                    continue;
                }
            };

            let Ok(permit) = inflight.clone().acquire_owned().await else {
                break;
            };
            tracker.spawn(handle_request(
                method,
                codec,
                header,
                body,
                writer.clone(),
                handler_timeout,
                permit,
            ));
        }

        // Requests still executing get to finish and write their responses
        // before the connection is dropped.
        tracker.close();
        tracker.wait().await;
    }

    fn find_method(&self, service_method: &str) -> std::result::Result<Arc<Method>, String> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(format!(
                "rpc server: invalid service method '{}'",
                service_method
            ));
        };
        let service = {
            let services = self
                .services
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            services.get(service_name).cloned()
        };
        let Some(service) = service else {
            return Err(format!("rpc server: can't find service {}", service_name));
        };
        service
            .lookup(method_name)
            .ok_or_else(|| format!("rpc server: can't find method {}", method_name))
    }
}

/// Runs one request: the user invocation on a nested task, raced against the
/// handler timeout. The response for a sequence number is written exactly
/// once; a handler that outlives its timeout keeps running but its result is
/// discarded.
async fn handle_request<W>(
    method: Arc<Method>,
    codec: CodecKind,
    header: Header,
    body: Vec<u8>,
    writer: Arc<Mutex<WireWriter<W>>>,
    handler_timeout: Option<Duration>,
    _permit: OwnedSemaphorePermit,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let invocation = tokio::spawn(method.invoke(codec, body));

    let outcome = match handler_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
            Ok(joined) => flatten(joined),
            Err(_) => Err(format!(
                "rpc server: handler timeout: expect within {:?}",
                timeout
            )),
        },
        None => flatten(invocation.await),
    };

    send_response(&writer, header, outcome).await;
}

fn flatten(
    joined: std::result::Result<Result<Vec<u8>>, tokio::task::JoinError>,
) -> std::result::Result<Vec<u8>, String> {
    match joined {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("rpc server: handler panicked: {}", e)),
    }
}

async fn send_response<W>(
    writer: &Arc<Mutex<WireWriter<W>>>,
    header: Header,
    outcome: std::result::Result<Vec<u8>, String>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    let (header, body) = match outcome {
        Ok(reply) => (
            Header {
                error: None,
                ..header
            },
            reply,
        ),
        Err(message) => (
            Header {
                error: Some(message),
                ..header
            },
            // Error responses still carry a body frame to keep the peer in
            // frame; its content is ignored.
            writer.codec().encode(&()).unwrap_or_default(),
        ),
    };
    if let Err(e) = writer.write_raw(&header, &body).await {
        debug!(seq = header.seq, "rpc server: write response error: {}", e);
        // A failed write leaves the stream in an unknown framing state.
        let _ = writer.shutdown().await;
    }
}

/// Performs the server half of the HTTP CONNECT upgrade: consume the request
/// head, answer `200` for CONNECT and `405` for anything else.
async fn upgrade_http(stream: &mut TcpStream) -> Result<()> {
    let head = read_http_head(stream).await?;
    let request_line = head.lines().next().unwrap_or("");
    let method = request_line.split_whitespace().next().unwrap_or("");

    if method != "CONNECT" {
        stream
            .write_all(b"HTTP/1.0 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(RpcError::Connection(format!(
            "unexpected HTTP method '{}'",
            method
        )));
    }
    stream
        .write_all(format!("{}\r\n\r\n", CONNECTED_STATUS).as_bytes())
        .await?;
    Ok(())
}

/// Reads bytes until the `\r\n\r\n` terminating an HTTP request head. The
/// client does not send anything further until it has seen our response, so
/// byte-wise reads cannot swallow protocol data.
async fn read_http_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(RpcError::Connection("HTTP request head too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(RpcError::Connection(
                "connection closed during HTTP upgrade".into(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
