//! Connection establishment.
//!
//! [`dial`] opens a plain TCP connection, [`dial_http`] tunnels through an
//! HTTP CONNECT upgrade, [`dial_unix`] uses a Unix domain socket, and
//! [`dial_service`] picks between them from a `"<protocol>@<address>"`
//! string. All of them send the JSON handshake frame before the client's
//! demultiplexer starts.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use plexrpc_common::{
    ConnectOptions, FrameReader, FrameWriter, Result, RpcError, WireReader, WireWriter,
};

use crate::client::{BoxedRead, BoxedWrite, Client};

/// Path used in the CONNECT request line; the server ignores it but proxies
/// may not.
pub const DEFAULT_RPC_PATH: &str = "/_plexrpc_";

/// Upper bound on the HTTP response head read during the CONNECT upgrade.
const MAX_HTTP_HEAD: usize = 8 * 1024;

/// Dials a TCP endpoint and performs the handshake.
pub async fn dial(addr: &str, options: ConnectOptions) -> Result<Client> {
    let stream = connect_tcp(addr, &options).await?;
    handshake(stream, options).await
}

/// Dials through an HTTP CONNECT upgrade, then performs the handshake on the
/// hijacked stream.
pub async fn dial_http(addr: &str, options: ConnectOptions) -> Result<Client> {
    let mut stream = connect_tcp(addr, &options).await?;
    http_connect(&mut stream).await?;
    handshake(stream, options).await
}

/// Dials a Unix domain socket and performs the handshake.
#[cfg(unix)]
pub async fn dial_unix(path: &str, options: ConnectOptions) -> Result<Client> {
    let connect = tokio::net::UnixStream::connect(path);
    let stream = if options.connect_timeout.is_zero() {
        connect.await?
    } else {
        tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| RpcError::Timeout(options.connect_timeout))??
    };
    handshake(stream, options).await
}

/// Dials a `"<protocol>@<address>"` service address.
///
/// Known protocols: `http` (CONNECT upgrade over TCP), `tcp`, and `unix`.
pub async fn dial_service(rpc_addr: &str, options: ConnectOptions) -> Result<Client> {
    let parts: Vec<&str> = rpc_addr.split('@').collect();
    let &[protocol, addr] = parts.as_slice() else {
        return Err(RpcError::InvalidAddress(rpc_addr.to_string()));
    };
    match protocol {
        "http" => dial_http(addr, options).await,
        "tcp" => dial(addr, options).await,
        #[cfg(unix)]
        "unix" => dial_unix(addr, options).await,
        other => Err(RpcError::Connection(format!(
            "unsupported protocol '{}'",
            other
        ))),
    }
}

async fn connect_tcp(addr: &str, options: &ConnectOptions) -> Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    let stream = if options.connect_timeout.is_zero() {
        connect.await
    } else {
        tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| RpcError::Timeout(options.connect_timeout))?
    }
    .map_err(|e| RpcError::Connection(format!("failed to connect to {}: {}", addr, e)))?;
    Ok(stream)
}

/// Sends the handshake frame and starts the client over the stream.
async fn handshake<S>(stream: S, options: ConnectOptions) -> Result<Client>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FrameWriter::new(Box::new(write_half) as BoxedWrite);

    let handshake = serde_json::to_vec(&options.to_handshake())
        .map_err(|e| RpcError::Handshake(e.to_string()))?;
    frames.write_frame(&handshake).await?;
    frames.flush().await?;
    debug!(codec = %options.codec, "rpc client: handshake sent");

    let reader = WireReader::new(
        FrameReader::new(Box::new(read_half) as BoxedRead),
        options.codec,
    );
    let writer = WireWriter::new(frames, options.codec);
    Ok(Client::start(reader, writer))
}

/// Client half of the CONNECT upgrade: send the request, expect a `200`
/// status line.
async fn http_connect(stream: &mut TcpStream) -> Result<()> {
    stream
        .write_all(format!("CONNECT {} HTTP/1.0\r\n\r\n", DEFAULT_RPC_PATH).as_bytes())
        .await?;

    let head = read_http_head(stream).await?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.contains("200") {
        return Err(RpcError::Connection(format!(
            "unexpected HTTP response: {}",
            status_line
        )));
    }
    Ok(())
}

/// Reads bytes until the `\r\n\r\n` terminating the HTTP response head. The
/// server sends nothing further until it receives our handshake, so byte-wise
/// reads cannot swallow protocol data.
async fn read_http_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(RpcError::Connection("HTTP response head too large".into()));
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
