//! Core protocol types: the per-call [`Header`] and the connection-opening
//! [`Handshake`].
//!
//! The handshake is always encoded as JSON, regardless of the codec it
//! negotiates for the rest of the connection. A connection whose handshake
//! does not carry [`MAGIC_NUMBER`] is closed without a response.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::error::{Result, RpcError};

/// Marks the first frame of a connection as a plexrpc handshake.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Identifies one request or response on a connection.
///
/// `seq` is assigned by the client, unique and strictly increasing per
/// connection. A response with `error` present means the remote side failed
/// the call; the body of such a response carries no reply value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Dotted `"<Service>.<Method>"` name.
    pub service_method: String,
    /// Request sequence number, used to match responses to calls.
    pub seq: u64,
    /// Error message, present on failed responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Header {
    /// Creates a request header.
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: None,
        }
    }
}

/// Connection-opening handshake, as encoded on the wire.
///
/// Durations travel as milliseconds; `0` disables the corresponding timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: u32,
    /// Identifier of the body codec for the rest of the connection.
    pub codec: String,
    pub connect_timeout_ms: u64,
    pub handler_timeout_ms: u64,
}

impl Handshake {
    /// Validates the magic number and resolves the codec identifier.
    ///
    /// Both failure modes are handshake errors but carry distinct messages so
    /// the server can log which one occurred.
    pub fn validate(&self) -> Result<CodecKind> {
        if self.magic != MAGIC_NUMBER {
            return Err(RpcError::Handshake(format!(
                "invalid magic number: {:#x}",
                self.magic
            )));
        }
        self.codec.parse()
    }

    /// Handler timeout negotiated for the connection; `None` when disabled.
    pub fn handler_timeout(&self) -> Option<Duration> {
        match self.handler_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Client-side connection options, converted to a [`Handshake`] on dial.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use plexrpc_common::{CodecKind, ConnectOptions};
///
/// let options = ConnectOptions::default().with_handler_timeout(Duration::from_millis(500));
/// assert_eq!(options.codec, CodecKind::Json);
/// assert_eq!(options.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Body codec for the connection.
    pub codec: CodecKind,
    /// Bound on establishing the connection; zero disables it.
    pub connect_timeout: Duration,
    /// Per-request bound enforced by the server; zero disables it.
    pub handler_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::Json,
            connect_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectOptions {
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn to_handshake(&self) -> Handshake {
        Handshake {
            magic: MAGIC_NUMBER,
            codec: self.codec.as_str().to_string(),
            connect_timeout_ms: self.connect_timeout.as_millis() as u64,
            handler_timeout_ms: self.handler_timeout.as_millis() as u64,
        }
    }
}
