use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, RpcError};

/// Body codec negotiated by the connection handshake.
///
/// The enum is the codec catalog: the handshake names a codec by its
/// identifier string and both peers resolve it here. Additional formats are
/// added as new variants.
///
/// # Example
///
/// ```
/// use plexrpc_common::CodecKind;
///
/// let codec: CodecKind = "application/json".parse().unwrap();
/// let encoded = codec.encode(&42u32).unwrap();
/// let decoded: u32 = codec.decode(&encoded).unwrap();
/// assert_eq!(decoded, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// JSON (the default format)
    Json,
    /// MessagePack
    Msgpack,
}

impl CodecKind {
    /// Identifier used on the wire for this codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::Json => "application/json",
            CodecKind::Msgpack => "application/msgpack",
        }
    }

    /// Encode a value to bytes in this codec's format.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
            CodecKind::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
        }
    }

    /// Decode a value from bytes in this codec's format.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            CodecKind::Json => Ok(serde_json::from_slice(data)?),
            CodecKind::Msgpack => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

impl Default for CodecKind {
    fn default() -> Self {
        CodecKind::Json
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application/json" => Ok(CodecKind::Json),
            "application/msgpack" => Ok(CodecKind::Msgpack),
            other => Err(RpcError::Handshake(format!(
                "unsupported codec type: {}",
                other
            ))),
        }
    }
}
