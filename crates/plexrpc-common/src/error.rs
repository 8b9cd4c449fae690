use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encoding error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decoding error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("invalid handshake: {0}")]
    Handshake(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// Error string carried back in a response header.
    #[error("{0}")]
    Remote(String),

    #[error("connection is shutdown")]
    Shutdown,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    #[error("rpc server: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc discovery: no available servers")]
    NoAvailableServers,

    #[error("wrong format '{0}', expect protocol@addr")]
    InvalidAddress(String),

    #[error("registry error: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;
