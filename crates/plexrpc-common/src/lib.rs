//! Plexrpc Common Types and Transport
//!
//! This crate provides the wire protocol and transport infrastructure shared
//! by the plexrpc client, server and load-balancing crates:
//!
//! - **Protocol Layer**: request/response [`Header`], the connection-opening
//!   [`Handshake`], and the [`RpcError`] type used throughout the system
//! - **Transport Layer**: length-prefixed framing over any async byte stream,
//!   with pluggable body codecs
//!
//! # Wire format
//!
//! A connection carries one JSON handshake frame followed by interleaved
//! header/body frame pairs:
//!
//! ```text
//! | Handshake(JSON) | Header1 | Body1 | Header2 | Body2 | ...
//! ```
//!
//! Every frame is `[4-byte length as u32 big-endian] + [payload]`. The
//! handshake is always JSON; header and body payloads use the codec the
//! handshake negotiated.
//!
//! # Example
//!
//! ```
//! use plexrpc_common::{CodecKind, Header};
//!
//! let codec = CodecKind::Json;
//! let header = Header::request("Arith.Sum", 1);
//!
//! let encoded = codec.encode(&header).unwrap();
//! let decoded: Header = codec.decode(&encoded).unwrap();
//! assert_eq!(header, decoded);
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

pub use codec::CodecKind;
pub use error::{Result, RpcError};
pub use protocol::{ConnectOptions, Handshake, Header, MAGIC_NUMBER};
pub use transport::{FrameReader, FrameWriter, WireReader, WireWriter};
