//! Plexrpc Client
//!
//! This crate provides the client side of the plexrpc RPC framework: a
//! per-connection multiplexer that carries many interleaved calls over one
//! stream.
//!
//! # Architecture
//!
//! - **Send path**: callers from any task serialize on the connection's
//!   `sending` lock; each call gets a fresh sequence number and an entry in
//!   the pending-call table before its frames hit the wire.
//! - **Receive path**: a single background reader matches incoming response
//!   headers to pending calls by sequence number and completes each call
//!   exactly once.
//! - **Teardown**: closing the client (or a fatal read/write error) fails
//!   every pending call with the same terminal error; new calls are refused
//!   with a shutdown error.
//!
//! # Example
//!
//! ```no_run
//! use serde::Serialize;
//! use plexrpc_client::dial_service;
//! use plexrpc_common::ConnectOptions;
//!
//! #[derive(Serialize)]
//! struct SumArgs {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> plexrpc_common::Result<()> {
//! let client = dial_service("tcp@127.0.0.1:9007", ConnectOptions::default()).await?;
//! let reply: i64 = client.call("Arith.Sum", &SumArgs { num1: 3, num2: 4 }).await?;
//! assert_eq!(reply, 7);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dial;

pub use client::{Client, ReplyHandle};
pub use dial::{dial, dial_http, dial_service, DEFAULT_RPC_PATH};

#[cfg(unix)]
pub use dial::dial_unix;
