//! Plexrpc Server
//!
//! This crate provides the server side of the plexrpc RPC framework:
//!
//! - **[`Service`]**: typed method registration producing a type-erased
//!   dispatch table keyed by method name
//! - **[`Server`]**: connection acceptance, per-connection decode loops,
//!   concurrent request handlers with per-request timeouts, and ordered
//!   response writing
//!
//! A server accepts connections over plain TCP ([`Server::serve`]) or behind
//! an HTTP CONNECT upgrade ([`Server::serve_http`]); both paths converge on
//! the same per-connection routine.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::Deserialize;
//! use plexrpc_server::{Server, Service};
//!
//! #[derive(Deserialize)]
//! struct SumArgs {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> plexrpc_common::Result<()> {
//! let server = Arc::new(Server::new());
//! server.register(
//!     Service::build("Arith")?
//!         .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) }),
//! )?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9007").await?;
//! server.serve(listener).await
//! # }
//! ```

pub mod server;
pub mod service;

pub use server::{Server, ServerConfig, CONNECTED_STATUS, DEFAULT_RPC_PATH};
pub use service::{Method, Service};
