//! Plexrpc Load Balancing and Discovery
//!
//! This crate layers endpoint management on top of the plexrpc client:
//!
//! - **[`Discovery`]**: turns a selection mode into a concrete address, from
//!   a fixed list ([`StaticDiscovery`]) or a registry-fed one
//!   ([`RegistryDiscovery`])
//! - **[`LbClient`]**: caches one client connection per address and routes
//!   [`call`](LbClient::call)s through discovery; [`broadcast`](LbClient::broadcast)
//!   fans a call out to every known endpoint with first-success reply capture
//!   and first-failure cancellation
//! - **[`Registry`]**: the HTTP registry service servers heartbeat into and
//!   discovery reads from
//!
//! # Example
//!
//! ```no_run
//! use plexrpc_balance::{LbClient, RegistryDiscovery, SelectMode};
//! use plexrpc_common::ConnectOptions;
//!
//! # #[tokio::main]
//! # async fn main() -> plexrpc_common::Result<()> {
//! let discovery = RegistryDiscovery::new("http://127.0.0.1:9999/rpc/registry", None);
//! let lb = LbClient::new(discovery, SelectMode::Random, ConnectOptions::default());
//!
//! let reply: i64 = lb
//!     .call("Arith.Sum", &serde_json::json!({"num1": 3, "num2": 4}))
//!     .await?;
//! assert_eq!(reply, 7);
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod lb;
pub mod registry;

pub use discovery::{
    Discovery, RegistryDiscovery, SelectMode, StaticDiscovery, DEFAULT_REFRESH_TTL,
};
pub use lb::LbClient;
pub use registry::{
    start_heartbeat, Registry, DEFAULT_REGISTRY_PATH, DEFAULT_REGISTRY_TTL, REGISTRY_HEADER,
};
