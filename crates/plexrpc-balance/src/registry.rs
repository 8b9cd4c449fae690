//! Registry service and server-side heartbeat.
//!
//! The registry is a small HTTP service mapping server addresses to the time
//! they last reported in. Servers [`start_heartbeat`] against it; clients
//! read the alive set through
//! [`RegistryDiscovery`](crate::discovery::RegistryDiscovery).
//!
//! # HTTP surface
//!
//! - `GET /rpc/registry` responds with header `X-Rpc-Servers: addr1,addr2,...`
//!   listing endpoints whose last heartbeat is within the TTL
//! - `POST /rpc/registry` with header `X-Rpc-Servers: <addr>` inserts or
//!   refreshes that entry; a missing header is a 500
//! - any other method gets a 405

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use plexrpc_common::{Result, RpcError};

/// Header carrying server addresses in both directions.
pub const REGISTRY_HEADER: &str = "X-Rpc-Servers";

/// Path the registry routes are mounted at.
pub const DEFAULT_REGISTRY_PATH: &str = "/rpc/registry";

/// How long a registered server stays alive without a heartbeat.
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(5 * 60);

/// In-memory registry of `{address → last heartbeat}`.
pub struct Registry {
    ttl: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_TTL)
    }
}

impl Registry {
    /// A TTL of zero means entries never expire.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or refreshes an entry.
    pub fn register_server(&self, addr: &str) {
        self.servers().insert(addr.to_string(), Instant::now());
    }

    /// Returns the sorted alive set, dropping expired entries as a side
    /// effect.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers();
        if !self.ttl.is_zero() {
            let ttl = self.ttl;
            servers.retain(|_, last_seen| last_seen.elapsed() < ttl);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Builds the axum router exposing the registry at
    /// [`DEFAULT_REGISTRY_PATH`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                DEFAULT_REGISTRY_PATH,
                get(list_servers).post(register_server),
            )
            .with_state(self)
    }

    /// Serves the registry on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr(), "rpc registry: listening");
        axum::serve(listener, self.router())
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    ([(REGISTRY_HEADER, registry.alive_servers().join(","))], "")
}

async fn register_server(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    let addr = headers
        .get(REGISTRY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match addr {
        Some(addr) => {
            registry.register_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Announces `addr` to the registry now and then periodically from a
/// background task.
///
/// The first heartbeat is sent before returning so a just-started server is
/// immediately discoverable; its failure is the caller's to handle. The
/// background task stops on the first failed beat. The period defaults to
/// the registry TTL minus one minute.
pub async fn start_heartbeat(
    registry_url: &str,
    addr: &str,
    period: Option<Duration>,
) -> Result<tokio::task::JoinHandle<()>> {
    let period = period.unwrap_or(DEFAULT_REGISTRY_TTL - Duration::from_secs(60));
    let http = reqwest::Client::new();

    send_heartbeat(&http, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // the immediate tick; the initial beat went out already
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&http, &registry_url, &addr).await {
                warn!(%addr, "rpc registry: heartbeat error: {}", e);
                break;
            }
        }
    }))
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    http.post(registry_url)
        .header(REGISTRY_HEADER, addr)
        .send()
        .await
        .map_err(|e| RpcError::Registry(e.to_string()))?;
    Ok(())
}
