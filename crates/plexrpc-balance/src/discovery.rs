//! Endpoint discovery and selection.
//!
//! [`StaticDiscovery`] serves a fixed list; [`RegistryDiscovery`] keeps the
//! list fresh from a registry service over HTTP, re-fetching at most once per
//! TTL window.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use plexrpc_common::{Result, RpcError};

use crate::registry::REGISTRY_HEADER;

/// How an endpoint is picked from the current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniformly random over the current list.
    Random,
    /// Cycle through the list; the starting index is randomized per instance
    /// so concurrent clients don't all hammer the same endpoint first.
    RoundRobin,
}

/// Source of server addresses for a load-balancing client.
///
/// Methods return `Send` futures so a generic client remains spawnable.
pub trait Discovery: Send + Sync {
    /// Re-fetches the server list from its upstream source, if any.
    fn refresh(&self) -> impl Future<Output = Result<()>> + Send;

    /// Replaces the server list.
    fn update(&self, servers: Vec<String>) -> impl Future<Output = Result<()>> + Send;

    /// Picks one server according to `mode`.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String>> + Send;

    /// Returns an owned snapshot of all known servers.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

struct ServerList {
    servers: Vec<String>,
    index: usize,
}

/// Discovery over a fixed, manually-updated server list.
///
/// # Example
///
/// ```
/// use plexrpc_balance::{Discovery, SelectMode, StaticDiscovery};
///
/// # #[tokio::main]
/// # async fn main() {
/// let discovery = StaticDiscovery::new(vec!["a:1".into(), "b:1".into()]);
/// let addr = discovery.get(SelectMode::RoundRobin).await.unwrap();
/// assert!(addr == "a:1" || addr == "b:1");
/// # }
/// ```
pub struct StaticDiscovery {
    state: Mutex<ServerList>,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            state: Mutex::new(ServerList {
                servers,
                index: rand::thread_rng().gen_range(0..i32::MAX as usize),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerList> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let picked = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(picked)
            }
        }
    }

    fn replace(&self, servers: Vec<String>) {
        self.state().servers = servers;
    }

    fn snapshot(&self) -> Vec<String> {
        self.state().servers.clone()
    }
}

impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.replace(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.snapshot())
    }
}

/// Default TTL of a fetched server list before it is re-fetched.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(10);

/// Discovery backed by a registry service.
///
/// Server lists are fetched with a `GET` against the registry URL and parsed
/// from its comma-separated `X-Rpc-Servers` response header. A fetched list
/// is reused for `ttl` before `refresh` touches the network again; every
/// `get`/`get_all` refreshes first.
pub struct RegistryDiscovery {
    servers: StaticDiscovery,
    registry_url: String,
    ttl: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    pub fn new(registry_url: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            servers: StaticDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            ttl: ttl.unwrap_or(DEFAULT_REFRESH_TTL),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn last_update(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self) -> bool {
        matches!(*self.last_update(), Some(at) if at.elapsed() < self.ttl)
    }
}

impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }

        debug!(registry = %self.registry_url, "rpc discovery: refreshing server list");
        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| RpcError::Registry(e.to_string()))?;
        let servers: Vec<String> = response
            .headers()
            .get(REGISTRY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        self.servers.replace(servers);
        *self.last_update() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.replace(servers);
        *self.last_update() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.snapshot())
    }
}
