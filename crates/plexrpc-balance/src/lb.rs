//! Load-balancing client.
//!
//! [`LbClient`] fronts a pool of per-address [`Client`]s: each call resolves
//! an endpoint through discovery and reuses the cached connection to it,
//! dialing lazily and evicting a connection on its first observed
//! unavailability.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use plexrpc_client::{dial, Client};
use plexrpc_common::{ConnectOptions, Result, RpcError};

use crate::discovery::{Discovery, SelectMode};

/// Client that balances calls over the endpoints a [`Discovery`] knows about.
///
/// # Example
///
/// ```no_run
/// use plexrpc_balance::{LbClient, SelectMode, StaticDiscovery};
/// use plexrpc_common::ConnectOptions;
///
/// # #[tokio::main]
/// # async fn main() -> plexrpc_common::Result<()> {
/// let discovery = StaticDiscovery::new(vec!["127.0.0.1:9007".into(), "127.0.0.1:9008".into()]);
/// let lb = LbClient::new(discovery, SelectMode::RoundRobin, ConnectOptions::default());
///
/// let reply: i64 = lb
///     .call("Arith.Sum", &serde_json::json!({"num1": 1, "num2": 2}))
///     .await?;
/// assert_eq!(reply, 3);
/// # Ok(())
/// # }
/// ```
pub struct LbClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: ConnectOptions,
    clients: Mutex<HashMap<String, Client>>,
}

impl<D: Discovery> LbClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: ConnectOptions) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Returns the cached client for `addr`, if one exists. Does not dial.
    pub async fn cached_client(&self, addr: &str) -> Option<Client> {
        self.clients.lock().await.get(addr).cloned()
    }

    /// Returns the cached client for `addr`, evicting and redialing if the
    /// cached one has become unavailable.
    async fn dial_cached(&self, addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            debug!(%addr, "rpc lb: evicting unavailable client");
            if let Some(stale) = clients.remove(addr) {
                let _ = stale.close().await;
            }
        }

        let client = dial(addr, self.options.clone()).await?;
        clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    /// Calls one endpoint selected by the configured mode.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial_cached(&addr).await?;
        client.call(service_method, args).await
    }

    /// Like [`call`](Self::call) with a per-call deadline.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial_cached(&addr).await?;
        client.call_timeout(service_method, args, timeout).await
    }

    /// Fans the call out to every known endpoint concurrently.
    ///
    /// The reply of the first endpoint to succeed is returned; the first
    /// failure cancels the remaining in-flight sub-calls and becomes the
    /// result. `timeout`, when set, bounds every sub-call.
    pub async fn broadcast<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::NoAvailableServers);
        }

        let token = CancellationToken::new();
        let state: StdMutex<(Option<R>, Option<RpcError>)> = StdMutex::new((None, None));

        let sub_calls = servers.iter().map(|addr| {
            let token = token.clone();
            let state = &state;
            async move {
                let result: Result<R> = async {
                    let client = self.dial_cached(addr).await?;
                    // The deadline runs inside the client's own select so a
                    // timed-out sub-call still withdraws its pending entry.
                    match timeout {
                        None => client.call_cancellable(service_method, args, &token).await,
                        Some(d) => {
                            client
                                .call_cancellable_timeout(service_method, args, &token, d)
                                .await
                        }
                    }
                }
                .await;

                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                match result {
                    Ok(reply) => {
                        if state.0.is_none() {
                            state.0 = Some(reply);
                        }
                    }
                    Err(e) => {
                        if state.1.is_none() {
                            debug!(%addr, "rpc lb: broadcast sub-call failed: {}", e);
                            state.1 = Some(e);
                            token.cancel();
                        }
                    }
                }
            }
        });
        futures::future::join_all(sub_calls).await;

        let (reply, error) = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        match error {
            Some(e) => Err(e),
            None => reply.ok_or_else(|| {
                RpcError::Connection("broadcast completed without a reply".to_string())
            }),
        }
    }

    /// Closes every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (addr, client) in clients.drain() {
            debug!(%addr, "rpc lb: closing cached client");
            let _ = client.close().await;
        }
    }
}
