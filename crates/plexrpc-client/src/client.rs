//! Per-connection multiplexing client.
//!
//! One [`Client`] owns one connection. Callers send concurrently; a single
//! background task demultiplexes responses back to their callers by sequence
//! number. Two locks protect the connection, always taken in the order
//! `sending` (the codec writer) then `state` (the pending-call table), which
//! is what makes teardown race-free against in-flight senders.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use plexrpc_common::{CodecKind, Header, Result, RpcError, WireReader, WireWriter};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

type CallResult = std::result::Result<Vec<u8>, RpcError>;

struct ClientState {
    /// Next sequence number; assignment order matches wire order because it
    /// happens under the `sending` lock.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    /// Caller invoked `close`.
    closing: bool,
    /// The reader observed a fatal error and terminated.
    shutdown: bool,
}

struct ClientInner {
    writer: Mutex<WireWriter<BoxedWrite>>,
    state: StdMutex<ClientState>,
    codec: CodecKind,
    /// Cancelled by `close`; the demux reader exits when it fires.
    close_token: CancellationToken,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallResult>> {
        self.state().pending.remove(&seq)
    }

    /// Fails every pending call with the terminal cause and marks the
    /// connection shut down. Takes `sending` then `state` so no sender can
    /// register a call mid-teardown.
    async fn terminate_calls(&self, cause: RpcError) {
        let _writer = self.writer.lock().await;
        let pending = {
            let mut state = self.state();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(calls = pending.len(), "rpc client: terminating pending calls: {}", cause);
        }
        for (_, tx) in pending {
            let err = match &cause {
                RpcError::Shutdown => RpcError::Shutdown,
                other => RpcError::Connection(other.to_string()),
            };
            let _ = tx.send(Err(err));
        }
    }
}

/// One in-flight call, resolving exactly once via [`recv`](Self::recv).
pub struct ReplyHandle<R> {
    seq: u64,
    rx: oneshot::Receiver<CallResult>,
    codec: CodecKind,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> ReplyHandle<R> {
    /// Sequence number assigned to this call (0 if it failed before sending).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Waits for the call to complete and decodes the reply.
    pub async fn recv(self) -> Result<R> {
        match self.rx.await {
            Ok(Ok(body)) => self.codec.decode(&body),
            Ok(Err(e)) => Err(e),
            // The sender half only disappears without a completion if the
            // call was withdrawn (timeout or cancellation already reported).
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

/// Client side of one RPC connection.
///
/// Cloning is shallow; all clones share the connection.
///
/// # Example
///
/// ```no_run
/// use plexrpc_client::dial;
/// use plexrpc_common::ConnectOptions;
///
/// # #[tokio::main]
/// # async fn main() -> plexrpc_common::Result<()> {
/// let client = dial("127.0.0.1:9007", ConnectOptions::default()).await?;
/// let reply: i64 = client.call("Arith.Sum", &serde_json::json!({"num1": 3, "num2": 4})).await?;
/// assert_eq!(reply, 7);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Wraps an established, handshaken connection and starts the
    /// demultiplexing reader.
    pub(crate) fn start(reader: WireReader<BoxedRead>, writer: WireWriter<BoxedWrite>) -> Self {
        let codec = reader.codec();
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(writer),
            state: StdMutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            codec,
            close_token: CancellationToken::new(),
        });
        tokio::spawn(receive_loop(inner.clone(), reader));
        Self { inner }
    }

    pub fn codec(&self) -> CodecKind {
        self.inner.codec
    }

    /// Whether the connection can still carry calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.closing && !state.shutdown
    }

    /// Number of calls sent but not yet completed or withdrawn.
    pub fn pending_calls(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Closes the connection. Idempotent: a second close reports
    /// [`RpcError::Shutdown`]. Pending calls are failed by the reader as it
    /// observes the close.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        self.inner.close_token.cancel();
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("rpc client: close: {}", e);
        }
        Ok(())
    }

    /// Starts a call and returns a handle resolving exactly once. Errors
    /// (including send failures) are delivered through the handle.
    pub async fn dispatch<A, R>(&self, service_method: &str, args: &A) -> ReplyHandle<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();
        let seq = match self.inner.codec.encode(args) {
            Ok(body) => self.send(service_method, body, tx).await,
            Err(e) => {
                let _ = tx.send(Err(e));
                0
            }
        };
        ReplyHandle {
            seq,
            rx,
            codec: self.inner.codec,
            _reply: PhantomData,
        }
    }

    /// Calls a remote method and waits for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.dispatch(service_method, args).await.recv().await
    }

    /// Like [`call`](Self::call) with a deadline. On expiry the pending entry
    /// is removed, so a late response is dropped without being delivered.
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
        let handle = self.dispatch(service_method, args).await;
        let seq = handle.seq();
        match tokio::time::timeout(timeout, handle.recv()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.remove_call(seq);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Like [`call`](Self::call), unwinding early when `token` is cancelled.
    pub async fn call_cancellable<A, R>(
        &self,
        service_method: &str,
        args: &A,
        token: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let handle = self.dispatch(service_method, args).await;
        let seq = handle.seq();
        tokio::select! {
            result = handle.recv() => result,
            _ = token.cancelled() => {
                self.inner.remove_call(seq);
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Like [`call_cancellable`](Self::call_cancellable) with a deadline.
    ///
    /// Deadline, cancellation and completion race in one `select!`; every
    /// exit path withdraws the pending entry before returning. An outer
    /// timeout around [`call_cancellable`](Self::call_cancellable) cannot
    /// guarantee that: it drops the call mid-await with the entry still
    /// registered.
    pub async fn call_cancellable_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let handle = self.dispatch(service_method, args).await;
        let seq = handle.seq();
        tokio::select! {
            result = handle.recv() => result,
            _ = token.cancelled() => {
                self.inner.remove_call(seq);
                Err(RpcError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.inner.remove_call(seq);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Registers the call and writes it to the wire under the `sending` lock.
    /// Returns the assigned sequence number (0 when registration failed).
    async fn send(
        &self,
        service_method: &str,
        body: Vec<u8>,
        tx: oneshot::Sender<CallResult>,
    ) -> u64 {
        let mut writer = self.inner.writer.lock().await;

        let seq = {
            let mut state = self.inner.state();
            if state.closing || state.shutdown {
                drop(state);
                let _ = tx.send(Err(RpcError::Shutdown));
                return 0;
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(seq, tx);
            seq
        };

        let header = Header::request(service_method, seq);
        if let Err(e) = writer.write_raw(&header, &body).await {
            debug!(seq, "rpc client: send error: {}", e);
            if let Some(tx) = self.inner.remove_call(seq) {
                let _ = tx.send(Err(e));
            }
        }
        seq
    }
}

async fn receive_loop(inner: Arc<ClientInner>, mut reader: WireReader<BoxedRead>) {
    let terminal = loop {
        let header = tokio::select! {
            _ = inner.close_token.cancelled() => break RpcError::Shutdown,
            read = reader.read_header() => match read {
                Ok(Some(header)) => header,
                Ok(None) => break RpcError::Connection("connection closed by peer".to_string()),
                Err(e) => break e,
            },
        };
        // The body frame is consumed even when nobody is waiting for it, so
        // an unmatched response cannot desynchronise the stream.
        let body = match reader.read_body().await {
            Ok(body) => body,
            Err(e) => break e,
        };

        match inner.remove_call(header.seq) {
            None => {
                // Cancelled locally while the server was still processing.
                trace!(seq = header.seq, "rpc client: no pending call, dropping response");
            }
            Some(tx) => {
                let outcome = match header.error {
                    Some(message) => Err(RpcError::Remote(message)),
                    None => Ok(body),
                };
                let _ = tx.send(outcome);
            }
        }
    };
    inner.terminate_calls(terminal).await;
}
