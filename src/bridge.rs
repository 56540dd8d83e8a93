//! Async front end for the blocking [`RpcClient`].
//!
//! Each call runs on tokio's blocking pool, gated by a semaphore so at most
//! `max_workers` calls pump the broker at once. The awaiting task is
//! suspended, never blocked, so a current-thread runtime keeps serving its
//! other tasks while lookups are in flight.
//!
//! The semaphore permit is moved into the worker. If the awaiting future is
//! dropped, the worker still runs to its own timeout, tears down its reply
//! queue, and only then frees the slot.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::{
    //
    connect,
    log_error,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
};

/// Bounded, cancellation-safe async wrapper around [`RpcClient`].
///
/// # Example
///
/// ```no_run
/// use region_rpc::{AsyncRpcClient, RpcConfig};
/// use bytes::Bytes;
///
/// # async fn example() -> region_rpc::Result<()> {
/// let client = AsyncRpcClient::connect(RpcConfig::from_env("contacts")?).await?;
/// let reply = client.call(Bytes::from_static(br#"{"phone":"11987654321"}"#)).await?;
/// # let _ = reply;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AsyncRpcClient {
    // ---
    client: RpcClient,
    workers: Arc<Semaphore>,
    max_workers: usize,
}

impl AsyncRpcClient {
    // ---

    /// Wrap `client`, allowing at most `max_workers` (at least one) calls in
    /// flight.
    pub fn new(client: RpcClient, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            client,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Connect per `config` and size the pool from `config.max_workers`.
    ///
    /// # Errors
    ///
    /// Whatever [`connect`] returns once its retry budget is spent.
    pub async fn connect(config: RpcConfig) -> Result<Self> {
        // ---
        let transport = connect(&config).await?;
        let max_workers = config.max_workers;
        Ok(Self::new(RpcClient::new(transport, config), max_workers))
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker slots not currently held by a call.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// [`RpcClient::call`] without blocking the async scheduler.
    pub async fn call(&self, payload: Bytes) -> Result<Bytes> {
        let timeout = self.client.config().request_timeout;
        self.call_with_timeout(payload, timeout).await
    }

    /// [`RpcClient::call_with_timeout`] without blocking the async scheduler.
    ///
    /// Waits for a free worker slot first; the time spent waiting does not
    /// count against `timeout`.
    ///
    /// # Errors
    ///
    /// Everything [`RpcClient::call_with_timeout`] returns, plus
    /// `RpcError::WorkerLost` if the worker panicked.
    pub async fn call_with_timeout(&self, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RpcError::WorkerLost("worker pool closed".into()))?;

        let client = self.client.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            client.call_with_timeout(payload, timeout)
        });

        match worker.await {
            Ok(result) => result,
            Err(e) => {
                log_error!(
                    "[{}] rpc worker lost: {e}",
                    self.client.transport().transport_id()
                );
                Err(RpcError::WorkerLost(e.to_string()))
            }
        }
    }
}
