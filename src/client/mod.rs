// src/client/mod.rs

//! Blocking request/reply client.
//!
//! One call is one full exchange on a fresh channel:
//!
//! 1. declare the well-known request queue (idempotent)
//! 2. declare a private, exclusive reply queue
//! 3. register a reply consumer feeding the call's single-slot registry
//! 4. publish the request carrying `reply_to` and `correlation_id`
//! 5. pump the channel until the slot fills or the deadline passes
//! 6. cancel the consumer, delete the reply queue, close the channel
//!
//! Step 6 runs on every exit path, panics included.

mod pending;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use pending::Outcome;

use crate::{
    //
    log_debug,
    log_warn,
    Address,
    Channel,
    ConsumerTag,
    CorrelationId,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
    MIN_PUMP_INTERVAL,
};

/// Blocking RPC client over a shared transport.
///
/// Cheap to clone. Calls block the current thread for up to their timeout,
/// so from async code go through [`AsyncRpcClient`](crate::AsyncRpcClient).
///
/// # Example
///
/// ```no_run
/// use region_rpc::{connect, RpcClient, RpcConfig};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// # async fn example() -> region_rpc::Result<()> {
/// let config = RpcConfig::from_env("contacts")?;
/// let transport = connect(&config).await?;
/// let client = RpcClient::new(transport, config);
///
/// let reply = tokio::task::spawn_blocking(move || {
///     client.call_with_timeout(
///         Bytes::from_static(br#"{"phone":"11987654321"}"#),
///         Duration::from_secs(2),
///     )
/// })
/// .await
/// .expect("worker panicked")?;
/// # let _ = reply;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    // ---
    transport: TransportPtr,
    config: Arc<RpcConfig>,
}

impl RpcClient {
    // ---
    pub fn new(transport: TransportPtr, config: RpcConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Send `payload` to the request queue and wait up to
    /// `config.request_timeout` for the reply.
    pub fn call(&self, payload: Bytes) -> Result<Bytes> {
        self.call_with_timeout(payload, self.config.request_timeout)
    }

    /// Send `payload` to the request queue and wait up to `timeout` for the
    /// reply whose correlation id matches this call.
    ///
    /// # Errors
    ///
    /// - `RpcError::Timeout` if no matching reply arrived in time. The wait
    ///   overshoots `timeout` by at most one pump slice.
    /// - `RpcError::TransportUnavailable` if no live connection could be had
    ///   or it dropped mid-call.
    /// - `RpcError::Transport` if the broker refused an operation.
    pub fn call_with_timeout(&self, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let transport_id = self.transport.transport_id().to_string();
        let mut scope = ReplyScope::new(transport_id.clone(), self.transport.open_channel()?);

        let request_queue = Address::from(self.config.request_queue.as_str());
        scope
            .channel()?
            .declare_queue(&request_queue, self.config.request_queue_durable)?;

        let reply_queue = scope.channel()?.declare_reply_queue()?;
        scope.reply_queue = Some(reply_queue.clone());

        let correlation_id = CorrelationId::generate();
        let (mut pending, mut resolver) = pending::register(correlation_id.clone(), timeout);

        let on_reply = {
            let transport_id = transport_id.clone();
            Box::new(move |env: Envelope| {
                let id = env.correlation_id.as_deref().unwrap_or_default();
                if !resolver.resolve(id, env.payload) {
                    log_debug!("[{transport_id}] dropped reply with correlation id {id:?}");
                }
            })
        };
        scope.consumer = Some(scope.channel()?.consume(&reply_queue, on_reply)?);

        scope.channel()?.publish(Envelope::request(
            request_queue,
            payload,
            correlation_id.as_shared(),
            reply_queue.clone(),
        ))?;

        log_debug!(
            "[{transport_id}] request {correlation_id} sent to {}, replies on {reply_queue}",
            self.config.request_queue
        );

        loop {
            let now = Instant::now();
            match pending.poll(now)? {
                Outcome::Filled(reply) => {
                    log_debug!("[{transport_id}] request {correlation_id} answered");
                    return Ok(reply);
                }
                Outcome::TimedOut(elapsed) => {
                    log_debug!("[{transport_id}] request {correlation_id} timed out");
                    return Err(RpcError::Timeout {
                        correlation_id,
                        elapsed,
                    });
                }
                Outcome::Pending => {
                    let slice = self
                        .config
                        .pump_interval
                        .max(MIN_PUMP_INTERVAL)
                        .min(pending.remaining(now));
                    scope.channel()?.pump(slice)?;
                }
            }
        }
    }
}

/// Owns a call's channel and tears down its reply resources on drop.
struct ReplyScope {
    transport_id: String,
    channel: Option<Box<dyn Channel>>,
    consumer: Option<ConsumerTag>,
    reply_queue: Option<Address>,
}

impl ReplyScope {
    fn new(transport_id: String, channel: Box<dyn Channel>) -> Self {
        Self {
            transport_id,
            channel: Some(channel),
            consumer: None,
            reply_queue: None,
        }
    }

    fn channel(&mut self) -> Result<&mut Box<dyn Channel>> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel),
            None => Err(RpcError::Transport("channel already released".into())),
        }
    }
}

impl Drop for ReplyScope {
    fn drop(&mut self) {
        // ---
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        let id = &self.transport_id;

        if let Some(tag) = self.consumer.take() {
            if let Err(e) = channel.cancel(&tag) {
                log_warn!("[{id}] failed to cancel reply consumer {tag}: {e}");
            }
        }

        if let Some(queue) = self.reply_queue.take() {
            if let Err(e) = channel.delete_queue(&queue) {
                log_warn!("[{id}] failed to delete reply queue {queue}: {e}");
            }
        }

        if let Err(e) = channel.close() {
            log_warn!("[{id}] failed to close channel: {e}");
        }
    }
}
