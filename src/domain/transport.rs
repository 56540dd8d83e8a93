// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the RPC client and
//! responder. It names queue-broker concepts (queues, exclusive reply queues,
//! consumers) but no concrete client library.
//!
//! Two levels exist:
//!
//! - [`Transport`]: one shared broker connection, with a small
//!   reconnect-on-failure state machine ([`ConnectionState`]).
//! - [`Channel`]: a lightweight session opened from a transport and owned by
//!   exactly one caller. All queue and message operations happen on a channel.
//!
//! Message delivery is *pumped*: consumer callbacks registered on a channel
//! run only inside [`Channel::pump`], on the thread that calls it. There is
//! no background delivery thread, so a channel's owner fully controls when
//! (and whether) its callbacks observe messages.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Content type attached to every envelope produced by this crate.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A queue name.
///
/// Published envelopes are routed through the broker's default exchange, so
/// an address is simply the name of the destination queue.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one consumer registration on a channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub Arc<str>);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque message plus the metadata the RPC layer needs.
///
/// The transport does not interpret the payload; `correlation_id` and
/// `reply_to` map onto the broker's message properties.
///
/// # Examples
///
/// ```
/// # use region_rpc::{Address, Envelope};
/// # use bytes::Bytes;
/// # use std::sync::Arc;
/// let request = Envelope::request(
///     Address::from("ddd_request"),
///     Bytes::from_static(br#"{"phone":"11987654321"}"#),
///     Arc::from("correlation-123"),
///     Address::from("amq.gen-abc"),
/// );
///
/// let reply = Envelope::response(
///     request.reply_to.clone().unwrap(),
///     Bytes::from(r#"{"region":"São Paulo"}"#),
///     Arc::from("correlation-123"),
/// );
/// assert_eq!(reply.correlation_id, request.correlation_id);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    // ---
    /// Destination queue (routing key on the default exchange).
    pub address: Address,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier used to associate requests with responses.
    pub correlation_id: Option<Arc<str>>,

    /// Queue the responder must publish its reply to.
    ///
    /// Present on requests, absent on replies.
    pub reply_to: Option<Address>,

    /// Optional content type metadata (e.g., "application/json").
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    /// Create a request envelope.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: Arc<str>,
        reply_to: Address,
    ) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
        }
    }

    /// Create a reply envelope echoing the request's correlation id.
    pub fn response(address: Address, payload: Bytes, correlation_id: Arc<str>) -> Self {
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
            content_type: Some(Arc::from(JSON_CONTENT_TYPE)),
        }
    }
}

/// Connection lifecycle of a [`Transport`].
///
/// ```text
/// Disconnected → Connecting → Connected → (Broken → Connecting)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or closed on purpose.
    Disconnected,

    /// A connection attempt is in flight.
    Connecting,

    /// Connected and last known to be alive.
    Connected,

    /// The connection failed; the next `open_channel()` tries to reconnect.
    Broken,
}

/// Consumer callback. Runs inside [`Channel::pump`] only.
pub type DeliveryCallback = Box<dyn FnMut(Envelope) + Send>;

/// A session on a broker connection, owned by a single caller.
///
/// Channels are `Send` so they can be built on one thread and driven on
/// another, but they are never shared.
///
/// Dropping a channel without calling [`close`](Channel::close) must still
/// release its consumers and exclusive queues; `close` exists to surface the
/// errors that a drop would have to swallow.
pub trait Channel: Send {
    // ---
    /// Declare a named queue. Idempotent for identical arguments.
    ///
    /// Redeclaring an existing queue with a different durability fails with
    /// `RpcError::Transport`.
    fn declare_queue(&mut self, name: &Address, durable: bool) -> Result<()>;

    /// Declare an exclusive, auto-delete, broker-named queue owned by this
    /// channel and return its generated name.
    fn declare_reply_queue(&mut self) -> Result<Address>;

    /// Publish to `env.address` on the default exchange.
    ///
    /// Publishing to a queue that does not exist succeeds and the message is
    /// dropped, exactly as an unroutable AMQP publish would be.
    fn publish(&mut self, env: Envelope) -> Result<()>;

    /// Register `on_delivery` for messages arriving on `queue`.
    ///
    /// Fails with `RpcError::Transport` if `queue` is missing or is another
    /// channel's exclusive queue.
    fn consume(&mut self, queue: &Address, on_delivery: DeliveryCallback) -> Result<ConsumerTag>;

    /// Cancel a consumer. Unknown tags are ignored.
    fn cancel(&mut self, tag: &ConsumerTag) -> Result<()>;

    /// Delete a queue. Missing queues are ignored.
    fn delete_queue(&mut self, queue: &Address) -> Result<()>;

    /// Wait up to `slice` for deliveries and run the matching callbacks.
    ///
    /// Returns after delivering at least one message or once `slice` has
    /// elapsed, whichever comes first.
    fn pump(&mut self, slice: Duration) -> Result<()>;

    /// Cancel all consumers, drop exclusive queues and close the channel.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Shared broker connection.
///
/// # Notes
///
/// Everything except [`close`](Transport::close) is blocking. Call those
/// methods from a worker thread (see [`AsyncRpcClient`](crate::AsyncRpcClient)),
/// never directly from an async task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used in logs.
    fn transport_id(&self) -> &str;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Open a fresh channel, reconnecting first if the connection is broken.
    ///
    /// # Errors
    ///
    /// `RpcError::TransportUnavailable` if no live connection can be obtained.
    fn open_channel(&self) -> Result<Box<dyn Channel>>;

    /// Close the connection and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; all clones share one connection.
pub type TransportPtr = Arc<dyn Transport>;
