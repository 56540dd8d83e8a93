//! Blocking, correlated, timeout-bounded request/reply over a message broker.
//!
//! A caller publishes a request to a well-known queue and waits for the
//! reply on a private, per-call reply queue. Replies are matched by
//! correlation id and the wait is bounded by a timeout. The crate's own use
//! is phone-prefix region lookup ([`RegionResolver`]), but [`RpcClient`]
//! carries arbitrary payloads.
//!
//! Layers, bottom up:
//!
//! - [`Transport`] / [`Channel`]: broker connection and per-call channel.
//!   `memory://` runs an in-process broker; `amqp://` talks to RabbitMQ.
//! - [`RpcClient`]: one blocking request/reply exchange per call.
//! - [`AsyncRpcClient`]: runs those calls on a bounded worker pool so async
//!   callers stay responsive.
//! - [`RegionResolver`]: the region lookup wire contract on top.
//!
//! # Example
//!
//! ```no_run
//! use region_rpc::{RegionResolver, RpcConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = RegionResolver::from_config(RpcConfig::from_env("contacts")?).await?;
//!
//! match resolver.resolve_region("11987654321").await.into_region() {
//!     Ok(region) => println!("region: {region}"),
//!     Err(rejection) => println!("rejected: {rejection}"),
//! }
//! # Ok(())
//! # }
//! ```

mod macros;

mod bridge;
mod client;
mod correlation;
mod domain;
mod error;
mod region;
mod retry;
mod rpc_config;
mod server;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use bridge::AsyncRpcClient;
pub use client::RpcClient;
pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use server::RpcServer;

pub use rpc_config::{
    //
    ConnectRetry,
    RpcConfig,
    DEFAULT_REQUEST_QUEUE,
    DOCKER_BROKER_URI,
    LOCAL_BROKER_URI,
    MIN_PUMP_INTERVAL,
};

pub use domain::{
    //
    Address,
    Channel,
    ConnectionState,
    ConsumerTag,
    DeliveryCallback,
    Envelope,
    Transport,
    TransportPtr,
    JSON_CONTENT_TYPE,
};

pub use transport::{connect, connect_memory, global_broker, MemoryBroker};

pub use region::{
    //
    NotFoundReason,
    RegionLookup,
    RegionRejection,
    RegionReply,
    RegionRequest,
    RegionResolver,
    NOT_FOUND_REGION,
    REJECTION_MESSAGE,
    REQUEST_QUEUE,
};
