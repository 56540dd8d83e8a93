// src/transport/mod.rs

//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait. The
//! backend is chosen from the broker URI scheme:
//!
//! | scheme               | backend                                   |
//! |----------------------|-------------------------------------------|
//! | `memory://`          | process-wide [`MemoryBroker`]             |
//! | `amqp://`, `amqps://`| RabbitMQ via lapin (`transport_lapin`)    |
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_lapin")]
mod amqp;

use std::sync::Arc;

pub use memory::{global_broker, MemoryBroker};

use crate::{
    //
    log_info,
    retry::retry_fixed,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
};

/// Connect to the broker named by `config.broker_uri`.
///
/// Unreachable brokers are retried per `config.connect_retry`; a URI with an
/// unknown scheme fails immediately.
///
/// # Errors
///
/// - `RpcError::InvalidConfig` for an unsupported scheme
/// - `RpcError::TransportUnavailable` once every attempt has failed
pub async fn connect(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    let uri = config.broker_uri.as_str();

    if uri.starts_with("memory://") {
        return connect_memory(config, global_broker()).await;
    }

    if uri.starts_with("amqp://") || uri.starts_with("amqps://") {
        #[cfg(feature = "transport_lapin")]
        {
            return retry_fixed(&config.connect_retry, || amqp::create_transport(config)).await;
        }

        #[cfg(not(feature = "transport_lapin"))]
        {
            return Err(RpcError::InvalidConfig(format!(
                "broker uri {uri} needs the transport_lapin feature"
            )));
        }
    }

    Err(RpcError::InvalidConfig(format!(
        "unsupported broker uri scheme: {uri}"
    )))
}

/// Connect to an explicit in-memory broker, with the same retry policy as
/// [`connect`]. Tests use this to get an isolated broker per case.
pub async fn connect_memory(config: &RpcConfig, broker: Arc<MemoryBroker>) -> Result<TransportPtr> {
    // ---
    let transport = retry_fixed(&config.connect_retry, || {
        let broker = broker.clone();
        async move { memory::create_transport(&config.transport_id, broker) }
    })
    .await?;

    log_info!("[{}] memory transport ready", config.transport_id);
    Ok(transport)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{ConnectRetry, ConnectionState};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unknown_scheme_is_invalid_config() {
        // ---
        let config = RpcConfig::with_broker("kafka://localhost:9092", "t");
        let err = connect(&config).await.err().unwrap();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_memory_scheme_uses_global_broker() {
        // ---
        let transport = connect(&RpcConfig::memory("t")).await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_eq!(transport.transport_id(), "t");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_exhausts_retries() {
        // ---
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        let config = RpcConfig::memory("t").with_connect_retry(ConnectRetry {
            max_attempts: 3,
            interval: Duration::from_secs(2),
        });

        let started = tokio::time::Instant::now();
        let err = connect_memory(&config, broker).await.err().unwrap();

        assert!(err.is_unavailable());
        assert!(err.to_string().contains("3 attempts"));
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
