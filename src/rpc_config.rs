//! Public RPC configuration.
//!
//! Holds everything the transport, client and bridge need: where the broker
//! is, which queue the resolver listens on, how long a call may wait and how
//! the initial connection is retried. Transport layers interpret the URI.

use std::time::Duration;

use crate::{RpcError, Result};

/// Queue the remote resolver consumes requests from.
pub const DEFAULT_REQUEST_QUEUE: &str = "ddd_request";

/// Broker URI used outside containers.
pub const LOCAL_BROKER_URI: &str = "amqp://localhost:5672/%2f";

/// Broker URI used when `DOCKER_ENV` is set (compose service name).
pub const DOCKER_BROKER_URI: &str = "amqp://rabbitmq:5672/%2f";

/// Shortest pump slice a wait loop uses; a zero slice would spin.
pub const MIN_PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-interval retry policy for establishing the broker connection.
///
/// Unlike per-call retries there is no backoff: the broker is expected to come
/// up within a known window after the service starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRetry {
    /// Total number of connection attempts (at least one is always made).
    pub max_attempts: u32,

    /// Pause between two consecutive attempts.
    pub interval: Duration,
}

impl Default for ConnectRetry {
    /// 30 attempts, 2 seconds apart.
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

/// Transport configuration and call parameters.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker URI: `amqp://…`, `amqps://…` or `memory://`.
    pub broker_uri: String,

    /// Identifier for this transport instance, used in logs and consumer tags.
    pub transport_id: String,

    /// Well-known destination the resolver consumes from.
    pub request_queue: String,

    /// Declare the request queue durable. Must agree with the resolver's own
    /// declaration or the broker rejects the redeclaration.
    pub request_queue_durable: bool,

    /// Default bound on a single call.
    ///
    /// Default: 10 seconds
    pub request_timeout: Duration,

    /// Longest single slice the wait loop hands to `Channel::pump`.
    /// Never below [`MIN_PUMP_INTERVAL`].
    ///
    /// Default: 1 second
    pub pump_interval: Duration,

    /// Initial connection policy.
    pub connect_retry: ConnectRetry,

    /// Upper bound on blocking calls running at once behind the async bridge.
    ///
    /// Default: 4
    pub max_workers: usize,
}

impl RpcConfig {
    /// Create a config for a broker at `broker_uri`.
    pub fn with_broker(broker_uri: impl Into<String>, transport_id: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            transport_id: transport_id.into(),
            request_queue: DEFAULT_REQUEST_QUEUE.to_string(),
            request_queue_durable: true,
            request_timeout: Duration::from_secs(10),
            pump_interval: Duration::from_secs(1),
            connect_retry: ConnectRetry::default(),
            max_workers: 4,
        }
    }

    /// Create a config for the in-process memory broker.
    pub fn memory(transport_id: impl Into<String>) -> Self {
        Self::with_broker("memory://", transport_id)
    }

    /// Build a config from the process environment.
    ///
    /// - `BROKER_URI` wins when set.
    /// - Otherwise `DOCKER_ENV` selects the compose host, else localhost.
    /// - `RPC_REQUEST_TIMEOUT_MS` and `RPC_MAX_WORKERS` override defaults.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidConfig` if an override does not parse.
    pub fn from_env(transport_id: impl Into<String>) -> Result<Self> {
        Self::from_vars(transport_id, |key| std::env::var(key).ok())
    }

    fn from_vars<F>(transport_id: impl Into<String>, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ---
        let uri = match var("BROKER_URI") {
            Some(uri) if !uri.is_empty() => uri,
            _ if var("DOCKER_ENV").is_some() => DOCKER_BROKER_URI.to_string(),
            _ => LOCAL_BROKER_URI.to_string(),
        };

        let mut config = Self::with_broker(uri, transport_id);

        if let Some(ms) = var("RPC_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| RpcError::InvalidConfig(format!("RPC_REQUEST_TIMEOUT_MS={ms}: {e}")))?;
            config.request_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = var("RPC_MAX_WORKERS") {
            let n: usize = n
                .trim()
                .parse()
                .map_err(|e| RpcError::InvalidConfig(format!("RPC_MAX_WORKERS={n}: {e}")))?;
            if n == 0 {
                return Err(RpcError::InvalidConfig("RPC_MAX_WORKERS must be > 0".into()));
            }
            config.max_workers = n;
        }

        Ok(config)
    }

    /// Set the well-known request queue name.
    pub fn with_request_queue(mut self, name: impl Into<String>) -> Self {
        self.request_queue = name.into();
        self
    }

    /// Declare the request queue durable (`true`) or transient.
    pub fn with_request_queue_durable(mut self, durable: bool) -> Self {
        self.request_queue_durable = durable;
        self
    }

    /// Set the default per-call timeout.
    ///
    /// # Example
    ///
    /// ```
    /// use region_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::with_broker("amqp://localhost:5672/%2f", "contacts")
    ///     .with_request_timeout(Duration::from_secs(3));
    /// assert_eq!(config.request_timeout, Duration::from_secs(3));
    /// ```
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the wait-loop pump granularity (clamped to at least
    /// [`MIN_PUMP_INTERVAL`]).
    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = interval.max(MIN_PUMP_INTERVAL);
        self
    }

    /// Set the connection retry policy.
    pub fn with_connect_retry(mut self, retry: ConnectRetry) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Set the worker bound for the async bridge (clamped to at least 1).
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }
}
