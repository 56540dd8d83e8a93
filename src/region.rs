//! Phone prefix → region lookup over the request/reply client.
//!
//! The resolver service listens on [`REQUEST_QUEUE`], reads
//! `{"phone": …}` and answers `{"region": …}`. It always answers; a region it
//! cannot match comes back as [`NOT_FOUND_REGION`] or without a region at
//! all.
//!
//! [`RegionResolver::resolve_region`] never fails with a protocol or
//! transport error. Every outcome is a [`RegionLookup`], which callers turn
//! into either a region or a [`RegionRejection`] with
//! [`RegionLookup::into_region`].

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    //
    log_debug,
    log_warn,
    rpc_config::DEFAULT_REQUEST_QUEUE,
    AsyncRpcClient,
    Result,
    RpcConfig,
    RpcError,
};

/// Queue the resolver service consumes.
pub const REQUEST_QUEUE: &str = DEFAULT_REQUEST_QUEUE;

/// Region value the resolver sends when it has no match.
pub const NOT_FOUND_REGION: &str = "Região não encontrada";

/// User-facing validation message for a phone whose region is unknown.
pub const REJECTION_MESSAGE: &str = "DDD não encontrado. Verifique o número digitado.";

/// Request body sent to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRequest {
    pub phone: String,
}

/// Reply body from the resolver. `region` may be missing or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionReply {
    #[serde(default)]
    pub region: Option<String>,
}

/// Why a lookup produced no region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The resolver answered without a usable region.
    NoMatch,
    /// No reply within the timeout.
    Timeout,
    /// The reply was not a region reply.
    MalformedReply,
    /// The broker could not be reached.
    TransportUnavailable,
    /// Any other failure on the way.
    Failed,
}

impl NotFoundReason {
    fn from_error(err: &RpcError) -> Self {
        match err {
            RpcError::Timeout { .. } => Self::Timeout,
            RpcError::MalformedReply(_) | RpcError::Serialization(_) => Self::MalformedReply,
            RpcError::TransportUnavailable(_) => Self::TransportUnavailable,
            RpcError::Transport(_) | RpcError::InvalidConfig(_) | RpcError::WorkerLost(_) => {
                Self::Failed
            }
        }
    }

    /// Failures of the lookup infrastructure rather than of the input.
    pub fn is_server_error(self) -> bool {
        matches!(self, Self::TransportUnavailable | Self::Failed)
    }
}

/// Result of one region lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionLookup {
    Found(String),
    NotFound(NotFoundReason),
}

impl RegionLookup {
    /// Interpret a raw reply payload.
    pub fn from_reply(payload: &[u8]) -> Self {
        // ---
        let reply: RegionReply = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(_) => return Self::NotFound(NotFoundReason::MalformedReply),
        };

        match reply.region {
            Some(region) if !region.trim().is_empty() && region != NOT_FOUND_REGION => {
                Self::Found(region)
            }
            _ => Self::NotFound(NotFoundReason::NoMatch),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Found(region) => Some(region),
            Self::NotFound(_) => None,
        }
    }

    /// The region, or the rejection the caller should report.
    pub fn into_region(self) -> std::result::Result<String, RegionRejection> {
        match self {
            Self::Found(region) => Ok(region),
            Self::NotFound(reason) if reason.is_server_error() => {
                Err(RegionRejection::Unavailable(reason))
            }
            Self::NotFound(reason) => Err(RegionRejection::NotFound(reason)),
        }
    }
}

/// Why a mutation depending on a region lookup must be refused.
///
/// `NotFound` is a validation error on the caller's input and displays
/// [`REJECTION_MESSAGE`] whatever its reason, so users see one message for
/// "no such prefix" and "resolver too slow". `Unavailable` is a server-side
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionRejection {
    #[error("{}", REJECTION_MESSAGE)]
    NotFound(NotFoundReason),

    #[error("region lookup unavailable: {0:?}")]
    Unavailable(NotFoundReason),
}

impl RegionRejection {
    pub fn reason(&self) -> NotFoundReason {
        match self {
            Self::NotFound(reason) | Self::Unavailable(reason) => *reason,
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Resolves phone numbers to regions through the resolver service.
///
/// Every lookup is an independent call with its own correlation id and reply
/// queue, so retrying a failed surrounding operation simply looks up again.
#[derive(Clone)]
pub struct RegionResolver {
    client: AsyncRpcClient,
    timeout: Duration,
}

impl RegionResolver {
    pub fn new(client: AsyncRpcClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Connect per `config`, using `config.request_timeout` for lookups.
    pub async fn from_config(config: RpcConfig) -> Result<Self> {
        let timeout = config.request_timeout;
        Ok(Self::new(AsyncRpcClient::connect(config).await?, timeout))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn resolve_region(&self, phone: &str) -> RegionLookup {
        self.resolve_region_with_timeout(phone, self.timeout).await
    }

    pub async fn resolve_region_with_timeout(&self, phone: &str, timeout: Duration) -> RegionLookup {
        // ---
        let id = self.client.client().transport().transport_id();

        let request = RegionRequest {
            phone: phone.to_string(),
        };
        let payload = match serde_json::to_vec(&request) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                log_warn!("[{id}] cannot encode region request: {e}");
                return RegionLookup::NotFound(NotFoundReason::Failed);
            }
        };

        let lookup = match self.client.call_with_timeout(payload, timeout).await {
            Ok(reply) => RegionLookup::from_reply(&reply),
            Err(err) => {
                let reason = NotFoundReason::from_error(&err);
                if reason.is_server_error() {
                    log_warn!("[{id}] region lookup failed: {err}");
                } else {
                    log_debug!("[{id}] region lookup gave no region: {err}");
                }
                RegionLookup::NotFound(reason)
            }
        };

        log_debug!("[{id}] region lookup result: {lookup:?}");
        lookup
    }
}
