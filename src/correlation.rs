use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque identifier tying one reply to the call that is waiting for it.
///
/// Generated from 128 random bits, so a collision during the life of a
/// process is not a practical concern. Travels in the AMQP
/// `correlation_id` property and must be echoed verbatim by the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh correlation ID.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cheap shared handle for envelope metadata.
    pub fn as_shared(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }

    /// True when `other` is the same identifier on the wire.
    pub fn matches(&self, other: &str) -> bool {
        *self.0 == *other
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
