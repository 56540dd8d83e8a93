//! Per-call correlation registry.
//!
//! Every call owns a private reply queue, so its registry never holds more
//! than one entry: a single-slot cell written at most once. The writing half
//! ([`ReplyResolver`]) lives in the reply consumer callback; the reading half
//! ([`PendingCall`]) stays with the caller's wait loop.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::{CorrelationId, Result, RpcError};

/// Longest wait a deadline can express; larger timeouts are capped here.
const MAX_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Register a call awaiting the reply for `correlation_id`, expiring after
/// `timeout`.
pub(crate) fn register(
    correlation_id: CorrelationId,
    timeout: Duration,
) -> (PendingCall, ReplyResolver) {
    // ---
    let (tx, rx) = oneshot::channel();
    let created_at = Instant::now();

    let pending = PendingCall {
        correlation_id: correlation_id.clone(),
        created_at,
        deadline: deadline_after(created_at, timeout),
        slot: rx,
    };

    let resolver = ReplyResolver {
        expected: correlation_id,
        slot: Some(tx),
    };

    (pending, resolver)
}

fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start.checked_add(timeout.min(MAX_WAIT)).unwrap_or(start)
}

/// State of a [`PendingCall`] at a point in time.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Pending,
    Filled(Bytes),
    TimedOut(Duration),
}

/// The waiting side of one in-flight call.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub(crate) correlation_id: CorrelationId,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Instant,
    slot: oneshot::Receiver<Bytes>,
}

impl PendingCall {
    /// Check the slot. A filled slot wins over an expired deadline.
    ///
    /// # Errors
    ///
    /// `RpcError::Transport` if the resolver was dropped unfilled, meaning the
    /// reply consumer is gone and no reply can arrive anymore.
    pub(crate) fn poll(&mut self, now: Instant) -> Result<Outcome> {
        // ---
        match self.slot.try_recv() {
            Ok(payload) => Ok(Outcome::Filled(payload)),
            Err(TryRecvError::Empty) if now >= self.deadline => {
                Ok(Outcome::TimedOut(now.saturating_duration_since(self.created_at)))
            }
            Err(TryRecvError::Empty) => Ok(Outcome::Pending),
            Err(TryRecvError::Closed) => Err(RpcError::Transport(format!(
                "reply consumer for {} went away",
                self.correlation_id
            ))),
        }
    }

    /// Time left before the deadline; zero once it has passed.
    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// The delivering side of one in-flight call.
pub(crate) struct ReplyResolver {
    expected: CorrelationId,
    slot: Option<oneshot::Sender<Bytes>>,
}

impl ReplyResolver {
    /// Fill the slot if `correlation_id` is the expected one and the slot is
    /// still empty.
    ///
    /// Returns true exactly once. Mismatched ids, duplicates and replies
    /// arriving after the caller gave up all return false.
    pub(crate) fn resolve(&mut self, correlation_id: &str, payload: Bytes) -> bool {
        // ---
        if !self.expected.matches(correlation_id) {
            return false;
        }

        match self.slot.take() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}
