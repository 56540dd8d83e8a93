// src/transport/memory/broker.rs

//! In-process message broker.
//!
//! Models the subset of AMQP 0-9-1 behavior the RPC layer relies on:
//!
//! - queues addressed through the default exchange (routing key = queue name),
//! - idempotent declaration, with inequivalent durability rejected,
//! - exclusive, auto-delete, broker-named reply queues owned by one channel,
//! - unroutable publishes dropped silently,
//! - each message delivered to exactly one consumer.
//!
//! Deliveries are handed out only when a channel pumps, which lets tests
//! reproduce the single-threaded, pumped delivery model of a blocking AMQP
//! client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use uuid::Uuid;

use crate::{log_debug, Address, ConsumerTag, Envelope, Result, RpcError};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// A panic inside a consumer callback never runs while the broker lock is
/// held, and every broker mutation leaves the maps consistent, so a poisoned
/// guard still protects valid state.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(super) type ChannelId = u64;

struct MemoryQueue {
    // ---
    durable: bool,
    auto_delete: bool,
    exclusive_to: Option<ChannelId>,
    messages: VecDeque<Envelope>,
    consumers: Vec<(ChannelId, ConsumerTag)>,
}

impl MemoryQueue {
    fn new(durable: bool, auto_delete: bool, exclusive_to: Option<ChannelId>) -> Self {
        Self {
            durable,
            auto_delete,
            exclusive_to,
            messages: VecDeque::new(),
            consumers: Vec::new(),
        }
    }
}

struct BrokerState {
    // ---
    reachable: bool,
    next_channel: ChannelId,
    open_channels: usize,
    queues: HashMap<Arc<str>, MemoryQueue>,
}

/// Shared in-process broker.
///
/// All transports connected to the same `MemoryBroker` see the same queues,
/// exactly as processes connected to one RabbitMQ node would. Construct one
/// per test for isolation; [`global_broker`] backs `memory://` URIs.
///
/// The inspection methods (`queue_exists`, `consumer_count`, ...) exist so
/// tests can verify resource cleanup from the outside.
pub struct MemoryBroker {
    // ---
    state: Mutex<BrokerState>,
    activity: Condvar,
}

impl MemoryBroker {
    /// Create a new, empty, reachable broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the broker going away (`false`) or coming back (`true`).
    ///
    /// While unreachable every operation fails with
    /// `RpcError::TransportUnavailable` and pumping channels wake up.
    pub fn set_reachable(&self, reachable: bool) {
        lock_ignore_poison(&self.state).reachable = reachable;
        self.activity.notify_all();
    }

    pub fn is_reachable(&self) -> bool {
        lock_ignore_poison(&self.state).reachable
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(name)
    }

    /// Number of messages waiting in `name` (0 if missing).
    pub fn queue_depth(&self, name: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of consumers registered on `name` (0 if missing).
    pub fn consumer_count(&self, name: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.len())
    }

    /// Number of live exclusive (reply) queues.
    pub fn exclusive_queue_count(&self) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .values()
            .filter(|q| q.exclusive_to.is_some())
            .count()
    }

    /// Number of channels opened and not yet released.
    pub fn open_channels(&self) -> usize {
        lock_ignore_poison(&self.state).open_channels
    }

    // ---
    // Operations used by the memory transport and channel.
    // ---

    fn live(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = lock_ignore_poison(&self.state);
        if state.reachable {
            Ok(state)
        } else {
            Err(RpcError::TransportUnavailable("memory broker unreachable".into()))
        }
    }

    /// Liveness check used while connecting.
    pub(super) fn ping(&self) -> Result<()> {
        self.live().map(|_| ())
    }

    pub(super) fn open_channel(&self) -> Result<ChannelId> {
        let mut state = self.live()?;
        state.next_channel += 1;
        state.open_channels += 1;
        Ok(state.next_channel)
    }

    /// Drop every trace of `channel`: its consumers, its exclusive queues, and
    /// auto-delete queues it was the last consumer of.
    pub(super) fn release_channel(&self, channel: ChannelId) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.open_channels = state.open_channels.saturating_sub(1);

        state.queues.retain(|name, queue| {
            let had_consumers = !queue.consumers.is_empty();
            queue.consumers.retain(|(owner, _)| *owner != channel);

            let keep = queue.exclusive_to != Some(channel)
                && !(queue.auto_delete && had_consumers && queue.consumers.is_empty());
            if !keep {
                log_debug!("memory broker: released queue {name} with channel {channel}");
            }
            keep
        });

        drop(state);
        self.activity.notify_all();
    }

    pub(super) fn declare_queue(&self, name: &Address, durable: bool) -> Result<()> {
        // ---
        let mut state = self.live()?;

        if let Some(queue) = state.queues.get(name.as_str()) {
            if queue.durable != durable {
                return Err(RpcError::Transport(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"
                )));
            }
            return Ok(());
        }

        state
            .queues
            .insert(name.0.clone(), MemoryQueue::new(durable, false, None));
        Ok(())
    }

    pub(super) fn declare_reply_queue(&self, channel: ChannelId) -> Result<Address> {
        // ---
        let mut state = self.live()?;
        let name: Arc<str> = Arc::from(format!("amq.gen-{}", Uuid::new_v4().simple()));
        state
            .queues
            .insert(name.clone(), MemoryQueue::new(false, true, Some(channel)));
        Ok(Address(name))
    }

    pub(super) fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let mut state = self.live()?;

        let routed = match state.queues.get_mut(env.address.as_str()) {
            Some(queue) => {
                queue.messages.push_back(env);
                true
            }
            None => {
                log_debug!("memory broker: dropped unroutable message for {}", env.address);
                false
            }
        };

        drop(state);
        if routed {
            self.activity.notify_all();
        }
        Ok(())
    }

    pub(super) fn consume(
        &self,
        channel: ChannelId,
        queue: &Address,
        tag: ConsumerTag,
    ) -> Result<()> {
        // ---
        let mut state = self.live()?;

        let entry = state.queues.get_mut(queue.as_str()).ok_or_else(|| {
            RpcError::Transport(format!("NOT_FOUND - no queue '{queue}'"))
        })?;

        if let Some(owner) = entry.exclusive_to {
            if owner != channel {
                return Err(RpcError::Transport(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
                )));
            }
        }

        entry.consumers.push((channel, tag));
        drop(state);
        self.activity.notify_all();
        Ok(())
    }

    pub(super) fn cancel(&self, channel: ChannelId, tag: &ConsumerTag) -> Result<()> {
        // ---
        let mut state = self.live()?;

        state.queues.retain(|_, queue| {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|(owner, t)| !(*owner == channel && t == tag));
            let cancelled = queue.consumers.len() != before;
            !(cancelled && queue.auto_delete && queue.consumers.is_empty())
        });
        Ok(())
    }

    pub(super) fn delete_queue(&self, channel: ChannelId, queue: &Address) -> Result<()> {
        // ---
        let mut state = self.live()?;

        if let Some(existing) = state.queues.get(queue.as_str()) {
            if matches!(existing.exclusive_to, Some(owner) if owner != channel) {
                return Err(RpcError::Transport(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{queue}'"
                )));
            }
            state.queues.remove(queue.as_str());
        }
        Ok(())
    }

    /// Block until a message is available for one of `channel`'s consumers or
    /// `deadline` passes, then take every ready message for that channel.
    pub(super) fn take_deliveries(
        &self,
        channel: ChannelId,
        deadline: Instant,
    ) -> Result<Vec<(ConsumerTag, Envelope)>> {
        // ---
        let mut state = self.live()?;

        loop {
            let mut batch = Vec::new();
            for queue in state.queues.values_mut() {
                let tag = queue
                    .consumers
                    .iter()
                    .find(|(owner, _)| *owner == channel)
                    .map(|(_, tag)| tag.clone());

                if let Some(tag) = tag {
                    batch.extend(queue.messages.drain(..).map(|env| (tag.clone(), env)));
                }
            }

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            state = match self.activity.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };

            if !state.reachable {
                return Err(RpcError::TransportUnavailable(
                    "memory broker unreachable".into(),
                ));
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                reachable: true,
                next_channel: 0,
                open_channels: 0,
                queues: HashMap::new(),
            }),
            activity: Condvar::new(),
        }
    }
}

/// Process-global broker used by `memory://` URIs.
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

pub fn global_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn tag(s: &str) -> ConsumerTag {
        ConsumerTag(Arc::from(s))
    }

    fn envelope(queue: &str, body: &'static str) -> Envelope {
        Envelope::response(Address::from(queue), Bytes::from(body), Arc::from("c-1"))
    }

    #[test]
    fn test_declare_is_idempotent_but_checks_durability() {
        // ---
        let broker = MemoryBroker::new();
        let q = Address::from("ddd_request");

        broker.declare_queue(&q, true).unwrap();
        broker.declare_queue(&q, true).unwrap();
        assert!(broker.queue_exists("ddd_request"));

        let err = broker.declare_queue(&q, false).unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[test]
    fn test_unroutable_publish_is_dropped() {
        // ---
        let broker = MemoryBroker::new();
        broker.publish(envelope("nowhere", "x")).unwrap();
        assert!(!broker.queue_exists("nowhere"));
    }

    #[test]
    fn test_exclusive_queue_is_locked_to_owner() {
        // ---
        let broker = MemoryBroker::new();
        let owner = broker.open_channel().unwrap();
        let other = broker.open_channel().unwrap();

        let reply = broker.declare_reply_queue(owner).unwrap();
        assert!(reply.as_str().starts_with("amq.gen-"));

        let err = broker.consume(other, &reply, tag("t-other")).unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        let err = broker.delete_queue(other, &reply).unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));

        // publishing into someone else's reply queue is allowed
        broker
            .publish(envelope(reply.as_str(), "reply"))
            .unwrap();
        assert_eq!(broker.queue_depth(reply.as_str()), 1);

        broker.consume(owner, &reply, tag("t-owner")).unwrap();
        assert_eq!(broker.consumer_count(reply.as_str()), 1);
    }

    #[test]
    fn test_release_channel_drops_exclusive_queues() {
        // ---
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().unwrap();
        let reply = broker.declare_reply_queue(channel).unwrap();
        assert_eq!(broker.exclusive_queue_count(), 1);
        assert_eq!(broker.open_channels(), 1);

        broker.release_channel(channel);

        assert!(!broker.queue_exists(reply.as_str()));
        assert_eq!(broker.exclusive_queue_count(), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    #[test]
    fn test_cancel_last_consumer_auto_deletes_reply_queue() {
        // ---
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().unwrap();
        let reply = broker.declare_reply_queue(channel).unwrap();

        broker.consume(channel, &reply, tag("t")).unwrap();
        broker.cancel(channel, &tag("t")).unwrap();

        assert!(!broker.queue_exists(reply.as_str()));
    }

    #[test]
    fn test_take_deliveries_times_out_empty() {
        // ---
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().unwrap();

        let started = Instant::now();
        let batch = broker
            .take_deliveries(channel, Instant::now() + Duration::from_millis(50))
            .unwrap();

        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_each_message_goes_to_one_consumer() {
        // ---
        let broker = MemoryBroker::new();
        let q = Address::from("work");
        broker.declare_queue(&q, true).unwrap();

        let a = broker.open_channel().unwrap();
        let b = broker.open_channel().unwrap();
        broker.consume(a, &q, tag("a")).unwrap();
        broker.consume(b, &q, tag("b")).unwrap();

        broker.publish(envelope("work", "1")).unwrap();
        broker.publish(envelope("work", "2")).unwrap();

        let soon = Instant::now() + Duration::from_millis(10);
        let first = broker.take_deliveries(a, soon).unwrap();
        let second = broker.take_deliveries(b, soon).unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
    }

    #[test]
    fn test_unreachable_broker_fails_operations() {
        // ---
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        assert!(broker.ping().unwrap_err().is_unavailable());
        assert!(broker.open_channel().unwrap_err().is_unavailable());

        broker.set_reachable(true);
        assert!(broker.ping().is_ok());
    }
}
