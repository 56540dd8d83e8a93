// src/transport/memory/channel.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::broker::{ChannelId, MemoryBroker};
use crate::{
    // ---
    log_debug,
    Address,
    Channel,
    ConsumerTag,
    DeliveryCallback,
    Envelope,
    Result,
};

/// A channel on the in-memory broker.
///
/// Consumer callbacks are stored here, not in the broker, so they only ever
/// run on the thread that pumps this channel.
pub(super) struct MemoryChannel {
    // ---
    id: ChannelId,
    transport_id: Arc<str>,
    broker: Arc<MemoryBroker>,
    consumers: HashMap<ConsumerTag, DeliveryCallback>,
    next_tag: u64,
    released: bool,
}

impl MemoryChannel {
    pub(super) fn open(transport_id: Arc<str>, broker: Arc<MemoryBroker>) -> Result<Self> {
        let id = broker.open_channel()?;
        log_debug!("[{transport_id}] memory channel {id} opened");

        Ok(Self {
            id,
            transport_id,
            broker,
            consumers: HashMap::new(),
            next_tag: 0,
            released: false,
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.consumers.clear();
            self.broker.release_channel(self.id);
            log_debug!("[{}] memory channel {} released", self.transport_id, self.id);
        }
    }
}

impl Channel for MemoryChannel {
    fn declare_queue(&mut self, name: &Address, durable: bool) -> Result<()> {
        self.broker.declare_queue(name, durable)
    }

    fn declare_reply_queue(&mut self) -> Result<Address> {
        self.broker.declare_reply_queue(self.id)
    }

    fn publish(&mut self, env: Envelope) -> Result<()> {
        self.broker.publish(env)
    }

    fn consume(&mut self, queue: &Address, on_delivery: DeliveryCallback) -> Result<ConsumerTag> {
        // ---
        self.next_tag += 1;
        let tag = ConsumerTag(Arc::from(format!(
            "{}-ctag-{}.{}",
            self.transport_id, self.id, self.next_tag
        )));

        self.broker.consume(self.id, queue, tag.clone())?;
        self.consumers.insert(tag.clone(), on_delivery);
        Ok(tag)
    }

    fn cancel(&mut self, tag: &ConsumerTag) -> Result<()> {
        self.consumers.remove(tag);
        self.broker.cancel(self.id, tag)
    }

    fn delete_queue(&mut self, queue: &Address) -> Result<()> {
        self.broker.delete_queue(self.id, queue)
    }

    fn pump(&mut self, slice: Duration) -> Result<()> {
        // ---
        let deadline = Instant::now() + slice;
        let batch = self.broker.take_deliveries(self.id, deadline)?;

        for (tag, env) in batch {
            match self.consumers.get_mut(&tag) {
                Some(on_delivery) => on_delivery(env),
                None => log_debug!(
                    "[{}] delivery for cancelled consumer {tag} dropped",
                    self.transport_id
                ),
            }
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}
