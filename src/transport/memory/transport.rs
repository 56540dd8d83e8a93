// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics: pumped delivery, exclusive reply queues, unroutable drops and
//! the connection state machine. The AMQP transport approximates it and
//! documents where the broker differs.

use std::sync::{Arc, Mutex, MutexGuard};

use super::broker::MemoryBroker;
use super::channel::MemoryChannel;
use crate::{
    // ---
    log_info,
    log_warn,
    Channel,
    ConnectionState,
    Result,
    RpcError,
    Transport,
    TransportPtr,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory transport.
///
/// One "connection" to a [`MemoryBroker`]. Reachability of the broker drives
/// the state machine, so tests can break and heal the connection.
struct MemoryTransport {
    // ---
    transport_id: Arc<str>,
    broker: Arc<MemoryBroker>,
    state: Mutex<ConnectionState>,
}

impl MemoryTransport {
    /// Move to `Connected` if the broker answers, `Broken` otherwise.
    fn reconnect(&self, state: &mut ConnectionState) -> Result<()> {
        // ---
        *state = ConnectionState::Connecting;

        match self.broker.ping() {
            Ok(()) => {
                log_info!("[{}] reconnected to memory broker", self.transport_id);
                *state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                *state = ConnectionState::Broken;
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn state(&self) -> ConnectionState {
        let mut state = lock_ignore_poison(&self.state);
        if *state == ConnectionState::Connected && !self.broker.is_reachable() {
            *state = ConnectionState::Broken;
        }
        *state
    }

    fn open_channel(&self) -> Result<Box<dyn Channel>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        match *state {
            ConnectionState::Disconnected => {
                return Err(RpcError::TransportUnavailable(format!(
                    "[{}] transport closed",
                    self.transport_id
                )));
            }
            ConnectionState::Connected if self.broker.is_reachable() => {}
            _ => {
                log_warn!("[{}] connection broken, reconnecting", self.transport_id);
                self.reconnect(&mut *state)?;
            }
        }
        drop(state);

        match MemoryChannel::open(self.transport_id.clone(), self.broker.clone()) {
            Ok(channel) => Ok(Box::new(channel)),
            Err(err) => {
                if err.is_unavailable() {
                    *lock_ignore_poison(&self.state) = ConnectionState::Broken;
                }
                Err(err)
            }
        }
    }

    /// Mark the transport closed. Channels already handed out keep working
    /// until they are closed or dropped.
    async fn close(&self) -> Result<()> {
        *lock_ignore_poison(&self.state) = ConnectionState::Disconnected;
        log_info!("[{}] memory transport closed", self.transport_id);
        Ok(())
    }
}

/// Connect once to `broker`, succeeding only if it answers a liveness check.
///
/// # Errors
///
/// `RpcError::TransportUnavailable` if the broker is unreachable.
pub fn create_transport(transport_id: &str, broker: Arc<MemoryBroker>) -> Result<TransportPtr> {
    // ---
    broker.ping()?;
    log_info!("[{transport_id}] connected to memory broker");

    Ok(Arc::new(MemoryTransport {
        transport_id: Arc::from(transport_id),
        broker,
        state: Mutex::new(ConnectionState::Connected),
    }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Address, Envelope};
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn test_connect_requires_reachable_broker() {
        // ---
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(create_transport("t", broker.clone()).is_err());

        broker.set_reachable(true);
        let transport = create_transport("t", broker).unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_broken_then_reconnects() {
        // ---
        let broker = MemoryBroker::new();
        let transport = create_transport("t", broker.clone()).unwrap();

        broker.set_reachable(false);
        assert_eq!(transport.state(), ConnectionState::Broken);
        assert!(matches!(transport.open_channel(), Err(e) if e.is_unavailable()));
        assert_eq!(transport.state(), ConnectionState::Broken);

        broker.set_reachable(true);
        let channel = transport.open_channel().unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        channel.close().unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_channels() {
        // ---
        let transport = create_transport("t", MemoryBroker::new()).unwrap();
        transport.close().await.unwrap();

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(transport.open_channel(), Err(e) if e.is_unavailable()));
    }

    #[test]
    fn test_pump_runs_callbacks_on_caller() {
        // ---
        let broker = MemoryBroker::new();
        let transport = create_transport("t", broker.clone()).unwrap();
        let mut channel = transport.open_channel().unwrap();

        let queue = Address::from("inbox");
        channel.declare_queue(&queue, false).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        channel
            .consume(
                &queue,
                Box::new(move |env: Envelope| sink.lock().unwrap().push(env.payload)),
            )
            .unwrap();

        channel
            .publish(Envelope::response(
                queue.clone(),
                Bytes::from_static(b"hello"),
                Arc::from("c-1"),
            ))
            .unwrap();

        // nothing runs until the owner pumps
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(broker.queue_depth("inbox"), 1);

        channel.pump(Duration::from_millis(100)).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[Bytes::from_static(b"hello")]);
        assert_eq!(broker.queue_depth("inbox"), 0);
    }

    #[test]
    fn test_dropped_channel_releases_resources() {
        // ---
        let broker = MemoryBroker::new();
        let transport = create_transport("t", broker.clone()).unwrap();

        let reply = {
            let mut channel = transport.open_channel().unwrap();
            let reply = channel.declare_reply_queue().unwrap();
            channel.consume(&reply, Box::new(|_: Envelope| {})).unwrap();
            reply
        };

        assert!(!broker.queue_exists(reply.as_str()));
        assert_eq!(broker.open_channels(), 0);
    }
}
