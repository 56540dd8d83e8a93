//! AMQP transport implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! - One shared `lapin::Connection` per transport, guarded by a mutex that
//!   also carries the connection state machine.
//! - One `lapin::Channel` per [`Channel`] handed out, owned by the caller.
//! - Channel operations are driven synchronously from the calling thread via
//!   the tokio runtime [`Handle`] captured when the transport was created.
//!   Callers must therefore be worker threads (`spawn_blocking` or plain
//!   threads), never async tasks: `Handle::block_on` panics inside one.
//!
//! ## Message delivery semantics
//!
//! Consumers are plain lapin `Consumer` streams. They are only polled inside
//! [`Channel::pump`], which is where callbacks run; no background task
//! forwards deliveries. Replies are consumed with `no_ack` (auto-ack), so an
//! unconsumed reply is lost with its queue, which is the intended fate of a
//! late reply.
//!
//! ## Queue semantics
//!
//! - Named queues: durability as requested, non-exclusive, no auto-delete.
//! - Reply queues: broker-named (`amq.gen-…`), exclusive, auto-delete.
//!   Exclusive queues belong to the *connection* in AMQP, not the channel, so
//!   channels delete their reply queues explicitly on close.
//!
//! ## Wire format
//!
//! Payloads travel as the raw message body. `correlation_id`, `reply_to` and
//! `content_type` map onto the AMQP basic properties of the same names, which
//! is what an independent resolver service expects to read.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures_lite::Stream;

use lapin::{
    //
    message::Delivery,
    options::{
        //
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties,
    Connection,
    ConnectionProperties,
    Consumer,
};

use tokio::runtime::Handle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    Channel,
    ConnectionState,
    ConsumerTag,
    DeliveryCallback,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    Transport,
    TransportPtr,
};

const NORMAL_SHUTDOWN: u16 = 200;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Classify a lapin error: lost connections are retryable availability
/// problems, everything else is a protocol-level refusal.
fn amqp_error(context: &str, err: lapin::Error) -> RpcError {
    match &err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => {
            RpcError::TransportUnavailable(format!("amqp: {context}: {err}"))
        }
        _ => RpcError::Transport(format!("amqp: {context}: {err}")),
    }
}

/// Strip credentials from a broker URI before logging it.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &uri[..scheme_end], &uri[at..])
        }
        _ => uri.to_string(),
    }
}

/// Open a connection and prove it usable by opening and closing a channel.
async fn connect_once(uri: &str) -> Result<Connection> {
    // ---
    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| RpcError::TransportUnavailable(format!("amqp: connection failed: {e}")))?;

    let probe = connection
        .create_channel()
        .await
        .map_err(|e| amqp_error("liveness probe", e))?;
    probe
        .close(NORMAL_SHUTDOWN, "liveness probe")
        .await
        .map_err(|e| amqp_error("liveness probe", e))?;

    Ok(connection)
}

enum Link {
    Disconnected,
    Connecting,
    Connected(Connection),
    Broken,
}

impl Link {
    fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected(conn) if conn.status().connected() => ConnectionState::Connected,
            Link::Connected(_) | Link::Broken => ConnectionState::Broken,
        }
    }
}

/// AMQP transport implementation using lapin.
struct AmqpTransport {
    // ---
    transport_id: Arc<str>,
    uri: String,
    runtime: Handle,
    link: Mutex<Link>,
}

impl AmqpTransport {
    fn open_lapin_channel(&self) -> Result<lapin::Channel> {
        // ---
        let mut link = lock_ignore_poison(&self.link);

        match link.state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => {
                return Err(RpcError::TransportUnavailable(format!(
                    "[{}] transport closed",
                    self.transport_id
                )));
            }
            ConnectionState::Connecting | ConnectionState::Broken => {
                log_warn!("[{}] AMQP connection broken, reconnecting", self.transport_id);
                *link = Link::Connecting;

                match self.runtime.block_on(connect_once(&self.uri)) {
                    Ok(connection) => {
                        log_info!("[{}] reconnected to AMQP broker", self.transport_id);
                        *link = Link::Connected(connection);
                    }
                    Err(err) => {
                        *link = Link::Broken;
                        return Err(err);
                    }
                }
            }
        }

        let Link::Connected(connection) = &*link else {
            return Err(RpcError::TransportUnavailable("amqp: not connected".into()));
        };

        match self.runtime.block_on(connection.create_channel()) {
            Ok(channel) => Ok(channel),
            Err(e) => {
                let err = amqp_error("channel creation failed", e);
                if err.is_unavailable() {
                    *link = Link::Broken;
                }
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn state(&self) -> ConnectionState {
        lock_ignore_poison(&self.link).state()
    }

    fn open_channel(&self) -> Result<Box<dyn Channel>> {
        let channel = self.open_lapin_channel()?;
        log_debug!("[{}] AMQP channel {} opened", self.transport_id, channel.id());

        Ok(Box::new(AmqpChannel {
            transport_id: self.transport_id.clone(),
            runtime: self.runtime.clone(),
            channel,
            consumers: Vec::new(),
            reply_queues: Vec::new(),
            next_tag: 0,
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        let previous = {
            let mut link = lock_ignore_poison(&self.link);
            std::mem::replace(&mut *link, Link::Disconnected)
        };

        if let Link::Connected(connection) = previous {
            connection
                .close(NORMAL_SHUTDOWN, "Normal shutdown")
                .await
                .map_err(|e| amqp_error("connection close failed", e))?;
        }

        log_info!("[{}] AMQP transport closed", self.transport_id);
        Ok(())
    }
}

struct AmqpConsumer {
    tag: ConsumerTag,
    stream: Consumer,
    on_delivery: DeliveryCallback,
}

/// One lapin channel plus the consumers registered on it.
struct AmqpChannel {
    // ---
    transport_id: Arc<str>,
    runtime: Handle,
    channel: lapin::Channel,
    consumers: Vec<AmqpConsumer>,
    reply_queues: Vec<Address>,
    next_tag: u64,
    closed: bool,
}

impl AmqpChannel {
    fn envelope(mut delivery: Delivery) -> Envelope {
        // ---
        let props = &delivery.properties;
        let correlation_id = props.correlation_id().as_ref().map(|id| Arc::from(id.as_str()));
        let reply_to = props.reply_to().as_ref().map(|q| Address::from(q.as_str()));
        let content_type = props.content_type().as_ref().map(|ct| Arc::from(ct.as_str()));
        let address = Address::from(delivery.routing_key.as_str());

        Envelope {
            address,
            payload: Bytes::from(std::mem::take(&mut delivery.data)),
            correlation_id,
            reply_to,
            content_type,
        }
    }
}

impl Channel for AmqpChannel {
    fn declare_queue(&mut self, name: &Address, durable: bool) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };

        self.runtime
            .block_on(
                self.channel
                    .queue_declare(name.as_str(), options, FieldTable::default()),
            )
            .map_err(|e| amqp_error("queue declare failed", e))?;

        log_debug!("[{}] declared queue {name}", self.transport_id);
        Ok(())
    }

    fn declare_reply_queue(&mut self) -> Result<Address> {
        // ---
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .runtime
            .block_on(self.channel.queue_declare("", options, FieldTable::default()))
            .map_err(|e| amqp_error("reply queue declare failed", e))?;

        let name = Address::from(queue.name().as_str());
        self.reply_queues.push(name.clone());

        log_debug!("[{}] declared reply queue {name}", self.transport_id);
        Ok(name)
    }

    fn publish(&mut self, env: Envelope) -> Result<()> {
        // ---
        let mut properties = BasicProperties::default();
        if let Some(ct) = &env.content_type {
            properties = properties.with_content_type(ShortString::from(ct.to_string()));
        }
        if let Some(id) = &env.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.to_string()));
        }
        if let Some(reply_to) = &env.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.to_string()));
        }

        let channel = &self.channel;
        self.runtime
            .block_on(async {
                channel
                    .basic_publish(
                        "", // default exchange
                        env.address.as_str(),
                        BasicPublishOptions::default(),
                        &env.payload,
                        properties,
                    )
                    .await?
                    .await
            })
            .map_err(|e| amqp_error("publish failed", e))?;

        log_debug!("[{}] published to {}", self.transport_id, env.address);
        Ok(())
    }

    fn consume(&mut self, queue: &Address, on_delivery: DeliveryCallback) -> Result<ConsumerTag> {
        // ---
        self.next_tag += 1;
        let tag = format!(
            "{}-ctag-{}.{}",
            self.transport_id,
            self.channel.id(),
            self.next_tag
        );

        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };

        let stream = self
            .runtime
            .block_on(
                self.channel
                    .basic_consume(queue.as_str(), &tag, options, FieldTable::default()),
            )
            .map_err(|e| amqp_error("consume failed", e))?;

        let tag = ConsumerTag(Arc::from(tag));
        self.consumers.push(AmqpConsumer {
            tag: tag.clone(),
            stream,
            on_delivery,
        });

        log_debug!("[{}] consuming {queue} as {tag}", self.transport_id);
        Ok(tag)
    }

    fn cancel(&mut self, tag: &ConsumerTag) -> Result<()> {
        // ---
        let Some(index) = self.consumers.iter().position(|c| &c.tag == tag) else {
            return Ok(());
        };
        self.consumers.remove(index);

        self.runtime
            .block_on(
                self.channel
                    .basic_cancel(&tag.0, BasicCancelOptions::default()),
            )
            .map_err(|e| amqp_error("cancel failed", e))
    }

    fn delete_queue(&mut self, queue: &Address) -> Result<()> {
        // ---
        self.reply_queues.retain(|q| q != queue);

        self.runtime
            .block_on(
                self.channel
                    .queue_delete(queue.as_str(), QueueDeleteOptions::default()),
            )
            .map_err(|e| amqp_error("queue delete failed", e))?;

        log_debug!("[{}] deleted queue {queue}", self.transport_id);
        Ok(())
    }

    fn pump(&mut self, slice: Duration) -> Result<()> {
        // ---
        if self.consumers.is_empty() {
            std::thread::sleep(slice);
            return Ok(());
        }

        let consumers = &mut self.consumers;
        let next = std::future::poll_fn(|cx| {
            for (index, consumer) in consumers.iter_mut().enumerate() {
                if let Poll::Ready(item) = Pin::new(&mut consumer.stream).poll_next(cx) {
                    return Poll::Ready((index, item));
                }
            }
            Poll::Pending
        });

        let polled = self
            .runtime
            .block_on(async { tokio::time::timeout(slice, next).await });

        match polled {
            Err(_elapsed) => Ok(()),
            Ok((index, Some(Ok(delivery)))) => {
                let env = Self::envelope(delivery);
                (self.consumers[index].on_delivery)(env);
                Ok(())
            }
            Ok((_, Some(Err(e)))) => Err(amqp_error("delivery failed", e)),
            Ok((index, None)) => {
                let gone = self.consumers.remove(index);
                Err(RpcError::Transport(format!(
                    "amqp: consumer {} cancelled by broker",
                    gone.tag
                )))
            }
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        // ---
        self.closed = true;
        let mut first_error = None;

        for consumer in std::mem::take(&mut self.consumers) {
            if let Err(e) = self.runtime.block_on(
                self.channel
                    .basic_cancel(&consumer.tag.0, BasicCancelOptions::default()),
            ) {
                first_error.get_or_insert(amqp_error("cancel failed", e));
            }
        }

        for queue in std::mem::take(&mut self.reply_queues) {
            if let Err(e) = self.runtime.block_on(
                self.channel
                    .queue_delete(queue.as_str(), QueueDeleteOptions::default()),
            ) {
                first_error.get_or_insert(amqp_error("queue delete failed", e));
            }
        }

        if let Err(e) = self
            .runtime
            .block_on(self.channel.close(NORMAL_SHUTDOWN, "Normal shutdown"))
        {
            first_error.get_or_insert(amqp_error("channel close failed", e));
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        // ---
        if self.closed {
            return;
        }

        // Dropped without close(): finish the teardown on the runtime, since
        // blocking here could be inside an async context.
        let channel = self.channel.clone();
        let reply_queues = std::mem::take(&mut self.reply_queues);
        let transport_id = self.transport_id.clone();

        self.runtime.spawn(async move {
            for queue in reply_queues {
                if let Err(e) = channel
                    .queue_delete(queue.as_str(), QueueDeleteOptions::default())
                    .await
                {
                    log_error!("[{transport_id}] failed to delete {queue} on drop: {e}");
                }
            }
            let _ = channel.close(NORMAL_SHUTDOWN, "Channel dropped").await;
        });
    }
}

/// Creates a lapin-based AMQP transport from the given configuration.
///
/// Makes a single connection attempt; [`connect`](crate::connect) wraps this
/// in the configured retry policy.
///
/// # Errors
///
/// `RpcError::TransportUnavailable` if the broker cannot be reached or fails
/// the liveness probe.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    log_info!(
        "[{}] connecting to AMQP broker: {}",
        config.transport_id,
        redact(&config.broker_uri)
    );

    let connection = connect_once(&config.broker_uri).await?;

    log_info!("[{}] connected to AMQP broker", config.transport_id);

    Ok(Arc::new(AmqpTransport {
        transport_id: Arc::from(config.transport_id.as_str()),
        uri: config.broker_uri.clone(),
        runtime: Handle::current(),
        link: Mutex::new(Link::Connected(connection)),
    }))
}
