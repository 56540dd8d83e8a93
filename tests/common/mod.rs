// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use region_rpc::{
    //
    connect_memory,
    Address,
    AsyncRpcClient,
    Envelope,
    MemoryBroker,
    RpcClient,
    RpcConfig,
    TransportPtr,
};

pub async fn transport_on(broker: &Arc<MemoryBroker>, config: &RpcConfig) -> TransportPtr {
    connect_memory(config, broker.clone())
        .await
        .expect("memory transport")
}

pub async fn client_on(broker: &Arc<MemoryBroker>, config: RpcConfig) -> RpcClient {
    let transport = transport_on(broker, &config).await;
    RpcClient::new(transport, config)
}

pub async fn async_client_on(broker: &Arc<MemoryBroker>, config: RpcConfig) -> AsyncRpcClient {
    let max_workers = config.max_workers;
    AsyncRpcClient::new(client_on(broker, config).await, max_workers)
}

/// Requests captured by a [`ScriptedResponder`], in arrival order.
pub type Captured = Arc<Mutex<Vec<Envelope>>>;

/// Responder that waits for `expected` requests, then answers them in
/// reverse order. Each real reply is preceded by one carrying a foreign
/// correlation id and followed by a duplicate with a different payload.
pub struct ScriptedResponder {
    pub captured: Captured,
    handle: JoinHandle<()>,
}

impl ScriptedResponder {
    pub fn start(transport: TransportPtr, config: &RpcConfig, expected: usize) -> Self {
        // ---
        let mut channel = transport.open_channel().expect("responder channel");
        let queue = Address::from(config.request_queue.as_str());
        channel
            .declare_queue(&queue, config.request_queue_durable)
            .expect("declare request queue");

        let inbox: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        channel
            .consume(&queue, Box::new(move |env: Envelope| sink.lock().unwrap().push(env)))
            .expect("consume request queue");

        let captured = inbox.clone();
        let handle = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while inbox.lock().unwrap().len() < expected && Instant::now() < deadline {
                channel.pump(Duration::from_millis(20)).unwrap();
            }

            let requests = inbox.lock().unwrap().clone();
            for request in requests.iter().rev() {
                let reply_to = request.reply_to.clone().unwrap();
                let id = request.correlation_id.clone().unwrap();

                channel
                    .publish(Envelope::response(
                        reply_to.clone(),
                        Bytes::from_static(b"stranger"),
                        Arc::from("not-a-real-correlation-id"),
                    ))
                    .unwrap();
                channel
                    .publish(Envelope::response(
                        reply_to.clone(),
                        request.payload.clone(),
                        id.clone(),
                    ))
                    .unwrap();
                channel
                    .publish(Envelope::response(
                        reply_to,
                        Bytes::from_static(b"duplicate"),
                        id,
                    ))
                    .unwrap();
            }

            channel.close().unwrap();
        });

        Self { captured, handle }
    }

    pub fn join(self) -> Vec<Envelope> {
        self.handle.join().expect("responder panicked");
        let captured = self.captured.lock().unwrap().clone();
        captured
    }
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
