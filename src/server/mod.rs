//! Responder side of the request/reply protocol.
//!
//! Serves the well-known request queue from a dedicated worker thread: pump,
//! hand each request to the handler, publish its reply to the request's
//! `reply_to` queue echoing the `correlation_id`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Address,
    Channel,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
    MIN_PUMP_INTERVAL,
};

/// Upper bound on one pump slice, so `shutdown` is noticed promptly.
const MAX_SERVE_SLICE: Duration = Duration::from_millis(50);

/// RPC server answering requests on `config.request_queue`.
///
/// # Example
///
/// ```no_run
/// use region_rpc::{connect, RpcConfig, RpcServer};
/// use bytes::Bytes;
///
/// # async fn example() -> region_rpc::Result<()> {
/// let config = RpcConfig::memory("echo");
/// let transport = connect(&config).await?;
///
/// let server = RpcServer::spawn(transport, &config, |payload: Bytes| Some(payload))?;
/// // ...
/// server.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer {
    // ---
    transport_id: String,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl RpcServer {
    // ---

    /// Start serving with a raw payload handler.
    ///
    /// The request queue is declared and consumed before this returns, so
    /// any request published afterwards is served. A handler returning
    /// `None` leaves the request unanswered.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot be opened, the queue cannot be declared
    /// or consumed, or the worker thread cannot be started.
    pub fn spawn<F>(transport: TransportPtr, config: &RpcConfig, handler: F) -> Result<Self>
    where
        F: Fn(Bytes) -> Option<Bytes> + Send + 'static,
    {
        // ---
        let transport_id = transport.transport_id().to_string();
        let queue = Address::from(config.request_queue.as_str());
        let durable = config.request_queue_durable;
        let slice = config.pump_interval.clamp(MIN_PUMP_INTERVAL, MAX_SERVE_SLICE);
        let stop = Arc::new(AtomicBool::new(false));

        // Channel setup runs on the worker: blocking transports must not be
        // driven from an async task.
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);

        let worker = thread::Builder::new()
            .name(format!("rpc-server-{transport_id}"))
            .spawn({
                let stop = stop.clone();
                move || {
                    let opened = ServeLoop::open(&transport, &queue, durable, handler);
                    let serve = match opened {
                        Ok(serve) => serve,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return Ok(());
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    serve.run(slice, &stop)
                }
            })
            .map_err(|e| RpcError::WorkerLost(format!("cannot start server thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                return Err(RpcError::WorkerLost(format!(
                    "[{transport_id}] server thread exited during setup"
                )));
            }
        }

        log_info!("[{transport_id}] serving {}", config.request_queue);

        Ok(Self {
            transport_id,
            stop,
            worker: Some(worker),
        })
    }

    /// Start serving with a typed JSON handler.
    ///
    /// Requests that do not decode as `Req` are logged and dropped without a
    /// reply.
    pub fn spawn_json<Req, Resp, F>(
        transport: TransportPtr,
        config: &RpcConfig,
        handler: F,
    ) -> Result<Self>
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req) -> Option<Resp> + Send + 'static,
    {
        // ---
        let transport_id = transport.transport_id().to_string();

        Self::spawn(transport, config, move |payload: Bytes| {
            let request: Req = match serde_json::from_slice(&payload) {
                Ok(request) => request,
                Err(e) => {
                    log_warn!("[{transport_id}] dropping undecodable request: {e}");
                    return None;
                }
            };

            let reply = handler(request)?;
            match serde_json::to_vec(&reply) {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    log_error!("[{transport_id}] cannot encode reply: {e}");
                    None
                }
            }
        })
    }

    /// Stop the serving loop and wait for the worker to release its channel.
    ///
    /// Returns the loop's own result: an error here means the loop had
    /// already stopped on a transport failure.
    pub fn shutdown(mut self) -> Result<()> {
        // ---
        self.stop.store(true, Ordering::Release);

        match self.worker.take() {
            Some(worker) => match worker.join() {
                Ok(result) => result,
                Err(_) => Err(RpcError::WorkerLost(format!(
                    "[{}] server thread panicked",
                    self.transport_id
                ))),
            },
            None => Ok(()),
        }
    }

    /// True while the worker thread is still serving.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct ServeLoop<F> {
    transport_id: String,
    channel: Box<dyn Channel>,
    requests: Receiver<Envelope>,
    handler: F,
}

impl<F> ServeLoop<F>
where
    F: Fn(Bytes) -> Option<Bytes>,
{
    /// Declare and consume `queue`; requests are parked for the loop, since
    /// the channel cannot publish while it is pumping.
    fn open(transport: &TransportPtr, queue: &Address, durable: bool, handler: F) -> Result<Self> {
        // ---
        let mut channel = transport.open_channel()?;
        channel.declare_queue(queue, durable)?;

        let (tx, rx) = mpsc::channel();
        channel.consume(
            queue,
            Box::new(move |env: Envelope| {
                let _ = tx.send(env);
            }),
        )?;

        Ok(Self {
            transport_id: transport.transport_id().to_string(),
            channel,
            requests: rx,
            handler,
        })
    }

    fn run(mut self, slice: Duration, stop: &AtomicBool) -> Result<()> {
        // ---
        let result = self.serve(slice, stop);
        let id = self.transport_id.clone();

        if let Err(e) = &result {
            log_error!("[{id}] server stopped: {e}");
        }
        if let Err(e) = self.channel.close() {
            log_warn!("[{id}] failed to close server channel: {e}");
        }

        log_info!("[{id}] server stopped");
        result
    }

    fn serve(&mut self, slice: Duration, stop: &AtomicBool) -> Result<()> {
        // ---
        while !stop.load(Ordering::Acquire) {
            self.channel.pump(slice)?;

            while let Ok(request) = self.requests.try_recv() {
                self.answer(request)?;
            }
        }
        Ok(())
    }

    fn answer(&mut self, request: Envelope) -> Result<()> {
        // ---
        let id = &self.transport_id;

        let (Some(correlation_id), Some(reply_to)) = (request.correlation_id, request.reply_to)
        else {
            log_warn!("[{id}] skipping request without reply_to or correlation_id");
            return Ok(());
        };

        match (self.handler)(request.payload) {
            Some(reply) => {
                log_debug!("[{id}] replying to {correlation_id} on {reply_to}");
                self.channel
                    .publish(Envelope::response(reply_to, reply, correlation_id))
            }
            None => {
                log_debug!("[{id}] no reply for {correlation_id}");
                Ok(())
            }
        }
    }
}
