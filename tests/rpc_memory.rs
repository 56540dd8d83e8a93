// tests/rpc_memory.rs

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use region_rpc::{
    //
    Envelope,
    MemoryBroker,
    Result,
    RpcConfig,
    RpcError,
    RpcServer,
};

use common::{async_client_on, client_on, init_logging, transport_on, ScriptedResponder};

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    sum: i32,
}

async fn math_server(broker: &std::sync::Arc<MemoryBroker>, config: &RpcConfig) -> RpcServer {
    // ---
    let transport = transport_on(broker, config).await;
    RpcServer::spawn_json(transport, config, |req: AddRequest| {
        Some(AddResponse { sum: req.a + req.b })
    })
    .expect("math server")
}

#[tokio::test]
async fn test_basic_request() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_basic_request");
    let server = math_server(&broker, &config).await;
    let client = client_on(&broker, config).await;

    let request = serde_json::to_vec(&AddRequest { a: 2, b: 3 })?;
    let reply = tokio::task::spawn_blocking(move || client.call(Bytes::from(request)))
        .await
        .expect("worker panicked")?;

    let resp: AddResponse = serde_json::from_slice(&reply)?;
    assert_eq!(resp.sum, 5);

    // only the server's channel and the shared request queue remain
    assert_eq!(broker.exclusive_queue_count(), 0);
    assert_eq!(broker.open_channels(), 1);
    assert!(broker.queue_exists("ddd_request"));

    server.shutdown()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_concurrent_requests").with_max_workers(10);
    let server = math_server(&broker, &config).await;
    let client = async_client_on(&broker, config).await;

    let mut handles = Vec::new();

    for i in 0..10 {
        // ---
        let c = client.clone();

        handles.push(tokio::spawn(async move {
            let request = serde_json::to_vec(&AddRequest { a: i, b: i }).unwrap();
            let reply = c.call(Bytes::from(request)).await.unwrap();
            serde_json::from_slice::<AddResponse>(&reply).unwrap().sum
        }));
    }

    for (i, task) in handles.into_iter().enumerate() {
        let sum = task.await.unwrap();
        assert_eq!(sum, (i as i32) * 2);
    }

    assert_eq!(broker.exclusive_queue_count(), 0);
    server.shutdown().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_replies_reach_their_own_caller() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_interleaved").with_max_workers(2);

    let responder = ScriptedResponder::start(transport_on(&broker, &config).await, &config, 2);
    let client = async_client_on(&broker, config).await;

    let (first, second) = tokio::join!(
        client.call_with_timeout(Bytes::from_static(b"call-A"), Duration::from_secs(5)),
        client.call_with_timeout(Bytes::from_static(b"call-B"), Duration::from_secs(5)),
    );

    // replies came back in reverse order, each wrapped in a foreign id and
    // followed by a duplicate
    assert_eq!(first.unwrap(), Bytes::from_static(b"call-A"));
    assert_eq!(second.unwrap(), Bytes::from_static(b"call-B"));

    let requests = responder.join();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].correlation_id, requests[1].correlation_id);

    // every private reply queue is gone; publishing to one is a silent drop
    let transport = transport_on(&broker, &RpcConfig::memory("probe")).await;
    let mut probe = transport.open_channel().unwrap();

    for request in &requests {
        let reply_to = request.reply_to.clone().unwrap();
        assert!(reply_to.as_str().starts_with("amq.gen-"));
        assert!(!broker.queue_exists(reply_to.as_str()));

        probe
            .publish(Envelope::response(
                reply_to.clone(),
                Bytes::from_static(b"too late"),
                request.correlation_id.clone().unwrap(),
            ))
            .unwrap();
        assert!(!broker.queue_exists(reply_to.as_str()));
        assert_eq!(broker.queue_depth(reply_to.as_str()), 0);
    }

    probe.close().unwrap();
    assert_eq!(broker.exclusive_queue_count(), 0);
}

#[tokio::test]
async fn test_timeout_is_bounded() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_timeout");
    let client = client_on(&broker, config).await;

    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        client.call_with_timeout(Bytes::from_static(b"hello?"), Duration::from_millis(300))
    })
    .await
    .unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RpcError::Timeout { .. })), "{result:?}");
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");

    assert_eq!(broker.exclusive_queue_count(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_late_reply_is_dropped() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_late_reply");

    let slow = RpcServer::spawn(transport_on(&broker, &config).await, &config, |p: Bytes| {
        std::thread::sleep(Duration::from_millis(300));
        Some(p)
    })
    .unwrap();

    let client = async_client_on(&broker, config).await;
    let err = client
        .call_with_timeout(Bytes::from_static(b"slow"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    // the server answers into a queue that no longer exists
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(slow.is_running());
    assert_eq!(broker.exclusive_queue_count(), 0);

    slow.shutdown().unwrap();
}

#[tokio::test]
async fn test_cleanup_after_broker_failure() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_broker_failure");
    let client = client_on(&broker, config).await;

    let call = tokio::task::spawn_blocking(move || {
        client.call_with_timeout(Bytes::from_static(b"doomed"), Duration::from_secs(5))
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.set_reachable(false);

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_unavailable(), "{err:?}");

    // torn down even though the broker could not be told
    assert_eq!(broker.exclusive_queue_count(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn test_unanswered_request_stays_queued() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_unanswered").with_request_queue("nobody.listens");
    let client = client_on(&broker, config).await;

    let result = tokio::task::spawn_blocking(move || {
        client.call_with_timeout(Bytes::new(), Duration::from_millis(50))
    })
    .await
    .unwrap();

    assert!(matches!(result, Err(RpcError::Timeout { .. })));
    assert_eq!(broker.queue_depth("nobody.listens"), 1);
    assert!(!broker.queue_exists("ddd_request"));
}
