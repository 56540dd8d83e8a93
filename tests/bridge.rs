mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;

use region_rpc::{
    //
    MemoryBroker,
    RpcConfig,
    RpcError,
    RpcServer,
};

use common::{async_client_on, init_logging, transport_on};

#[tokio::test]
async fn test_scheduler_stays_responsive_during_call() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let config = RpcConfig::memory("test_responsive");

    let slow = RpcServer::spawn(transport_on(&broker, &config).await, &config, |p: Bytes| {
        std::thread::sleep(Duration::from_millis(300));
        Some(p)
    })
    .unwrap();

    let client = async_client_on(&broker, config).await;
    let started = Instant::now();

    // current-thread runtime: the ticker only advances if the call yields
    let (reply, ticker_done) = tokio::join!(
        client.call_with_timeout(Bytes::from_static(b"slow lookup"), Duration::from_secs(5)),
        async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            started.elapsed()
        },
    );

    assert_eq!(reply.unwrap(), Bytes::from_static(b"slow lookup"));
    assert!(ticker_done < Duration::from_millis(250), "{ticker_done:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));

    slow.shutdown().unwrap();
}

#[tokio::test]
async fn test_worker_pool_is_bounded() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = async_client_on(&broker, RpcConfig::memory("test_bounded").with_max_workers(2)).await;
    let timeout = Duration::from_millis(200);

    let started = Instant::now();
    let results = tokio::join!(
        client.call_with_timeout(Bytes::from_static(b"1"), timeout),
        client.call_with_timeout(Bytes::from_static(b"2"), timeout),
        client.call_with_timeout(Bytes::from_static(b"3"), timeout),
        client.call_with_timeout(Bytes::from_static(b"4"), timeout),
    );
    let elapsed = started.elapsed();

    for result in [results.0, results.1, results.2, results.3] {
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
    }

    // two waves of two
    assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
    assert_eq!(client.available_workers(), 2);
    assert_eq!(broker.exclusive_queue_count(), 0);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_leak_worker() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let client = async_client_on(&broker, RpcConfig::memory("test_cancel").with_max_workers(1)).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        client.call_with_timeout(Bytes::from_static(b"never mind"), Duration::from_millis(300)),
    )
    .await;
    assert!(abandoned.is_err(), "call unexpectedly completed");

    // the worker still owns its reply queue and its slot
    assert_eq!(client.available_workers(), 0);
    assert_eq!(broker.exclusive_queue_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(client.available_workers(), 1);
    assert_eq!(broker.exclusive_queue_count(), 0);
    assert_eq!(broker.open_channels(), 0);
}
