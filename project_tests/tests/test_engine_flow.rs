use lib_telemetry::configs::{EngineConfig, UpstreamConfig};
use lib_telemetry::connections::{MemoryStore, ReadingsStore};
use lib_telemetry::core::{BatchStatus, BroadcastGateway};
use lib_telemetry::ingestors::backoff_delay;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn gateway_over(store: Arc<MemoryStore>) -> BroadcastGateway {
    let gateway = BroadcastGateway::new(EngineConfig::default(), store);
    gateway.start().expect("engine should start");
    gateway
}

#[tokio::test(start_paused = true)]
async fn test_batches_arrive_padded_newest_first() {
    let gateway = gateway_over(Arc::new(MemoryStore::from_history(&[10, 20, 30])));
    let mut stream = gateway.subscribe("c1", 5000).await.unwrap();

    let batch = stream.next_batch().await.unwrap();
    assert_eq!(batch.status, BatchStatus::Ok);
    assert_eq!(batch.values, vec![10, 20, 30, 0, 0]);

    // Nothing more until the next cadence tick.
    sleep(Duration::from_millis(4000)).await;
    assert!(stream.try_next_batch().is_none());
    sleep(Duration::from_millis(1100)).await;
    assert!(stream.try_next_batch().is_some());

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_yields_error_batches_until_recovery() {
    let store = Arc::new(MemoryStore::from_history(&[7]));
    store.set_available(false);
    let gateway = gateway_over(store.clone());
    let mut stream = gateway.subscribe("c2", 1000).await.unwrap();

    for _ in 0..3 {
        let batch = stream.next_batch().await.unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.values, vec![0, 0, 0, 0, 0]);
    }
    assert!(store.reconnect_attempts() > 0);

    store.set_available(true);
    let recovered = timeout(Duration::from_secs(5), async {
        loop {
            let batch = stream.next_batch().await.unwrap();
            if batch.is_ok() {
                return batch;
            }
        }
    })
    .await
    .expect("stream should recover once the store is back");
    assert_eq!(recovered.values, vec![7, 0, 0, 0, 0]);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_removes_subscription_within_one_cadence() {
    let gateway = gateway_over(Arc::new(MemoryStore::new()));
    let stream = gateway.subscribe("c1", 1000).await.unwrap();
    let _other = gateway.subscribe("c3", 1000).await.unwrap();
    assert_eq!(gateway.list_active().len(), 2);

    drop(stream);
    sleep(Duration::from_millis(1100)).await;

    let active = gateway.list_active();
    assert!(!active.contains("c1"));
    assert!(active.contains("c3"));
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_double_registration_keeps_one_worker() {
    let store = Arc::new(MemoryStore::from_history(&[1, 2]));
    let gateway = gateway_over(store);
    let _first = gateway.subscribe("c1", 1000).await.unwrap();
    let mut second = gateway.subscribe("c1", 250).await.unwrap();

    assert_eq!(gateway.status().active_subscription_count, 1);

    // Only the replacement worker feeds the live stream: about four batches
    // per second at 250ms, not a mix of both cadences.
    while second.try_next_batch().is_some() {}
    sleep(Duration::from_millis(1000)).await;
    let mut received = 0;
    while second.try_next_batch().is_some() {
        received += 1;
    }
    assert!((3..=5).contains(&received), "received {received} batches");

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_unsubscribe_is_a_no_op() {
    let gateway = gateway_over(Arc::new(MemoryStore::new()));
    let _stream = gateway.subscribe("c1", 1000).await.unwrap();

    assert!(!gateway.unsubscribe("nobody").await);
    assert_eq!(gateway.list_active().len(), 1);
    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inserted_readings_show_up_in_next_batch() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let mut stream = gateway.subscribe("c1", 500).await.unwrap();

    let first = stream.next_batch().await.unwrap();
    assert_eq!(first.values, vec![0, 0, 0, 0, 0]);

    store.insert(41).await.unwrap();
    store.insert(42).await.unwrap();
    let next = stream.next_batch().await.unwrap();
    assert_eq!(next.values, vec![42, 41, 0, 0, 0]);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_nothing_running() {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    let mut a = gateway.subscribe("a", 100).await.unwrap();
    let mut b = gateway.subscribe("b", 300).await.unwrap();

    gateway.shutdown().await;
    while a.next_batch().await.is_some() {}
    while b.next_batch().await.is_some() {}

    let status = gateway.status();
    assert!(!status.running);
    assert_eq!(status.active_subscription_count, 0);
    assert!(!store.health_check().await);
}

#[test]
fn test_upstream_backoff_sequence() {
    let config = UpstreamConfig::default();
    let delays: Vec<u64> = (0..8)
        .map(|failures| {
            backoff_delay(failures, config.base_backoff(), config.max_backoff()).as_secs()
        })
        .collect();
    assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
}
