use serde_json::json;

use cachestate::storage::{CacheDataStorage, CacheRecord};

use crate::{key, ok, setup_manager, skip_throttle};

#[tokio::test(start_paused = true)]
async fn test_results_expire_after_max_age() {
    let harness = setup_manager(|options| options);
    harness.producer.push_ok("A".into());
    harness.producer.push_ok("B".into());

    let mut first = harness.manager.observe("k", vec![], ());
    assert_eq!(first.next().await, ok("A"));
    harness.manager.settled().await;

    assert_eq!(
        harness.record("k").await,
        Some(CacheRecord::new(json!("A"), 0, 1000))
    );

    // still fresh: replayed without running the producer
    harness.clock.set(500);
    let mut second = harness.manager.observe("k", vec![], ());
    assert_eq!(second.next().await, ok("A"));
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 1);

    // outdated: recomputed, and every observer follows
    harness.clock.set(1500);
    skip_throttle().await;
    let mut third = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;

    assert_eq!(harness.producer.calls(), 2);
    assert_eq!(first.next().await, ok("B"));
    assert_eq!(second.next().await, ok("B"));
    assert_eq!(third.next().await, ok("B"));
    assert_eq!(
        harness.record("k").await,
        Some(CacheRecord::new(json!("B"), 1500, 1000))
    );
}

#[tokio::test(start_paused = true)]
async fn test_expiry_boundary_is_inclusive() {
    let harness = setup_manager(|options| options);
    harness.producer.set_fallback("A".into());

    let _stream = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;

    // `created_at + max_age == now` is still fresh
    harness.clock.set(1000);
    skip_throttle().await;
    let _again = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 1);

    harness.clock.set(1001);
    skip_throttle().await;
    let _later = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_record_is_restored_without_producer() {
    let harness = setup_manager(|options| options);
    harness.producer.set_fallback("computed".into());

    // a record written by an earlier run, or by another manager sharing the store
    harness
        .storage
        .store(&key("k"), CacheRecord::new(json!("persisted"), 0, 1000))
        .await
        .unwrap();

    let stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.first().await, Ok("persisted".to_owned()));
    assert_eq!(harness.producer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_record_is_recomputed() {
    let harness = setup_manager(|options| options);
    harness.producer.set_fallback("computed".into());

    harness
        .storage
        .store(&key("k"), CacheRecord::new(json!({"not": "a string"}), 0, 1000))
        .await
        .unwrap();

    let stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.first().await, Ok("computed".to_owned()));
    assert_eq!(harness.producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_reuses_first_arguments() {
    let harness = setup_manager(|options| options);
    harness.producer.set_fallback("A".into());

    let _first = harness.manager.observe("k", vec![1], ());
    harness.manager.settled().await;

    // arguments of later calls for a tracked key are ignored
    harness.clock.set(5000);
    skip_throttle().await;
    let _second = harness.manager.observe("k", vec![2], ());
    harness.manager.settled().await;

    assert_eq!(harness.producer.seen_args(), vec!["[1]", "[1]"]);
}
