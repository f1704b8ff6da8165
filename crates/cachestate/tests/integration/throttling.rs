use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use crate::{key, ok, setup_manager, skip_throttle};

#[tokio::test(start_paused = true)]
async fn test_concurrent_observers_share_one_refresh() {
    let harness = setup_manager(|options| options);
    harness
        .producer
        .push_ok_after(Duration::from_millis(50), "A".into());

    let streams: Vec<_> = (0..10)
        .map(|_| harness.manager.observe("k", vec![], ()))
        .collect();
    assert_eq!(harness.manager.observer_count("k"), 10);

    let results = join_all(streams.into_iter().map(|stream| stream.first())).await;
    assert!(results.iter().all(|result| result == &Ok("A".to_owned())));
    assert_eq!(harness.producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_updates_runs_producer_once() {
    let harness = setup_manager(|options| options);
    harness.producer.set_fallback("A".into());

    let _stream = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;
    skip_throttle().await;

    for _ in 0..10 {
        harness.manager.invalidate_and_update(Some(key("k"))).await;
    }
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 2);

    // a request after the window starts a new one
    skip_throttle().await;
    harness.manager.invalidate_and_update(Some(key("k"))).await;
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_window_is_configurable() {
    let harness = setup_manager(|mut options| {
        options.config.refresh_throttle = Duration::from_secs(5);
        options
    });
    harness.producer.set_fallback("A".into());

    let _stream = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;

    skip_throttle().await;
    harness.manager.invalidate_and_update(Some(key("k"))).await;
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    harness.manager.invalidate_and_update(Some(key("k"))).await;
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_refresh_lands_last() {
    let harness = setup_manager(|options| options);
    harness
        .producer
        .push_ok_after(Duration::from_secs(1), "slow".into());
    harness.producer.push_ok("fast".into());

    let mut stream = harness.manager.observe("k", vec![], ());
    skip_throttle().await;
    harness.clock.set(200);
    harness.manager.invalidate_and_update(Some(key("k"))).await;

    // the running refresh is not cancelled, its result overwrites the newer one
    assert_eq!(stream.next().await, ok("fast"));
    harness.clock.set(1000);
    assert_eq!(stream.next().await, ok("slow"));
    harness.manager.settled().await;

    let record = harness.record("k").await.unwrap();
    assert_eq!(record.data, json!("slow"));
    assert_eq!(record.created_at, 1000);
    assert_eq!(harness.producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_result_of_evicted_key_is_discarded() {
    let harness = setup_manager(|options| options);
    harness
        .producer
        .push_ok_after(Duration::from_secs(1), "slow".into());
    harness.producer.set_fallback("other".into());

    let stream = harness.manager.observe("k", vec![], ());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.producer.calls(), 1);
    drop(stream);

    let other = harness.manager.observe("x", vec![], ());
    assert_eq!(other.first().await, Ok("other".to_owned()));
    harness.manager.settled().await;

    assert_eq!(harness.producer.calls(), 2);
    assert_eq!(harness.manager.tracked_keys(), vec![key("x")]);
    assert_eq!(harness.record("k").await, None);
}
