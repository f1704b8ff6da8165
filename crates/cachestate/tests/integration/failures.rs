use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use cachestate::caching::CacheError;
use cachestate::storage::{CacheDataStorage, CacheRecord, LocalCacheDataStorage};
use cachestate::{CacheEntry, CacheKey};

use crate::{key, ok, setup_manager, skip_throttle};

#[tokio::test(start_paused = true)]
async fn test_failure_is_terminal() {
    let harness = setup_manager(|options| options);
    harness.producer.push_ok("A".into());
    harness.producer.push_err("backend unavailable");
    harness.producer.push_ok("B".into());

    let mut stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.next().await, ok("A"));
    harness.manager.settled().await;

    skip_throttle().await;
    harness.manager.invalidate_and_update(Some("k".into())).await;
    assert_eq!(
        stream.next().await,
        Some(Err(CacheError::Producer("backend unavailable".into())))
    );
    assert_eq!(stream.next().await, None);
    harness.manager.settled().await;
    assert_eq!(harness.record("k").await, None);

    // the failure is replayed, while the new lookup retries in the background
    skip_throttle().await;
    let retry = harness.manager.observe("k", vec![], ());
    assert_eq!(
        retry.first().await,
        Err(CacheError::Producer("backend unavailable".into()))
    );
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 3);

    let recovered = harness.manager.observe("k", vec![], ());
    assert_eq!(recovered.first().await, Ok("B".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn test_failure_only_affects_its_key() {
    let harness = setup_manager(|options| options);
    harness.producer.push_err("boom");
    harness.producer.push_ok("fine".into());

    let failing = harness.manager.observe("bad", vec![1], ());
    assert!(failing.first().await.is_err());

    let healthy = harness.manager.observe("good", vec![2], ());
    assert_eq!(healthy.first().await, Ok("fine".to_owned()));
}

/// An in-memory store whose operations can be made to fail.
#[derive(Debug, Default)]
struct FlakyStorage {
    inner: LocalCacheDataStorage,
    fail_store: AtomicBool,
    fail_get: AtomicBool,
    fail_remove: AtomicBool,
}

fn check(flag: &AtomicBool) -> CacheEntry {
    match flag.load(Ordering::SeqCst) {
        true => Err(CacheError::Storage("disk full".into())),
        false => Ok(()),
    }
}

#[async_trait]
impl CacheDataStorage for FlakyStorage {
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry {
        check(&self.fail_store)?;
        self.inner.store(key, record).await
    }

    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>> {
        check(&self.fail_get)?;
        self.inner.get(key).await
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry {
        check(&self.fail_remove)?;
        self.inner.remove_many(keys).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_store_still_emits() {
    let storage = Arc::new(FlakyStorage::default());
    storage.fail_store.store(true, Ordering::SeqCst);
    let harness = setup_manager({
        let storage = storage.clone();
        |options| options.with_storage(storage)
    });
    harness.producer.set_fallback("A".into());

    let stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.first().await, Ok("A".to_owned()));
    harness.manager.settled().await;
    assert_eq!(storage.inner.get(&"k".into()).await.unwrap(), None);

    // the next lookup after the window finds nothing and recomputes
    storage.fail_store.store(false, Ordering::SeqCst);
    skip_throttle().await;
    let _again = harness.manager.observe("k", vec![], ());
    harness.manager.settled().await;
    assert_eq!(harness.producer.calls(), 2);
    assert!(storage.inner.get(&"k".into()).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_get_counts_as_missing() {
    let storage = Arc::new(FlakyStorage::default());
    storage.fail_get.store(true, Ordering::SeqCst);
    let harness = setup_manager({
        let storage = storage.clone();
        |options| options.with_storage(storage)
    });
    harness.producer.set_fallback("A".into());

    let stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.first().await, Ok("A".to_owned()));
    assert_eq!(harness.producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_remove_still_refreshes() {
    let storage = Arc::new(FlakyStorage::default());
    storage.fail_remove.store(true, Ordering::SeqCst);
    let harness = setup_manager({
        let storage = storage.clone();
        |options| options.with_storage(storage)
    });
    harness.producer.push_ok("A".into());
    harness.producer.push_ok("B".into());

    let mut stream = harness.manager.observe("k", vec![], ());
    assert_eq!(stream.next().await, ok("A"));
    harness.manager.settled().await;

    skip_throttle().await;
    harness.manager.invalidate_and_update(Some("k".into())).await;
    assert_eq!(stream.next().await, ok("B"));
}

/// An in-memory store whose writes take a while.
#[derive(Debug, Default)]
struct SlowStorage {
    inner: LocalCacheDataStorage,
}

#[async_trait]
impl CacheDataStorage for SlowStorage {
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.store(key, record).await
    }

    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>> {
        self.inner.get(key).await
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry {
        self.inner.remove_many(keys).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_eviction_during_store_leaves_no_record() {
    let storage = Arc::new(SlowStorage::default());
    let harness = setup_manager({
        let storage = storage.clone();
        |options| options.with_storage(storage)
    });
    harness.producer.set_fallback("A".into());

    let stream = harness.manager.observe("k", vec![], ());
    // the refresh of "k" is now writing its record
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.producer.calls(), 1);
    drop(stream);

    let other = harness.manager.observe("j", vec![], ());
    assert_eq!(other.first().await, Ok("A".to_owned()));
    harness.manager.settled().await;

    assert_eq!(harness.manager.tracked_keys(), vec![key("j")]);
    assert_eq!(storage.inner.get(&key("k")).await.unwrap(), None);
    assert!(storage.inner.get(&key("j")).await.unwrap().is_some());
}
