use std::sync::Arc;

use cachestate::caching::{CacheManager, CacheOptions};
use cachestate::storage::{
    CacheDataStorage, FilesystemKeyValueStore, KeyValueCacheDataStorage, PurgingCacheDataStorage,
};
use cachestate::time::ManualTimestampProvider;
use cachestate::{CacheKey, InvalidationBus};
use cachestate_test as test;

use crate::{MAX_AGE, ScriptedProducer};

fn filesystem_options(dir: &std::path::Path, clock: &ManualTimestampProvider) -> CacheOptions {
    let timestamps = Arc::new(clock.clone());
    let storage =
        KeyValueCacheDataStorage::new(FilesystemKeyValueStore::new(dir), timestamps.clone());
    CacheOptions::default()
        .with_storage(Arc::new(storage))
        .with_timestamps(timestamps)
        .with_max_age(MAX_AGE)
}

#[tokio::test]
async fn test_records_survive_restart() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = ManualTimestampProvider::new(0);
    let bus = InvalidationBus::default();

    let producer = ScriptedProducer::returning("A".to_owned());
    let manager: CacheManager<String> = CacheManager::new(
        "users",
        producer.producer(),
        filesystem_options(cache_dir.path(), &clock),
        &bus,
    );

    let stream = manager.observe("UserService#get_", (), ());
    assert_eq!(stream.latest(), None);
    assert_eq!(stream.first().await, Ok("A".to_owned()));
    manager.settled().await;
    manager.shutdown().await;

    let raw = std::fs::read_to_string(cache_dir.path().join("cachestate.json")).unwrap();
    insta::assert_snapshot!(raw, @r#"{"UserService#get_":{"data":"A","createdAt":0,"maxAgeMS":1000}}"#);

    // a new manager over the same directory
    clock.set(500);
    let restarted_producer = ScriptedProducer::returning("B".to_owned());
    let restarted: CacheManager<String> = CacheManager::new(
        "users",
        restarted_producer.producer(),
        filesystem_options(cache_dir.path(), &clock),
        &bus,
    );

    let stream = restarted.observe("UserService#get_", (), ());
    assert_eq!(stream.first().await, Ok("A".to_owned()));
    assert_eq!(restarted_producer.calls(), 0);
}

#[tokio::test]
async fn test_purging_storage_drops_expired_records() {
    test::setup();
    let clock = ManualTimestampProvider::new(0);
    let storage = Arc::new(PurgingCacheDataStorage::new(Arc::new(clock.clone())));

    let producer = ScriptedProducer::returning(42u32);
    let options = CacheOptions::default()
        .with_storage(storage.clone())
        .with_timestamps(Arc::new(clock.clone()))
        .with_max_age(MAX_AGE);
    let manager: CacheManager<u32, u32> =
        CacheManager::new("numbers", producer.producer(), options, &InvalidationBus::default());

    let stream = manager.observe("n", 1, ());
    assert_eq!(stream.first().await, Ok(42));
    manager.settled().await;

    let key = CacheKey::from("n");
    assert!(storage.get(&key).await.unwrap().is_some());

    clock.set(1001);
    assert_eq!(storage.get(&key).await.unwrap(), None);
}
