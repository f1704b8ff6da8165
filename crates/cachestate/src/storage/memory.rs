use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::caching::{CacheEntry, CacheKey};
use crate::time::TimestampProvider;

use super::{CacheDataStorage, CacheRecord};

/// An in-memory record table without any cleanup of its own.
///
/// This is the store used when none is configured.
#[derive(Debug, Default)]
pub struct LocalCacheDataStorage {
    records: Mutex<HashMap<CacheKey, CacheRecord>>,
}

impl LocalCacheDataStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheDataStorage for LocalCacheDataStorage {
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry {
        self.records.lock().unwrap().insert(key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry {
        let mut records = self.records.lock().unwrap();
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }
}

/// An in-memory record table that drops all outdated records before every operation.
#[derive(Debug)]
pub struct PurgingCacheDataStorage {
    records: Mutex<HashMap<CacheKey, CacheRecord>>,
    timestamps: Arc<dyn TimestampProvider>,
}

impl PurgingCacheDataStorage {
    pub fn new(timestamps: Arc<dyn TimestampProvider>) -> Self {
        Self {
            records: Default::default(),
            timestamps,
        }
    }

    fn purged(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheRecord>> {
        let now = self.timestamps.now();
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, record| !record.is_outdated(now));

        let purged = before - records.len();
        if purged > 0 {
            tracing::trace!(purged, "Dropped outdated records");
        }
        records
    }
}

#[async_trait]
impl CacheDataStorage for PurgingCacheDataStorage {
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry {
        self.purged().insert(key.clone(), record);
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>> {
        Ok(self.purged().get(key).cloned())
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry {
        let mut records = self.purged();
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }
}
