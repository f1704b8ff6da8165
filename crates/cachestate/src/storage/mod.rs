//! Pluggable persistence for cache records.
//!
//! A [`CacheDataStorage`] holds at most one [`CacheRecord`] per [`CacheKey`]. Stores are shared
//! between all keys of a manager, and possibly between several managers, so every implementation
//! must tolerate interleaved calls for different keys.
//!
//! Three interchangeable implementations exist:
//!
//! - [`LocalCacheDataStorage`]: a plain in-memory table. Staleness is judged by the caller.
//! - [`PurgingCacheDataStorage`]: an in-memory table that drops every outdated record on each
//!   access.
//! - [`KeyValueCacheDataStorage`]: keeps all records as one JSON document under a single root key
//!   of a host [`KeyValueStore`], and drops outdated records on each access as well.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::caching::{CacheEntry, CacheKey};
use crate::time::Timestamp;

mod kv;
mod memory;

pub use kv::{
    FilesystemKeyValueStore, KeyValueCacheDataStorage, KeyValueStore, MemoryKeyValueStore,
    DEFAULT_ROOT_KEY,
};
pub use memory::{LocalCacheDataStorage, PurgingCacheDataStorage};

/// A persisted result together with the metadata needed to judge its age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub data: serde_json::Value,
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
    #[serde(rename = "maxAgeMS")]
    pub max_age_ms: u64,
}

impl CacheRecord {
    pub fn new(data: serde_json::Value, created_at: Timestamp, max_age_ms: u64) -> Self {
        Self {
            data,
            created_at,
            max_age_ms,
        }
    }

    /// A record is outdated once `created_at + max_age_ms` lies strictly before `now`.
    pub fn is_outdated(&self, now: Timestamp) -> bool {
        let max_age = i64::try_from(self.max_age_ms).unwrap_or(i64::MAX);
        self.created_at.saturating_add(max_age) < now
    }
}

/// Asynchronous key to record persistence.
///
/// None of the operations may fail because a key is missing: `get` returns `None`, and
/// `remove_many` ignores keys that do not exist.
#[async_trait]
pub trait CacheDataStorage: fmt::Debug + Send + Sync {
    /// Inserts `record`, unconditionally replacing any previous record for `key`.
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry;

    /// Returns the record for `key` as it was stored.
    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>>;

    /// Removes the records of all `keys`.
    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry;
}
