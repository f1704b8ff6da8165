use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::caching::{CacheEntry, CacheError, CacheKey};
use crate::time::TimestampProvider;

use super::{CacheDataStorage, CacheRecord};

/// The root key under which [`KeyValueCacheDataStorage`] keeps its records by default.
pub const DEFAULT_ROOT_KEY: &str = "cachestate";

/// A host key/value storage API holding string values, such as a browser-style storage area or
/// a directory of small files.
#[async_trait]
pub trait KeyValueStore: std::fmt::Debug + Send + Sync {
    async fn get_item(&self, key: &str) -> CacheEntry<Option<String>>;

    async fn set_item(&self, key: &str, value: String) -> CacheEntry;
}

/// A [`KeyValueStore`] living in process memory.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> CacheEntry<Option<String>> {
        Ok(self.items.lock().unwrap().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> CacheEntry {
        self.items.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }
}

/// A [`KeyValueStore`] that keeps every item in its own file inside a directory.
///
/// Items are replaced atomically by writing a temporary file next to the target and renaming it.
#[derive(Debug, Clone)]
pub struct FilesystemKeyValueStore {
    dir: PathBuf,
}

impl FilesystemKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_path_segment(key)))
    }
}

#[async_trait]
impl KeyValueStore for FilesystemKeyValueStore {
    async fn get_item(&self, key: &str) -> CacheEntry<Option<String>> {
        match tokio::fs::read_to_string(self.item_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> CacheEntry {
        let dir = self.dir.clone();
        let path = self.item_path(key);

        tokio::task::spawn_blocking(move || persist_item(&dir, &path, value.as_bytes()))
            .await
            .map_err(CacheError::from_std_error)??;
        Ok(())
    }
}

fn persist_item(dir: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(contents)?;
    temp_file.as_file().sync_data()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Replaces everything but ASCII alphanumerics, `-` and `_` with `_`.
fn safe_path_segment(s: &str) -> String {
    s.replace(
        |c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        "_",
    )
}

type StoredRecords = BTreeMap<String, Option<CacheRecord>>;

/// Keeps all records as one JSON object under a single root key of a [`KeyValueStore`].
///
/// Outdated records are dropped on every access. Content under the root key that cannot be
/// parsed is treated as an empty mapping and overwritten by the next write.
#[derive(Debug)]
pub struct KeyValueCacheDataStorage<S> {
    host: S,
    root_key: String,
    timestamps: Arc<dyn TimestampProvider>,
    /// Serializes the read-modify-write cycles against the host.
    lock: tokio::sync::Mutex<()>,
}

impl<S: KeyValueStore> KeyValueCacheDataStorage<S> {
    pub fn new(host: S, timestamps: Arc<dyn TimestampProvider>) -> Self {
        Self::with_root_key(host, DEFAULT_ROOT_KEY, timestamps)
    }

    pub fn with_root_key(
        host: S,
        root_key: impl Into<String>,
        timestamps: Arc<dyn TimestampProvider>,
    ) -> Self {
        Self {
            host,
            root_key: root_key.into(),
            timestamps,
            lock: Default::default(),
        }
    }

    pub fn host(&self) -> &S {
        &self.host
    }

    /// Loads the mapping and drops outdated records.
    ///
    /// Also returns whether anything was dropped, so read-only accesses can write back.
    async fn load(&self) -> CacheEntry<(StoredRecords, bool)> {
        let raw = self.host.get_item(&self.root_key).await?;
        let mut records = match raw {
            None => StoredRecords::new(),
            Some(raw) => match serde_json::from_str::<StoredRecords>(&raw) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        root_key = %self.root_key,
                        "Discarding unreadable persisted cache records",
                    );
                    StoredRecords::new()
                }
            },
        };

        let now = self.timestamps.now();
        let before = records.len();
        records.retain(|_, record| matches!(record, Some(record) if !record.is_outdated(now)));
        let purged = records.len() != before;

        Ok((records, purged))
    }

    async fn save(&self, records: &StoredRecords) -> CacheEntry {
        let raw = serde_json::to_string(records)?;
        self.host.set_item(&self.root_key, raw).await
    }
}

#[async_trait]
impl<S: KeyValueStore> CacheDataStorage for KeyValueCacheDataStorage<S> {
    async fn store(&self, key: &CacheKey, record: CacheRecord) -> CacheEntry {
        let _guard = self.lock.lock().await;

        let (mut records, _) = self.load().await?;
        records.insert(key.to_string(), Some(record));
        self.save(&records).await
    }

    async fn get(&self, key: &CacheKey) -> CacheEntry<Option<CacheRecord>> {
        let _guard = self.lock.lock().await;

        let (records, purged) = self.load().await?;
        if purged {
            self.save(&records).await?;
        }
        Ok(records.get(key.as_str()).cloned().flatten())
    }

    async fn remove_many(&self, keys: &[CacheKey]) -> CacheEntry {
        let _guard = self.lock.lock().await;

        let (mut records, _) = self.load().await?;
        for key in keys {
            records.remove(key.as_str());
        }
        self.save(&records).await
    }
}
