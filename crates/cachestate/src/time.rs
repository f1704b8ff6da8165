//! Time sources used to judge the age of persisted records.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Supplies the current time to the entry stores and the cache manager.
pub trait TimestampProvider: fmt::Debug + Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Reads the wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimestampProvider;

impl TimestampProvider for SystemTimestampProvider {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give another to the cache.
#[derive(Debug, Clone, Default)]
pub struct ManualTimestampProvider {
    now: Arc<AtomicI64>,
}

impl ManualTimestampProvider {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimestampProvider for ManualTimestampProvider {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// The provider used when none is configured.
pub fn default_provider() -> Arc<dyn TimestampProvider> {
    Arc::new(SystemTimestampProvider)
}
