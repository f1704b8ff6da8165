//! Caching of computed results, keyed by [`CacheKey`].
//!
//! The central type is the [`CacheManager`]: it runs a producer on behalf of observers, persists
//! the results in a [`CacheDataStorage`](crate::storage::CacheDataStorage) and publishes them on a
//! per-key [`CacheStream`]. Persisted results expire once they are older than the configured max
//! age, and can be invalidated explicitly through the [`InvalidationBus`](crate::bus::InvalidationBus).
//!
//! # Lifetime of a key
//!
//! A key starts being tracked when it is first observed. Tracking captures the arguments and
//! context of that first call; every refresh of the key runs the producer with them.
//!
//! While tracked, a key owns a replay channel. Every observer gets the latest result on
//! subscription and then each new one. The key stays tracked as long as at least one
//! [`CacheStream`] for it is alive. Once the last one is dropped, the key is evicted by the next
//! `observe` call for any other key or by the next invalidation, together with its persisted
//! record.
//!
//! # Refreshes
//!
//! A key is refreshed when it is observed without a fresh persisted record, or when it is
//! invalidated with an update. Refreshes of one key are throttled to one per
//! [`DEFAULT_REFRESH_THROTTLE`] (configurable): the first request in a window starts the producer,
//! the others are dropped.

mod cache_error;
mod cache_key;
mod manager;
mod replay;
mod throttle;

pub use cache_error::{CacheEntry, CacheError, ConfigError};
pub use cache_key::{CacheKey, CacheKeyBuilder, CallSite, args_suffix};
pub use manager::{CacheManager, CacheOptions, ProducerFn};
pub use replay::CacheStream;
pub use throttle::DEFAULT_REFRESH_THROTTLE;
