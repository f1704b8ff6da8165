//! An asynchronous, key-addressed result cache.
//!
//! A [`CacheManager`] wraps a producer, an async function computing some value. Observers ask for
//! the value under a [`CacheKey`] and receive a [`CacheStream`] that replays the latest result
//! and follows every refresh of the key. Results are persisted in a pluggable
//! [`CacheDataStorage`](storage::CacheDataStorage) and reused until they expire or are
//! invalidated through an [`InvalidationBus`].
//!
//! The [`binding`] module puts the manager behind plain functions, deriving keys from call
//! arguments and publishing invalidation signals when other operations run.

#[macro_use]
pub mod metrics;

pub mod binding;
pub mod bus;
pub mod caching;
pub mod config;
pub mod logging;
pub mod producer;
pub mod storage;
pub mod time;
pub mod utils;

pub use binding::{CacheFactory, CachedOperation, Signaler};
pub use bus::{InvalidationBus, Notifier};
pub use caching::{CacheEntry, CacheError, CacheKey, CacheManager, CacheOptions, CacheStream};
