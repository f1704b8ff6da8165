use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bus::{InvalidationBus, Notifier, Signal};
use crate::config::CacheConfig;
use crate::storage::{CacheDataStorage, CacheRecord, LocalCacheDataStorage};
use crate::time::{self, TimestampProvider};
use crate::utils::PendingTasks;

use super::replay::{CacheStream, ReplaySender};
use super::throttle::RefreshThrottle;
use super::{CacheError, CacheKey};

/// The function a [`CacheManager`] caches the results of.
pub type ProducerFn<T, A, C> =
    Arc<dyn Fn(A, C) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Everything a [`CacheManager`] needs apart from its producer.
#[derive(Clone)]
pub struct CacheOptions {
    pub config: CacheConfig,
    /// Where results are persisted. Defaults to a [`LocalCacheDataStorage`].
    pub storage: Arc<dyn CacheDataStorage>,
    /// The clock records are created and judged with. Defaults to the wall clock.
    pub timestamps: Arc<dyn TimestampProvider>,
    /// Signals on this notifier invalidate and refresh keys.
    pub updated_notifier: Option<Notifier>,
    /// Signals on this notifier invalidate keys.
    pub invalidated_notifier: Option<Notifier>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_config(CacheConfig::default())
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .field("timestamps", &self.timestamps)
            .field("updated_notifier", &self.updated_notifier.is_some())
            .field("invalidated_notifier", &self.invalidated_notifier.is_some())
            .finish()
    }
}

impl CacheOptions {
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            storage: Arc::new(LocalCacheDataStorage::new()),
            timestamps: time::default_provider(),
            updated_notifier: None,
            invalidated_notifier: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn CacheDataStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_timestamps(mut self, timestamps: Arc<dyn TimestampProvider>) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_updated_notifier(mut self, notifier: Notifier) -> Self {
        self.updated_notifier = Some(notifier);
        self
    }

    pub fn with_invalidated_notifier(mut self, notifier: Notifier) -> Self {
        self.invalidated_notifier = Some(notifier);
        self
    }
}

/// In-memory bookkeeping for one tracked key.
struct LiveState<T, A, C> {
    /// The arguments and context of the call that started tracking this key.
    ///
    /// Every refresh of the key reuses them, including refreshes triggered by invalidation.
    args: A,
    context: C,
    channel: Arc<ReplaySender<T>>,
    throttle: RefreshThrottle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalKind {
    Invalidate,
    Update,
}

impl SignalKind {
    fn as_str(self) -> &'static str {
        match self {
            SignalKind::Invalidate => "invalidate",
            SignalKind::Update => "update",
        }
    }
}

struct Shared<T, A, C> {
    name: Arc<str>,
    states: Mutex<HashMap<CacheKey, LiveState<T, A, C>>>,
    storage: Arc<dyn CacheDataStorage>,
    timestamps: Arc<dyn TimestampProvider>,
    producer: ProducerFn<T, A, C>,
    max_age_ms: u64,
    refresh_throttle: Duration,
    pending: Arc<PendingTasks>,
}

/// Caches the results of a producer per [`CacheKey`].
///
/// For every key that is being observed, the manager keeps a replay-of-latest result channel.
/// Results are persisted in the configured [`CacheDataStorage`] and reused until they are older
/// than the configured max age, or until they are invalidated.
///
/// Refreshes are spawned in the background and throttled per key: at most one producer run starts
/// within each throttle window, additional requests in that window are dropped. A refresh that
/// is already running is never cancelled. When it completes after a later invalidation, its
/// result still overwrites the persisted record and is emitted; the last write wins.
///
/// Keys nobody observes anymore are evicted together with their persisted record. This happens
/// on every [`observe`](Self::observe) (sparing the key being observed) and before every
/// invalidation.
///
/// The manager listens to the global channels of its [`InvalidationBus`] and to the notifiers
/// configured in its [`CacheOptions`] until it is dropped or [shut down](Self::shutdown).
pub struct CacheManager<T, A = (), C = ()> {
    shared: Arc<Shared<T, A, C>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, A, C> fmt::Debug for CacheManager<T, A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self
            .shared
            .states
            .try_lock()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("CacheManager")
            .field("name", &self.shared.name)
            .field("tracked keys", &tracked)
            .field("pending tasks", &self.shared.pending.count())
            .field("storage", &self.shared.storage)
            .finish()
    }
}

impl<T, A, C> CacheManager<T, A, C>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    /// Creates a manager and subscribes it to `bus` and to the notifiers in `options`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(
        name: impl Into<Arc<str>>,
        producer: F,
        options: CacheOptions,
        bus: &InvalidationBus,
    ) -> Self
    where
        F: Fn(A, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let producer: ProducerFn<T, A, C> =
            Arc::new(move |args: A, context: C| producer(args, context).boxed());
        let shared = Arc::new(Shared {
            name: name.into(),
            states: Default::default(),
            storage: options.storage,
            timestamps: options.timestamps,
            producer,
            max_age_ms: options.config.max_age_ms,
            refresh_throttle: options.config.refresh_throttle,
            pending: Default::default(),
        });

        let config = &options.config;
        let mut listeners = Vec::new();
        let mut listen = |notifier: &Notifier, kind, only_specific| {
            listeners.push(spawn_listener(
                Arc::downgrade(&shared),
                notifier,
                kind,
                only_specific,
            ));
        };

        listen(
            bus.invalidate_all_channel(),
            SignalKind::Invalidate,
            config.invalidate_only_specific,
        );
        listen(
            bus.update_all_channel(),
            SignalKind::Update,
            config.update_only_specific,
        );

        let updated = options
            .updated_notifier
            .iter()
            .cloned()
            .chain(config.updated_notifier_key.iter().map(|k| bus.notifier(k)));
        for notifier in updated {
            listen(&notifier, SignalKind::Update, config.update_only_specific);
        }

        let invalidated = options
            .invalidated_notifier
            .iter()
            .cloned()
            .chain(config.invalidated_notifier_key.iter().map(|k| bus.notifier(k)));
        for notifier in invalidated {
            listen(
                &notifier,
                SignalKind::Invalidate,
                config.invalidate_only_specific,
            );
        }

        tracing::debug!(
            name = %shared.name,
            listeners = listeners.len(),
            "Created cache manager"
        );

        Self {
            shared,
            listeners: Mutex::new(listeners),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Subscribes to the results for `key`.
    ///
    /// The first call for a key starts tracking it with the given `args` and `context`; later
    /// calls for the same key reuse the ones captured first. In the background, the persisted
    /// record is checked: a missing or outdated record schedules a refresh, a fresh one is
    /// replayed if this key has no value in memory yet.
    pub fn observe(&self, key: impl Into<CacheKey>, args: A, context: C) -> CacheStream<T> {
        self.shared.observe(key.into(), args, context)
    }

    /// Purges the persisted record of `key` and refreshes it, or does so for every tracked key.
    ///
    /// Keys nobody observes are evicted first. A key without live state is purged but not
    /// refreshed.
    pub async fn invalidate_and_update(&self, key: Option<CacheKey>) {
        self.shared.invalidate(key, SignalKind::Update).await
    }

    /// Purges the persisted record of `key`, or of every tracked key, without refreshing.
    ///
    /// Current observers keep the last value; the next lookup recomputes it.
    pub async fn invalidate(&self, key: Option<CacheKey>) {
        self.shared.invalidate(key, SignalKind::Invalidate).await
    }

    /// Evicts every key without observers, returning how many were evicted.
    pub async fn evict_unobserved(&self) -> usize {
        let evicted = self.shared.take_unobserved(None);
        self.shared.purge_records(&evicted).await;
        evicted.len()
    }

    /// The keys that currently have live state, sorted.
    pub fn tracked_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.shared.states.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The number of live subscriptions to `key`.
    pub fn observer_count(&self, key: &str) -> usize {
        self.shared
            .states
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |state| state.channel.observer_count())
    }

    /// Waits until no lookup or refresh is running in the background.
    pub async fn settled(&self) {
        self.shared.pending.wait_idle().await
    }

    /// Unsubscribes from all notifiers and waits for the listeners to stop.
    pub async fn shutdown(self) {
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap());
        for listener in &listeners {
            listener.abort();
        }
        for listener in listeners {
            // the listener was aborted, a cancellation error is expected here
            let _ = listener.await;
        }
        tracing::debug!(name = %self.shared.name, "Shut down cache manager");
    }
}

impl<T, A, C> Drop for CacheManager<T, A, C> {
    fn drop(&mut self) {
        let listeners = match self.listeners.get_mut() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners.drain(..) {
            listener.abort();
        }
    }
}

impl<T, A, C> Shared<T, A, C>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    fn observe(self: &Arc<Self>, key: CacheKey, args: A, context: C) -> CacheStream<T> {
        let name = &*self.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let (stream, evicted) = {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(key.clone()).or_insert_with(|| {
                tracing::trace!(cache = name, %key, "Tracking key");
                LiveState {
                    args,
                    context,
                    channel: Arc::new(ReplaySender::new()),
                    throttle: RefreshThrottle::new(self.refresh_throttle),
                }
            });
            let stream = state.channel.subscribe();
            let evicted = evict_from(name, &mut states, Some(&key));
            (stream, evicted)
        };

        let this = Arc::clone(self);
        let done_token = self.pending.track();
        tokio::spawn(async move {
            let _done_token = done_token; // move into the future
            this.purge_records(&evicted).await;
            this.refresh_if_outdated(&key).await;
        });

        stream
    }

    async fn invalidate(self: &Arc<Self>, key: Option<CacheKey>, kind: SignalKind) {
        let name = &*self.name;
        metric!(counter("caches.invalidation") += 1, "cache" => name, "kind" => kind.as_str());

        let (mut purge, targets) = {
            let mut states = self.states.lock().unwrap();
            let evicted = evict_from(name, &mut states, None);
            let targets: Vec<_> = match key {
                Some(key) => vec![key],
                None => states.keys().cloned().collect(),
            };
            (evicted, targets)
        };

        tracing::debug!(
            cache = name,
            kind = kind.as_str(),
            keys = targets.len(),
            "Invalidating keys"
        );

        purge.extend(targets.iter().cloned());
        self.purge_records(&purge).await;

        if kind == SignalKind::Update {
            for key in &targets {
                self.request_refresh(key);
            }
        }
    }

    fn take_unobserved(&self, except: Option<&CacheKey>) -> Vec<CacheKey> {
        let mut states = self.states.lock().unwrap();
        evict_from(&self.name, &mut states, except)
    }

    /// Removes the persisted records of `keys`, logging failures.
    async fn purge_records(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        if let Err(e) = self.storage.remove_many(keys).await {
            metric!(counter("caches.storage.error") += 1, "cache" => &*self.name, "op" => "remove");
            tracing::error!(
                error = &e as &dyn std::error::Error,
                cache = %self.name,
                keys = keys.len(),
                "Failed to remove cache records",
            );
        }
    }

    async fn refresh_if_outdated(self: &Arc<Self>, key: &CacheKey) {
        let record = match self.storage.get(key).await {
            Ok(record) => record,
            Err(e) => {
                metric!(counter("caches.storage.error") += 1, "cache" => &*self.name, "op" => "get");
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    cache = %self.name,
                    %key,
                    "Failed to read cache record, treating it as missing",
                );
                None
            }
        };

        match record {
            Some(record) if !record.is_outdated(self.timestamps.now()) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => &*self.name);
                self.restore(key, record);
            }
            _ => {
                self.request_refresh(key);
            }
        }
    }

    /// Emits a fresh persisted record, unless the key already has a value in memory.
    fn restore(self: &Arc<Self>, key: &CacheKey, record: CacheRecord) {
        let restored = {
            let states = self.states.lock().unwrap();
            let Some(state) = states.get(key) else {
                return;
            };
            if state.channel.is_populated() {
                return;
            }
            match serde_json::from_value::<T>(record.data) {
                Ok(value) => {
                    tracing::trace!(cache = %self.name, %key, "Restoring persisted value");
                    state.channel.emit(value);
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        cache = %self.name,
                        %key,
                        "Persisted value is unreadable, refreshing",
                    );
                    false
                }
            }
        };

        if !restored {
            self.request_refresh(key);
        }
    }

    /// Spawns a refresh of `key` unless it is untracked or throttled.
    fn request_refresh(self: &Arc<Self>, key: &CacheKey) -> bool {
        let (args, context, channel) = {
            let mut states = self.states.lock().unwrap();
            let Some(state) = states.get_mut(key) else {
                tracing::trace!(cache = %self.name, %key, "Skipping refresh of untracked key");
                return false;
            };
            if !state.throttle.try_acquire() {
                metric!(counter("caches.refresh.throttled") += 1, "cache" => &*self.name);
                tracing::trace!(
                    cache = %self.name,
                    %key,
                    dropped = state.throttle.dropped(),
                    "Dropping throttled refresh request"
                );
                return false;
            }
            (
                state.args.clone(),
                state.context.clone(),
                Arc::downgrade(&state.channel),
            )
        };

        tracing::debug!(cache = %self.name, %key, "Spawning refresh");

        let this = Arc::clone(self);
        let key = key.clone();
        let done_token = self.pending.track();
        tokio::spawn(async move {
            let _done_token = done_token;
            this.refresh(key, args, context, channel).await;
        });
        true
    }

    async fn refresh(&self, key: CacheKey, args: A, context: C, channel: Weak<ReplaySender<T>>) {
        let name = &*self.name;
        metric!(counter("caches.computation") += 1, "cache" => name);

        let producer = Arc::clone(&self.producer);
        let result = AssertUnwindSafe(async move { producer(args, context).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("producer panicked")));

        let Some(channel) = channel.upgrade() else {
            tracing::debug!(cache = name, %key, "Discarding refresh result of evicted key");
            return;
        };

        match result {
            Ok(value) => {
                self.persist(&key, &value).await;
                match self.is_current(&key, &channel) {
                    Some(true) => channel.emit(value),
                    // tracked again, the new state owns the record
                    Some(false) => {}
                    None => {
                        // evicted while the record was written, its purge may have run already
                        tracing::debug!(cache = name, %key, "Discarding refresh result of evicted key");
                        self.purge_records(std::slice::from_ref(&key)).await;
                    }
                }
            }
            Err(err) => {
                let error = CacheError::from_producer_error(&err);
                metric!(counter("caches.computation.failed") += 1, "cache" => name);
                tracing::debug!(cache = name, %key, %error, "Refresh failed");
                channel.fail(error);
            }
        }
    }

    /// Whether `key` is still tracked with `channel`, or `None` if it is not tracked at all.
    fn is_current(&self, key: &CacheKey, channel: &Arc<ReplaySender<T>>) -> Option<bool> {
        let states = self.states.lock().unwrap();
        states
            .get(key)
            .map(|state| Arc::ptr_eq(&state.channel, channel))
    }

    /// Writes a freshly produced value to the entry store.
    ///
    /// Failures are logged and leave the key without a persisted record.
    async fn persist(&self, key: &CacheKey, value: &T) {
        let result = match serde_json::to_value(value) {
            Ok(data) => {
                let record = CacheRecord::new(data, self.timestamps.now(), self.max_age_ms);
                self.storage.store(key, record).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            metric!(
                counter("caches.storage.error") += 1,
                "cache" => &*self.name,
                "op" => "store",
                "error" => e.metrics_tag(),
            );
            tracing::error!(
                error = &e as &dyn std::error::Error,
                cache = %self.name,
                %key,
                "Failed to persist refreshed value",
            );
        }
    }
}

/// Removes all states without observers, except `except`, and returns their keys.
///
/// Dropping a state completes its result channel.
fn evict_from<T: Clone, A, C>(
    name: &str,
    states: &mut HashMap<CacheKey, LiveState<T, A, C>>,
    except: Option<&CacheKey>,
) -> Vec<CacheKey> {
    let unobserved: Vec<_> = states
        .iter()
        .filter(|(key, state)| Some(*key) != except && state.channel.observer_count() == 0)
        .map(|(key, _)| key.clone())
        .collect();

    for key in &unobserved {
        states.remove(key);
        tracing::trace!(cache = name, %key, "Evicted unobserved key");
    }
    if !unobserved.is_empty() {
        metric!(counter("caches.eviction") += unobserved.len() as i64, "cache" => name);
    }
    metric!(gauge("caches.tracked") = states.len() as u64, "cache" => name);

    unobserved
}

fn spawn_listener<T, A, C>(
    shared: Weak<Shared<T, A, C>>,
    notifier: &Notifier,
    kind: SignalKind,
    only_specific: bool,
) -> JoinHandle<()>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            let signal: Signal = match rx.recv().await {
                Ok(signal) => signal,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, kind = kind.as_str(), "Invalidation listener lagged");
                    None
                }
                Err(RecvError::Closed) => break,
            };
            if signal.is_none() && only_specific {
                continue;
            }

            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.invalidate(signal, kind).await;
        }
    })
}
