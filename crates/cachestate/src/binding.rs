//! Wrappers that put cached operations and their invalidation signals behind plain functions.
//!
//! - A [`CachedOperation`] derives a [`CacheKey`] from the arguments of each call and looks it up
//!   in its own [`CacheManager`].
//! - A [`Signaler`] wraps some other operation and publishes a signal to a [`Notifier`] whenever
//!   that operation is called. Managers configured with the same notifier react to it by
//!   invalidating (and possibly refreshing) the signaled key, or all of their keys.
//!
//! A [`CacheFactory`] holds the defaults shared by all bindings of an application, together with
//! the [`InvalidationBus`] they communicate over.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bus::{InvalidationBus, Notifier, Signal};
use crate::caching::{
    CacheEntry, CacheKey, CacheManager, CacheOptions, CacheStream, CallSite, ConfigError,
    args_suffix,
};
use crate::config::Config;

/// Derives the complete key of a call.
pub type KeyGenerator<A> = Arc<dyn Fn(&A, &CallSite) -> CacheKey + Send + Sync>;

/// Derives the prefix or the suffix of a key.
pub type KeyPartGenerator<A> = Arc<dyn Fn(&A, &CallSite) -> String + Send + Sync>;

/// Derives the key a [`Signaler`] publishes, or `None` to address every key.
pub type SignalKeyGenerator<A> = Arc<dyn Fn(&A, &CallSite) -> Signal + Send + Sync>;

/// How a [`CachedOperation`] turns call arguments into a [`CacheKey`].
pub enum KeyStrategy<A> {
    /// `<identity>#<operation>_<JSON of args>`, see [`CacheKey::from_args`].
    Standard,
    /// A custom function computes the whole key.
    Generator(KeyGenerator<A>),
    /// `<prefix>_<suffix>`, where either part falls back to its standard form.
    Parts {
        prefix: Option<KeyPartGenerator<A>>,
        suffix: Option<KeyPartGenerator<A>>,
    },
}

impl<A> Default for KeyStrategy<A> {
    fn default() -> Self {
        KeyStrategy::Standard
    }
}

impl<A> Clone for KeyStrategy<A> {
    fn clone(&self) -> Self {
        match self {
            KeyStrategy::Standard => KeyStrategy::Standard,
            KeyStrategy::Generator(generator) => KeyStrategy::Generator(Arc::clone(generator)),
            KeyStrategy::Parts { prefix, suffix } => KeyStrategy::Parts {
                prefix: prefix.clone(),
                suffix: suffix.clone(),
            },
        }
    }
}

impl<A> fmt::Debug for KeyStrategy<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Standard => f.write_str("Standard"),
            KeyStrategy::Generator(_) => f.write_str("Generator"),
            KeyStrategy::Parts { prefix, suffix } => f
                .debug_struct("Parts")
                .field("prefix", &prefix.is_some())
                .field("suffix", &suffix.is_some())
                .finish(),
        }
    }
}

impl<A: Serialize> KeyStrategy<A> {
    pub fn derive(&self, args: &A, site: &CallSite) -> CacheEntry<CacheKey> {
        match self {
            KeyStrategy::Standard => CacheKey::from_args(site, args),
            KeyStrategy::Generator(generator) => Ok(generator(args, site)),
            KeyStrategy::Parts { prefix, suffix } => {
                let prefix = match prefix {
                    Some(prefix) => prefix(args, site),
                    None => site.prefix(),
                };
                let suffix = match suffix {
                    Some(suffix) => suffix(args, site),
                    None => args_suffix(args)?,
                };
                Ok(CacheKey::from(format!("{prefix}_{suffix}")))
            }
        }
    }
}

/// An operation whose results are cached per derived key.
pub struct CachedOperation<T, A = (), C = ()> {
    site: CallSite,
    keys: KeyStrategy<A>,
    manager: CacheManager<T, A, C>,
}

impl<T, A, C> fmt::Debug for CachedOperation<T, A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedOperation")
            .field("site", &self.site)
            .field("keys", &self.keys)
            .field("manager", &self.manager)
            .finish()
    }
}

impl<T, A, C> CachedOperation<T, A, C>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    A: Serialize + Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        site: CallSite,
        producer: F,
        options: CacheOptions,
        bus: &InvalidationBus,
    ) -> Self
    where
        F: Fn(A, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let manager = CacheManager::new(site.to_string(), producer, options, bus);
        Self {
            site,
            keys: KeyStrategy::Standard,
            manager,
        }
    }

    pub fn with_key_strategy(mut self, keys: KeyStrategy<A>) -> Self {
        self.keys = keys;
        self
    }

    pub fn site(&self) -> &CallSite {
        &self.site
    }

    /// The key a call with `args` is cached under.
    pub fn key_for(&self, args: &A) -> CacheEntry<CacheKey> {
        self.keys.derive(args, &self.site)
    }

    /// Subscribes to the results of a call.
    ///
    /// Fails only if no key can be derived from `args`.
    pub fn call(&self, args: A, context: C) -> CacheEntry<CacheStream<T>> {
        let key = self.key_for(&args)?;
        Ok(self.manager.observe(key, args, context))
    }

    /// Calls the operation and waits for its first result.
    pub async fn get(&self, args: A, context: C) -> CacheEntry<T> {
        self.call(args, context)?.first().await
    }

    pub fn manager(&self) -> &CacheManager<T, A, C> {
        &self.manager
    }

    pub async fn shutdown(self) {
        self.manager.shutdown().await
    }
}

/// The notifier a [`Signaler`] publishes to, and how it derives the signaled key.
pub struct SignalOptions<A> {
    /// Publish to this notifier.
    pub notifier: Option<Notifier>,
    /// Publish to the bus notifier with this name.
    pub notifier_key: Option<String>,
    /// Derives the signaled key. Without one, every signal addresses all keys.
    pub key_generator: Option<SignalKeyGenerator<A>>,
}

impl<A> Default for SignalOptions<A> {
    fn default() -> Self {
        Self {
            notifier: None,
            notifier_key: None,
            key_generator: None,
        }
    }
}

impl<A> SignalOptions<A> {
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_notifier_key(mut self, key: impl Into<String>) -> Self {
        self.notifier_key = Some(key.into());
        self
    }

    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&A, &CallSite) -> Signal + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }
}

/// Publishes a signal every time the operation it wraps is called.
///
/// An *invalidator* is meant for notifiers that cause an invalidation, an *updater* for ones that
/// cause an invalidation followed by a refresh. Which of the two actually happens is decided by
/// how the listening managers are configured.
pub struct Signaler<A> {
    kind: &'static str,
    site: CallSite,
    notifier: Notifier,
    key_generator: Option<SignalKeyGenerator<A>>,
}

impl<A> fmt::Debug for Signaler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signaler")
            .field("kind", &self.kind)
            .field("site", &self.site)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

impl<A> Signaler<A> {
    pub fn invalidator(
        site: CallSite,
        options: SignalOptions<A>,
        bus: &InvalidationBus,
    ) -> Result<Self, ConfigError> {
        Self::build("invalidator", site, options, bus)
    }

    pub fn updater(
        site: CallSite,
        options: SignalOptions<A>,
        bus: &InvalidationBus,
    ) -> Result<Self, ConfigError> {
        Self::build("updater", site, options, bus)
    }

    fn build(
        kind: &'static str,
        site: CallSite,
        options: SignalOptions<A>,
        bus: &InvalidationBus,
    ) -> Result<Self, ConfigError> {
        let notifier = match (options.notifier, options.notifier_key) {
            (Some(notifier), None) => notifier,
            (None, Some(key)) => bus.notifier(&key),
            (None, None) => return Err(ConfigError::MissingNotifier(kind)),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingNotifier(kind)),
        };

        Ok(Self {
            kind,
            site,
            notifier,
            key_generator: options.key_generator,
        })
    }

    /// The signal a call with `args` publishes.
    pub fn key_for(&self, args: &A) -> Signal {
        self.key_generator
            .as_ref()
            .and_then(|generator| generator(args, &self.site))
    }

    fn publish(&self, key: Signal) {
        tracing::trace!(
            kind = self.kind,
            site = %self.site,
            key = key.as_ref().map(CacheKey::as_str),
            "Publishing signal"
        );
        self.notifier.notify(key);
    }

    /// Wraps a synchronous operation.
    ///
    /// The key is derived from the arguments before the operation runs, the signal is published
    /// right after it returns.
    pub fn wrap<F, R>(self, op: F) -> impl Fn(A) -> R
    where
        F: Fn(A) -> R,
    {
        move |args| {
            let key = self.key_for(&args);
            let result = op(args);
            self.publish(key);
            result
        }
    }

    /// Wraps an asynchronous operation.
    ///
    /// The signal is published once the returned future completes.
    pub fn wrap_async<F, Fut>(self, op: F) -> impl Fn(A) -> BoxFuture<'static, Fut::Output>
    where
        A: 'static,
        F: Fn(A) -> Fut,
        Fut: Future + Send + 'static,
    {
        let this = Arc::new(self);
        move |args| {
            let key = this.key_for(&args);
            let operation = op(args);
            let this = Arc::clone(&this);
            async move {
                let result = operation.await;
                this.publish(key);
                result
            }
            .boxed()
        }
    }
}

/// Creates bindings that share one [`InvalidationBus`] and one set of default [`CacheOptions`].
#[derive(Debug, Clone, Default)]
pub struct CacheFactory {
    bus: InvalidationBus,
    defaults: CacheOptions,
}

impl CacheFactory {
    pub fn new(bus: InvalidationBus, defaults: CacheOptions) -> Self {
        Self { bus, defaults }
    }

    /// Creates a factory with a fresh bus, using the `cache` section of `config` as defaults.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bus: InvalidationBus::new(config.cache.notifier_capacity),
            defaults: CacheOptions::from_config(config.cache.clone()),
        }
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    /// A copy of the defaults, to be adjusted for a single binding.
    pub fn options(&self) -> CacheOptions {
        self.defaults.clone()
    }

    /// Creates a cached operation using the defaults.
    pub fn cached<T, A, C, F, Fut>(
        &self,
        site: CallSite,
        producer: F,
    ) -> CachedOperation<T, A, C>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(A, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.cached_with(site, producer, self.options())
    }

    /// Creates a cached operation with options derived from [`options`](Self::options).
    pub fn cached_with<T, A, C, F, Fut>(
        &self,
        site: CallSite,
        producer: F,
        options: CacheOptions,
    ) -> CachedOperation<T, A, C>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        A: Serialize + Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(A, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        CachedOperation::new(site, producer, options, &self.bus)
    }

    pub fn invalidator<A>(
        &self,
        site: CallSite,
        options: SignalOptions<A>,
    ) -> Result<Signaler<A>, ConfigError> {
        Signaler::invalidator(site, options, &self.bus)
    }

    pub fn updater<A>(
        &self,
        site: CallSite,
        options: SignalOptions<A>,
    ) -> Result<Signaler<A>, ConfigError> {
        Signaler::updater(site, options, &self.bus)
    }
}
