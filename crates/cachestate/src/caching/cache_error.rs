use thiserror::Error;

/// An error that is observed on a key's result stream, or returned by an entry store.
///
/// Apart from [`InternalError`](Self::InternalError), all variants carry a human readable
/// description of what went wrong, so they can be cloned to every subscriber of a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The producer failed, or completed without yielding a value.
    ///
    /// The attached string contains the producer's error, including its chain of causes.
    #[error("producer failed: {0}")]
    Producer(String),
    /// The entry store could not be read from or written to.
    #[error("storage failed: {0}")]
    Storage(String),
    /// A value could not be converted to or from its persisted form.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The result stream ended without a value.
    ///
    /// This happens when the key was evicted while a subscriber was still waiting on it.
    #[error("result stream closed")]
    Closed,
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        tracing::error!(error = &err as &dyn std::error::Error, "Storage I/O failed");
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl CacheError {
    /// Creates a [`Producer`](Self::Producer) error out of the producer's [`anyhow::Error`].
    pub fn from_producer_error(err: &anyhow::Error) -> Self {
        Self::Producer(format!("{err:#}"))
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short tag used for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::Producer(_) => "producer",
            CacheError::Storage(_) => "storage",
            CacheError::Malformed(_) => "malformed",
            CacheError::Closed => "closed",
            CacheError::InternalError => "internal",
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or the error denoting why no value is available.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

/// An error detected while setting up a cached operation or one of its signaling bindings.
///
/// These are raised synchronously at construction time and never on the result streams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A signaling binding was configured without any notifier to publish to.
    #[error("{0} requires either a notifier or a notifier key")]
    MissingNotifier(&'static str),
    /// A signaling binding was configured with both a notifier and a notifier key.
    #[error("{0} accepts either a notifier or a notifier key, not both")]
    ConflictingNotifier(&'static str),
}
