use futures::Stream;
use tokio::sync::watch;

use super::{CacheEntry, CacheError};

/// The latest thing that happened on a key's result channel.
#[derive(Debug, Clone)]
enum Emission<T> {
    /// Nothing has been emitted yet.
    Pending,
    Value(T),
    Failed(CacheError),
}

/// The sending half of a key's replay-of-latest broadcast channel.
///
/// New subscribers immediately observe the latest emission. The number of live
/// [`CacheStream`]s is what drives eviction of the key. Dropping the sender completes the
/// channel for all subscribers.
#[derive(Debug)]
pub(crate) struct ReplaySender<T> {
    tx: watch::Sender<Emission<T>>,
}

impl<T: Clone> ReplaySender<T> {
    pub fn new() -> Self {
        // The initial receiver is dropped right away, the sender never counts as an observer.
        let (tx, _rx) = watch::channel(Emission::Pending);
        Self { tx }
    }

    pub fn subscribe(&self) -> CacheStream<T> {
        CacheStream {
            rx: self.tx.subscribe(),
            replayed: false,
            finished: false,
        }
    }

    pub fn emit(&self, value: T) {
        self.tx.send_replace(Emission::Value(value));
    }

    pub fn fail(&self, error: CacheError) {
        self.tx.send_replace(Emission::Failed(error));
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Whether the latest emission is a value.
    pub fn is_populated(&self) -> bool {
        matches!(*self.tx.borrow(), Emission::Value(_))
    }
}

/// A subscription to the results of one cache key.
///
/// The first call to [`next`](Self::next) yields the latest result right away if there is one,
/// later calls wait for new results. A failure is terminal: it is yielded once, after which the
/// stream ends. The stream also ends when the key is evicted.
///
/// Each live `CacheStream` counts as one observer of its key.
#[derive(Debug)]
pub struct CacheStream<T> {
    rx: watch::Receiver<Emission<T>>,
    replayed: bool,
    finished: bool,
}

impl<T: Clone> CacheStream<T> {
    /// Waits for the next result, or returns `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<CacheEntry<T>> {
        if self.finished {
            return None;
        }

        loop {
            if self.replayed {
                if self.rx.changed().await.is_err() {
                    self.finished = true;
                    return None;
                }
            } else {
                self.replayed = true;
            }

            let emission = self.rx.borrow_and_update().clone();
            match emission {
                Emission::Pending => continue,
                Emission::Value(value) => return Some(Ok(value)),
                Emission::Failed(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }
        }
    }

    /// Waits for the first result.
    ///
    /// Returns [`CacheError::Closed`] if the stream ends without yielding anything.
    pub async fn first(mut self) -> CacheEntry<T> {
        self.next().await.unwrap_or(Err(CacheError::Closed))
    }

    /// The latest result, without waiting and without advancing the stream.
    pub fn latest(&self) -> Option<CacheEntry<T>> {
        match &*self.rx.borrow() {
            Emission::Pending => None,
            Emission::Value(value) => Some(Ok(value.clone())),
            Emission::Failed(error) => Some(Err(error.clone())),
        }
    }

    /// Converts this subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = CacheEntry<T>> {
        futures::stream::unfold(self, |mut stream| async move {
            let item = stream.next().await?;
            Some((item, stream))
        })
    }
}
