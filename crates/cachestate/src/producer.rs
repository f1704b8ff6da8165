//! Adapters for producers that do not fit the single-value shape.
//!
//! A [`CacheManager`](crate::CacheManager) expects its producer to resolve to exactly one value.
//! Sources that yield a sequence of values can be adapted with [`first_value`], which keeps the
//! first item and ignores the rest.

use futures::{Stream, StreamExt};

/// Resolves to the first item of `stream`.
///
/// The stream is dropped as soon as its first item arrives. An empty stream is an error.
pub async fn first_value<S, T>(stream: S) -> anyhow::Result<T>
where
    S: Stream<Item = anyhow::Result<T>>,
{
    let mut stream = std::pin::pin!(stream);
    match stream.next().await {
        Some(result) => result,
        None => anyhow::bail!("producer completed without a value"),
    }
}

/// Like [`first_value`], for streams of plain values.
pub async fn first_ok<S, T>(stream: S) -> anyhow::Result<T>
where
    S: Stream<Item = T>,
{
    first_value(stream.map(Ok)).await
}
