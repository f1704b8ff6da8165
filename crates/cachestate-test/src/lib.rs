//! Helpers for testing cached operations.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. To do so, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - Refreshes of a key are throttled. Tests that trigger several refreshes of the same key
//!    should run with paused time and [`skip_throttle`] between them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Longer than the default refresh throttle window.
pub const THROTTLE_GAP: Duration = Duration::from_millis(200);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cachestate` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cachestate=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Lets the default refresh throttle window pass.
///
/// Under paused time this returns immediately after advancing the clock.
pub async fn skip_throttle() {
    tokio::time::sleep(THROTTLE_GAP).await;
}

struct Step<T> {
    delay: Duration,
    result: Result<T, String>,
}

struct Script<T> {
    steps: VecDeque<Step<T>>,
    fallback: Option<T>,
    seen_args: Vec<String>,
}

/// A producer that returns scripted results and counts its invocations.
///
/// Every invocation consumes the next scripted step. Once the script is exhausted, the fallback
/// value is returned, or an error if there is none. Clones share the script and the counter.
pub struct ScriptedProducer<T> {
    script: Arc<Mutex<Script<T>>>,
    calls: Arc<AtomicUsize>,
}

impl<T> Clone for ScriptedProducer<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T> fmt::Debug for ScriptedProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedProducer")
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T> Default for ScriptedProducer<T> {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                fallback: None,
                seen_args: Vec::new(),
            })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<T: Clone + Send + 'static> ScriptedProducer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A producer that always returns `value`.
    pub fn returning(value: T) -> Self {
        let producer = Self::new();
        producer.set_fallback(value);
        producer
    }

    pub fn set_fallback(&self, value: T) {
        self.script.lock().unwrap().fallback = Some(value);
    }

    pub fn push_ok(&self, value: T) {
        self.push(Duration::ZERO, Ok(value));
    }

    /// Scripts a value that is returned only after `delay`.
    pub fn push_ok_after(&self, delay: Duration, value: T) {
        self.push(delay, Ok(value));
    }

    pub fn push_err(&self, message: impl Into<String>) {
        self.push(Duration::ZERO, Err(message.into()));
    }

    fn push(&self, delay: Duration, result: Result<T, String>) {
        let mut script = self.script.lock().unwrap();
        script.steps.push_back(Step { delay, result });
    }

    /// The number of invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The `Debug` representation of the arguments of every invocation, in order.
    pub fn seen_args(&self) -> Vec<String> {
        self.script.lock().unwrap().seen_args.clone()
    }

    /// Runs one invocation.
    pub fn produce(&self, args: &dyn fmt::Debug) -> BoxFuture<'static, anyhow::Result<T>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut script = self.script.lock().unwrap();
        script.seen_args.push(format!("{args:?}"));
        let step = script.steps.pop_front().unwrap_or_else(|| Step {
            delay: Duration::ZERO,
            result: script
                .fallback
                .clone()
                .ok_or_else(|| "script exhausted".to_owned()),
        });

        async move {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.result.map_err(anyhow::Error::msg)
        }
        .boxed()
    }

    /// Returns the producer function to hand to a cache.
    pub fn producer<A, C>(
        &self,
    ) -> impl Fn(A, C) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + use<T, A, C>
    where
        A: fmt::Debug,
    {
        let this = self.clone();
        move |args: A, _context: C| this.produce(&args)
    }
}
