use std::time::Duration;

use tokio::time::Instant;

/// The default spacing between two producer invocations for the same key.
pub const DEFAULT_REFRESH_THROTTLE: Duration = Duration::from_millis(150);

/// A leading-edge gate for refresh requests.
///
/// The first request opens a window and is let through. Every request arriving while the window
/// is open is dropped, not queued. The first request after the window has closed opens a new one.
#[derive(Debug)]
pub(crate) struct RefreshThrottle {
    window: Duration,
    cooling_until: Option<Instant>,
    dropped: u64,
}

impl RefreshThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            cooling_until: None,
            dropped: 0,
        }
    }

    /// Returns `true` if the request may start a refresh right now.
    pub fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        match self.cooling_until {
            Some(until) if now < until => {
                self.dropped += 1;
                false
            }
            _ => {
                self.cooling_until = Some(now + self.window);
                true
            }
        }
    }

    /// The number of requests dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
