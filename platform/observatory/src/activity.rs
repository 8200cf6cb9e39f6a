//! Shared activity tracking for test-mode quiescence detection.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Records the last moment any runtime task did useful work.
///
/// Subscriptions and outbox processors call [`Activity::touch`] whenever
/// they process at least one message; in test mode the engine exits once
/// the tracker has been idle long enough for cascading messages
/// (event → handler → new event) to have propagated.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Record that work just happened.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = Instant::now();
        }
    }

    /// How long since the last recorded work.
    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_resets_idle() {
        let activity = Activity::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(activity.idle_for() >= Duration::from_millis(20));
        activity.touch();
        assert!(activity.idle_for() < Duration::from_millis(20));
    }
}
