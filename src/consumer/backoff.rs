//! Retry backoff and the automatic pause controller

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Counter value above which the pause controller engages
const PAUSE_THRESHOLD: u32 = 100;

/// `min << (retry - 1)`, clamped to `max`.
///
/// `retry` is the message's post-release `reserved_count`; a value of 0 is
/// treated as 1 so the first release still waits at least `min`.
pub(crate) fn exponential_backoff(min: Duration, max: Duration, retry: u32) -> Duration {
    let shift = retry.saturating_sub(1).min(48);
    let nanos = min.as_nanos() << shift;
    if nanos >= max.as_nanos() {
        max
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

/// Auto-pause state fed by handler outcomes and drained by fetchers.
///
/// Accumulated long retry delays or repeated errors suspend fetching for a
/// while instead of hammering a backend that is telling us to slow down.
#[derive(Debug, Default)]
pub(crate) struct PauseController {
    err_count: AtomicU32,
    delay_count: AtomicU32,
    delay_sec: AtomicU32,
}

impl PauseController {
    /// Record a handler failure
    pub(crate) fn note_error(&self) {
        self.err_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an explicit retry delay; delays above one minute count
    /// toward pausing
    pub(crate) fn note_delay(&self, delay: Duration) {
        if delay > Duration::from_secs(60) {
            self.delay_sec
                .store(delay.as_secs() as u32, Ordering::Relaxed);
            self.delay_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// How long fetching should pause right now; zero means keep going
    pub(crate) fn paused(&self) -> Duration {
        if self.delay_count.load(Ordering::Relaxed) > PAUSE_THRESHOLD {
            return Duration::from_secs(self.delay_sec.load(Ordering::Relaxed) as u64);
        }
        if self.err_count.load(Ordering::Relaxed) > PAUSE_THRESHOLD {
            return Duration::from_secs(60);
        }
        Duration::ZERO
    }

    /// Clear accumulated pause pressure
    pub(crate) fn reset(&self) {
        self.err_count.store(0, Ordering::Relaxed);
        self.delay_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(12 * 60 * 60);

    #[test]
    fn test_backoff_doubles_per_retry() {
        let min = Duration::from_millis(1);
        assert_eq!(exponential_backoff(min, MAX, 1), Duration::from_millis(1));
        assert_eq!(exponential_backoff(min, MAX, 2), Duration::from_millis(2));
        assert_eq!(exponential_backoff(min, MAX, 3), Duration::from_millis(4));
        assert_eq!(exponential_backoff(min, MAX, 11), Duration::from_secs(1) + Duration::from_millis(24));
    }

    #[test]
    fn test_backoff_clamps_to_max() {
        let min = Duration::from_secs(30);
        assert_eq!(exponential_backoff(min, MAX, 30), MAX);
        assert_eq!(exponential_backoff(min, MAX, 1000), MAX);
    }

    #[test]
    fn test_backoff_zero_retry_behaves_as_first() {
        let min = Duration::from_millis(5);
        assert_eq!(exponential_backoff(min, MAX, 0), min);
    }

    #[test]
    fn test_pause_engages_after_error_threshold() {
        let pause = PauseController::default();
        assert_eq!(pause.paused(), Duration::ZERO);

        for _ in 0..=PAUSE_THRESHOLD {
            pause.note_error();
        }
        assert_eq!(pause.paused(), Duration::from_secs(60));

        pause.reset();
        assert_eq!(pause.paused(), Duration::ZERO);
    }

    #[test]
    fn test_pause_prefers_accumulated_delay() {
        let pause = PauseController::default();
        for _ in 0..=PAUSE_THRESHOLD {
            pause.note_delay(Duration::from_secs(120));
        }
        assert_eq!(pause.paused(), Duration::from_secs(120));
    }

    #[test]
    fn test_short_delays_do_not_count() {
        let pause = PauseController::default();
        for _ in 0..=PAUSE_THRESHOLD {
            pause.note_delay(Duration::from_secs(30));
        }
        assert_eq!(pause.paused(), Duration::ZERO);
    }
}
