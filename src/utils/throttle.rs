use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Interval used for connection-failure and overflow log lines.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Rate limiter for repetitive log lines.
///
/// During a backend outage every reconnect attempt fails the same way; the
/// throttle lets one line through per interval and counts what it swallowed.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogThrottle {
    /// Creates a throttle that admits one event per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed)` when the caller may log now, where
    /// `suppressed` is the number of events swallowed since the last admitted
    /// one. Returns `None` while inside the quiet interval.
    pub fn admit(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }

    /// Forgets the last admitted event so the next one is logged immediately.
    pub fn reset(&self) {
        *self.last.lock() = None;
        self.suppressed.store(0, Ordering::Relaxed);
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_event_is_admitted() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.admit(), Some(0));
    }

    #[test]
    fn test_repeats_are_suppressed_and_counted() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.admit().is_some());
        assert!(throttle.admit().is_none());
        assert!(throttle.admit().is_none());

        throttle.reset();
        assert_eq!(throttle.admit(), Some(0));
    }

    #[test]
    fn test_zero_interval_admits_everything() {
        let throttle = LogThrottle::new(Duration::ZERO);
        for _ in 0..5 {
            assert_eq!(throttle.admit(), Some(0));
        }
    }
}
