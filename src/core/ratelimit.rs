//! Rate limiting for shared bottleneck resources.

use crate::log_status;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Lock-guarded minimum-period limiter on the monotonic clock.
///
/// `acquire()` blocks the caller until at least `period` has elapsed since
/// the previous acquisition, regardless of how many threads share the
/// limiter. Constructed explicitly and injected (`Arc`) so tests and
/// multiple campaigns can use independent instances.
#[derive(Debug)]
pub struct RateLimit {
    period: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimit {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until the minimum period since the last acquisition has
    /// passed, then claim the current instant.
    pub fn acquire(&self) {
        let mut last = self.last.lock().unwrap();

        if let Some(prev) = *last {
            let elapsed = prev.elapsed();

            if elapsed < self.period {
                let delay = self.period - elapsed;

                log_status!("ratelimit", "delaying action for {:.3}s", delay.as_secs_f64());
                std::thread::sleep(delay);
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn consecutive_acquisitions_are_period_apart() {
        let limit = RateLimit::new(Duration::from_millis(20));

        limit.acquire();
        let first = Instant::now();
        limit.acquire();

        assert!(first.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn concurrent_acquisitions_are_serialized() {
        let period = Duration::from_millis(10);
        let limit = Arc::new(RateLimit::new(period));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limit = Arc::clone(&limit);
                std::thread::spawn(move || limit.acquire())
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // 4 acquisitions, 3 enforced gaps minimum.
        assert!(start.elapsed() >= period * 3);
    }
}
