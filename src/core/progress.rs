//! Shared execution-progress counter.

use crate::compute;
use crate::log_status;
use std::sync::Mutex;

/// Thread-safe `{current, total}` counter shared by parallel workers.
///
/// `tick()` logs a status line at decile milestones so long runs stay
/// observable without flooding stderr.
pub struct Progress {
    total: usize,
    current: Mutex<usize>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            current: Mutex::new(0),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn current(&self) -> usize {
        *self.current.lock().unwrap()
    }

    /// Increment the counter and return the new value.
    pub fn update(&self, increment: usize) -> usize {
        let mut current = self.current.lock().unwrap();
        *current += increment;

        *current
    }

    /// Increment the counter, logging at every completed decile.
    pub fn tick(&self, increment: usize) {
        let current = self.update(increment);
        let step = (self.total / 10).max(1);

        if current % step == 0 {
            log_status!(
                "progress",
                "{:.1}%: {} / {}",
                compute::perc(current, self.total),
                current,
                self.total
            );
        }
    }
}
