use std::sync::atomic::{AtomicUsize, Ordering};

/// Consecutive job failures shared by every worker of a pool.
#[derive(Debug)]
pub struct FailureStreak {
    count: AtomicUsize,
    max: usize,
}

impl FailureStreak {
    pub fn new(max: usize) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max,
        }
    }

    /// Count one failure and return the new streak length.
    pub fn record_failure(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_tripped(&self) -> bool {
        self.current() >= self.max
    }
}
