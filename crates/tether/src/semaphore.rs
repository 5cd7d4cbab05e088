use std::sync::atomic::{AtomicI64, Ordering};

/// Thread-safe counter for outstanding asynchronous writes.
///
/// [`Semaphore::dec`] reports the transition back to zero, which is the
/// signal a stream uses to emit `all_writes_completed` exactly once per
/// quiescence.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: AtomicI64,
}

impl Semaphore {
    /// Create a semaphore with a zero count.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the outstanding count.
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the outstanding count.
    ///
    /// Returns `true` when this decrement brought the count to zero.
    pub fn dec(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// The current outstanding count.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}
