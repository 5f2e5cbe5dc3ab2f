use std::sync::atomic::{AtomicU64, Ordering};

/// Tallies for one run.
///
/// Created at run start and handed by reference to the transformer and dispatcher;
/// relaxed atomics so queue workers can share one instance without locking.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub processed: AtomicU64,
    pub redirect_skips: AtomicU64,
    pub disambiguation_skips: AtomicU64,
    pub dispatch_failures: AtomicU64,
}

/// Frozen copy of [`RunCounters`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountSnapshot {
    pub processed: u64,
    pub redirect_skips: u64,
    pub disambiguation_skips: u64,
    pub dispatch_failures: u64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_redirect_skips(&self) {
        self.redirect_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_disambiguation_skips(&self) {
        self.disambiguation_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatch_failures(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn redirect_skips(&self) -> u64 {
        self.redirect_skips.load(Ordering::Relaxed)
    }

    pub fn disambiguation_skips(&self) -> u64 {
        self.disambiguation_skips.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountSnapshot {
        CountSnapshot {
            processed: self.processed(),
            redirect_skips: self.redirect_skips(),
            disambiguation_skips: self.disambiguation_skips(),
            dispatch_failures: self.dispatch_failures(),
        }
    }
}
