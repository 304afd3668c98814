//! Pending-task counters linking pipeline stages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of units waiting for one worker.
///
/// Clones share the same counter: the owning worker keeps one, its upstream neighbour (or the
/// assembler seeding the first stage) keeps another to add work. Only the owning worker takes
/// units out, so the count can never drop below zero.
#[derive(Debug, Clone, Default)]
pub struct PendingCounter {
    count: Arc<AtomicUsize>,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Add `units` of externally supplied work.
    pub fn seed(&self, units: usize) {
        self.count.fetch_add(units, Ordering::AcqRel);
    }

    /// Add one unit produced by the upstream stage.
    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Take one unit. Returns `false` (and leaves the count alone) when nothing is pending.
    pub(crate) fn take_one(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_count() {
        let own = PendingCounter::new();
        let upstream = own.clone();
        upstream.seed(2);
        upstream.increment();
        assert_eq!(own.get(), 3);
    }

    #[test]
    fn take_stops_at_zero() {
        let counter = PendingCounter::new();
        counter.seed(1);
        assert!(counter.take_one());
        assert!(!counter.take_one());
        assert_eq!(counter.get(), 0);
    }
}
