//! Fault-handling counters.
//!
//! Updated from the fault path, so every counter is a relaxed atomic: no
//! locks, no allocation. Readers get a [`TrapStatsSnapshot`], which is
//! `#[repr(C)]` for the C ABI.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, one set per process.
#[derive(Debug, Default)]
pub(crate) struct TrapStats {
    resolved_in_place: AtomicU64,
    unwound: AtomicU64,
    forwarded: AtomicU64,
    recursive: AtomicU64,
}

impl TrapStats {
    pub(crate) const fn new() -> Self {
        Self {
            resolved_in_place: AtomicU64::new(0),
            unwound: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            recursive: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_resolved_in_place(&self) {
        self.resolved_in_place.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unwound(&self) {
        self.unwound.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recursive(&self) {
        self.recursive.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TrapStatsSnapshot {
        TrapStatsSnapshot {
            resolved_in_place: self.resolved_in_place.load(Ordering::Relaxed),
            unwound: self.unwound.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            recursive: self.recursive.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the fault-handling counters.
///
/// This struct is exchanged with C code and must maintain ABI compatibility.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapStatsSnapshot {
    /// Faults the resolver repaired in place.
    pub resolved_in_place: u64,
    /// Faults that unwound to a recovery point.
    pub unwound: u64,
    /// Faults the resolver declined, handed to the previous handler.
    pub forwarded: u64,
    /// Faults raised while already handling one, forwarded unresolved.
    pub recursive: u64,
}

impl TrapStatsSnapshot {
    /// Faults that reached the handler, whatever the outcome.
    pub fn total(&self) -> u64 {
        self.resolved_in_place + self.unwound + self.forwarded + self.recursive
    }
}

/// Current counters; all zero before handlers are installed.
pub fn stats() -> TrapStatsSnapshot {
    crate::install::state().map_or_else(TrapStatsSnapshot::default, |s| s.stats.snapshot())
}

// ── C ABI ───────────────────────────────────────────────────────────────

/// Current fault-handling counters.
#[no_mangle]
pub extern "C" fn hew_trap_stats() -> TrapStatsSnapshot {
    stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = TrapStats::new();
        assert_eq!(stats.snapshot(), TrapStatsSnapshot::default());
        assert_eq!(stats.snapshot().total(), 0);
    }

    #[test]
    fn each_outcome_has_its_own_counter() {
        let stats = TrapStats::new();
        stats.record_resolved_in_place();
        stats.record_unwound();
        stats.record_unwound();
        stats.record_forwarded();
        stats.record_recursive();

        let snap = stats.snapshot();
        assert_eq!(snap.resolved_in_place, 1);
        assert_eq!(snap.unwound, 2);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.recursive, 1);
        assert_eq!(snap.total(), 5);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = TrapStats::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        stats.record_forwarded();
                    }
                });
            }
        });
        assert_eq!(stats.snapshot().forwarded, 4000);
    }
}
