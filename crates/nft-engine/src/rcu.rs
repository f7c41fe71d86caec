//! Read-side critical sections and grace periods.
//!
//! The fast path brackets each evaluation with [`Rcu::read`]. Reclamation
//! calls [`Rcu::synchronize`], which returns once every reader that was
//! inside a critical section when the call started has left it. Readers
//! never block; `synchronize` spins with backoff on a two-slot counter.
//!
//! A reader increments the slot of the epoch it observed and re-checks the
//! epoch afterwards; if the epoch moved in between it retries in the new
//! slot. `synchronize` advances the epoch and waits for the old slot to
//! drain, so any reader it waits for entered before the advance.

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Grace-period tracker.
#[derive(Debug, Default)]
pub struct Rcu {
    epoch: AtomicUsize,
    readers: [AtomicUsize; 2],
    sync: Mutex<()>,
}

/// A read-side critical section; dropping it leaves the section.
#[must_use]
pub struct RcuReadGuard<'a> {
    rcu: &'a Rcu,
    slot: usize,
}

impl Rcu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a read-side critical section.
    pub fn read(&self) -> RcuReadGuard<'_> {
        loop {
            let slot = self.epoch.load(Ordering::SeqCst) & 1;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) & 1 == slot {
                return RcuReadGuard { rcu: self, slot };
            }
            self.readers[slot].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Waits for a grace period.
    ///
    /// Must not be called from inside a read-side section.
    pub fn synchronize(&self) {
        let _serialize = self.sync.lock();
        let old = self.epoch.fetch_add(1, Ordering::SeqCst) & 1;
        let backoff = Backoff::new();
        while self.readers[old].load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }

    /// Number of readers currently inside a section.
    pub fn active_readers(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }
}

impl Drop for RcuReadGuard<'_> {
    fn drop(&mut self) {
        self.rcu.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}
