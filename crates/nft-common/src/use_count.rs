//! Use counters for entities shared between the control plane and the
//! fast path.
//!
//! Entities live behind `Arc` so the fast path can hold them, which means
//! the counter needs interior mutability. All mutation still happens under
//! the namespace commit mutex; the atomics only make the type `Sync`.
//!
//! The counter never wraps: [`UseCount::inc`] fails at `u32::MAX` and
//! [`UseCount::dec`] refuses to go below zero.

use crate::error::{NftError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Saturating use counter.
#[derive(Debug, Default)]
pub struct UseCount(AtomicU32);

impl UseCount {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Takes a use.
    ///
    /// Fails with `ResourceExhausted` when the counter is saturated.
    pub fn inc(&self) -> Result<u32> {
        let cur = self.0.load(Ordering::Relaxed);
        if cur == u32::MAX {
            return Err(NftError::exhausted("use counter saturated"));
        }
        self.0.store(cur + 1, Ordering::Relaxed);
        Ok(cur + 1)
    }

    /// Gives back a use that an undo path dropped earlier.
    ///
    /// Cannot fail: the slot was released by the same batch.
    pub fn inc_restore(&self) {
        if self.inc().is_err() {
            tracing::error!("use counter overflow while restoring");
        }
    }

    /// Drops a use and returns the new value.
    ///
    /// Returns `None` (and leaves the counter at zero) on underflow.
    pub fn dec(&self) -> Option<u32> {
        let cur = self.0.load(Ordering::Relaxed);
        if cur == 0 {
            tracing::error!("use counter underflow");
            return None;
        }
        self.0.store(cur - 1, Ordering::Relaxed);
        Some(cur - 1)
    }

    /// Returns the current value.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns true while anything holds a use.
    pub fn in_use(&self) -> bool {
        self.get() > 0
    }
}

/// Types carrying a use counter.
pub trait HasUse {
    /// Returns the entity's counter.
    fn use_count(&self) -> &UseCount;

    /// Fails with `Busy` while anything references the entity.
    fn ensure_unused(&self, what: &str) -> Result<()> {
        let uses = self.use_count().get();
        if uses > 0 {
            return Err(NftError::busy(format!("{} still has {} users", what, uses)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing {
        uses: UseCount,
    }

    impl HasUse for Thing {
        fn use_count(&self) -> &UseCount {
            &self.uses
        }
    }

    #[test]
    fn test_inc_dec() {
        let count = UseCount::new();
        assert_eq!(count.inc().unwrap(), 1);
        assert_eq!(count.inc().unwrap(), 2);
        assert_eq!(count.dec(), Some(1));
        assert_eq!(count.dec(), Some(0));
        assert!(!count.in_use());
    }

    #[test]
    fn test_underflow() {
        let count = UseCount::new();
        assert_eq!(count.dec(), None);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_saturation() {
        let count = UseCount(AtomicU32::new(u32::MAX));
        let err = count.inc().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_ensure_unused() {
        let thing = Thing {
            uses: UseCount::new(),
        };
        assert!(thing.ensure_unused("chain").is_ok());
        thing.uses.inc().unwrap();
        assert_eq!(
            thing.ensure_unused("chain").unwrap_err().kind(),
            crate::ErrorKind::Busy
        );
    }
}
