//! Two-generation activation state.
//!
//! Every table, chain, rule, set, object, flowtable and set element
//! carries a two-bit *inactive* mask. Bit `g` set means the entity is
//! invisible in generation `g`. The namespace cursor selects the current
//! generation; staging only ever touches the bit of the *next* one, so
//! the current view is untouched until commit flips the cursor.
//!
//! ```text
//!   staged create   : inactive(cur)         -> visible after flip
//!   staged delete   : inactive(next)        -> invisible after flip
//!   commit (clear)  : bits &= !next         -> visible in both
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// Bit selecting one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Genmask(u8);

impl Genmask {
    /// Mask of generation `gen` (0 or 1).
    pub fn for_gen(gen: u8) -> Self {
        Genmask(1 << (gen & 1))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Per-entity inactive bits.
#[derive(Debug, Default)]
pub struct GenBits(AtomicU8);

impl GenBits {
    /// Active in both generations.
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Returns true if the entity is visible in the generation `mask`
    /// selects.
    pub fn is_active(&self, mask: Genmask) -> bool {
        self.0.load(Ordering::Acquire) & mask.0 == 0
    }

    /// Staged create: hidden from the current generation only.
    pub fn activate_next(&self, cur: Genmask) {
        self.0.store(cur.0, Ordering::Release);
    }

    /// Staged delete: hidden from the next generation only.
    pub fn deactivate_next(&self, next: Genmask) {
        self.0.store(next.0, Ordering::Release);
    }

    /// Makes the entity visible in the next generation again.
    pub fn clear(&self, next: Genmask) {
        self.0.fetch_and(!next.0, Ordering::AcqRel);
    }

    /// Flips next-generation visibility; set elements use this for both
    /// activation and deactivation.
    pub fn toggle(&self, next: Genmask) {
        self.0.fetch_xor(next.0, Ordering::AcqRel);
    }

    /// Hides the entity from both generations. Returns false if it
    /// already was.
    pub fn deactivate_all(&self) -> bool {
        self.0.fetch_or(0b11, Ordering::AcqRel) != 0b11
    }

    pub fn raw(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// Namespace-wide cursor naming the current generation.
#[derive(Debug, Default)]
pub struct GenCursor(AtomicU8);

impl GenCursor {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Index of the current generation.
    pub fn cur(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Index of the generation being staged.
    pub fn next(&self) -> u8 {
        self.cur() ^ 1
    }

    pub fn cur_mask(&self) -> Genmask {
        Genmask::for_gen(self.cur())
    }

    pub fn next_mask(&self) -> Genmask {
        Genmask::for_gen(self.next())
    }

    /// Makes the staged generation current. Only commit calls this.
    pub fn flip(&self) {
        let next = self.next();
        self.0.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_create_then_commit() {
        let cursor = GenCursor::new();
        let bits = GenBits::new();

        bits.activate_next(cursor.cur_mask());
        assert!(!bits.is_active(cursor.cur_mask()));
        assert!(bits.is_active(cursor.next_mask()));

        cursor.flip();
        assert!(bits.is_active(cursor.cur_mask()));
        bits.clear(cursor.next_mask());
        assert!(bits.is_active(cursor.next_mask()));
        assert_eq!(bits.raw(), 0);
    }

    #[test]
    fn test_staged_delete_then_abort() {
        let cursor = GenCursor::new();
        let bits = GenBits::new();

        bits.deactivate_next(cursor.next_mask());
        assert!(bits.is_active(cursor.cur_mask()));
        assert!(!bits.is_active(cursor.next_mask()));

        bits.clear(cursor.next_mask());
        assert!(bits.is_active(cursor.next_mask()));
    }

    #[test]
    fn test_deactivate_all_once() {
        let cursor = GenCursor::new();
        let bits = GenBits::new();

        assert!(bits.deactivate_all());
        assert!(!bits.is_active(cursor.cur_mask()));
        assert!(!bits.is_active(cursor.next_mask()));
        assert!(!bits.deactivate_all());
    }

    #[test]
    fn test_toggle() {
        let cursor = GenCursor::new();
        let bits = GenBits::new();
        bits.toggle(cursor.next_mask());
        assert!(!bits.is_active(cursor.next_mask()));
        bits.toggle(cursor.next_mask());
        assert!(bits.is_active(cursor.next_mask()));
    }
}
