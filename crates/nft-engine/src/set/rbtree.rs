//! Ordered backend for interval sets.
//!
//! An interval `[a, b)` is stored as two elements: a start at `a` and an
//! `INTERVAL_END` element at `b`. A lookup finds the closest key at or
//! below the probe; it matches if that key opens an interval.

use super::backend::{SetBackend, SetClass, SetEstimate, SetParams, SetType};
use super::{ElemFlags, SetElem, SetFlags};
use crate::genmask::Genmask;
use nft_common::{Extension, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

const NODE_OVERHEAD: u64 = 88;

#[derive(Debug, Default)]
pub struct RbtreeSetType;

impl Extension for RbtreeSetType {
    fn name(&self) -> &str {
        "rbtree"
    }
}

impl SetType for RbtreeSetType {
    fn features(&self) -> SetFlags {
        SetFlags::INTERVAL | SetFlags::MAP | SetFlags::OBJECT | SetFlags::TIMEOUT
    }

    fn estimate(&self, params: &SetParams) -> Option<SetEstimate> {
        let size = if params.size == 0 {
            0
        } else {
            u64::from(params.size) * (NODE_OVERHEAD + u64::from(params.key_len) + u64::from(params.data_len))
        };
        Some(SetEstimate {
            size,
            lookup: SetClass::OLogN,
            space: SetClass::ON,
        })
    }

    fn create(&self, params: &SetParams) -> Result<Box<dyn SetBackend>> {
        Ok(Box::new(RbtreeBackend {
            interval: params.flags.contains(SetFlags::INTERVAL),
            tree: RwLock::new(BTreeMap::new()),
        }))
    }
}

struct RbtreeBackend {
    interval: bool,
    tree: RwLock<BTreeMap<Vec<u8>, Vec<Arc<SetElem>>>>,
}

fn live(e: &SetElem, mask: Genmask, now: Instant) -> bool {
    e.is_active(mask) && !e.is_expired(now)
}

impl RbtreeBackend {
    fn exact(&self, key: &[u8], flags: ElemFlags, mask: Genmask, now: Instant) -> Option<Arc<SetElem>> {
        self.tree
            .read()
            .get(key)?
            .iter()
            .find(|e| e.flags() == flags && live(e, mask, now))
            .cloned()
    }
}

impl SetBackend for RbtreeBackend {
    fn insert(&self, elem: Arc<SetElem>, next: Genmask) -> std::result::Result<(), Arc<SetElem>> {
        let now = Instant::now();
        let mut tree = self.tree.write();
        let node = tree.entry(elem.key().to_vec()).or_default();
        if let Some(existing) = node
            .iter()
            .find(|e| e.flags() == elem.flags() && live(e, next, now))
        {
            return Err(Arc::clone(existing));
        }
        node.push(elem);
        Ok(())
    }

    fn deactivate(&self, key: &[u8], flags: ElemFlags, next: Genmask) -> Option<Arc<SetElem>> {
        let elem = self.exact(key, flags, next, Instant::now())?;
        elem.genmask.toggle(next);
        Some(elem)
    }

    fn remove(&self, elem: &Arc<SetElem>) {
        let mut tree = self.tree.write();
        if let Some(node) = tree.get_mut(elem.key()) {
            node.retain(|e| !Arc::ptr_eq(e, elem));
            if node.is_empty() {
                tree.remove(elem.key());
            }
        }
    }

    fn get(&self, key: &[u8], flags: ElemFlags, mask: Genmask) -> Option<Arc<SetElem>> {
        self.exact(key, flags, mask, Instant::now())
    }

    fn lookup(&self, key: &[u8], mask: Genmask) -> Option<Arc<SetElem>> {
        let now = Instant::now();
        if !self.interval {
            return self.exact(key, ElemFlags::empty(), mask, now);
        }
        let tree = self.tree.read();
        for (_, node) in tree.range::<[u8], _>((Bound::Unbounded, Bound::Included(key))).rev() {
            let mut closest = node.iter().filter(|e| live(e, mask, now)).peekable();
            if closest.peek().is_none() {
                continue;
            }
            return closest.find(|e| !e.is_interval_end()).cloned();
        }
        None
    }

    fn walk(&self, mask: Genmask, f: &mut dyn FnMut(&Arc<SetElem>) -> Result<()>) -> Result<()> {
        let now = Instant::now();
        let tree = self.tree.read();
        tree.values()
            .flatten()
            .filter(|e| live(e, mask, now))
            .try_for_each(|e| f(e))
    }

    /// Collects expired starts together with the end element closing
    /// each of them.
    fn gc_scan(&self, mask: Genmask, now: Instant) -> Vec<Arc<SetElem>> {
        let tree = self.tree.read();
        let mut expired = Vec::new();
        let mut pending_end = false;
        for elem in tree.values().flatten().filter(|e| e.is_active(mask)) {
            if elem.is_interval_end() {
                if pending_end && elem.claim_gc() {
                    expired.push(Arc::clone(elem));
                }
                pending_end = false;
            } else if elem.is_expired(now) && elem.claim_gc() {
                expired.push(Arc::clone(elem));
                pending_end = self.interval;
            } else {
                pending_end = false;
            }
        }
        expired
    }

    fn len(&self) -> usize {
        self.tree.read().values().map(Vec::len).sum()
    }

    fn drain(&self) -> Vec<Arc<SetElem>> {
        std::mem::take(&mut *self.tree.write())
            .into_values()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ElemSpec, Set, SetSpec};
    use super::*;
    use crate::genmask::GenCursor;

    fn interval_set() -> Set {
        let spec = SetSpec::new("ranges", 2).flags(SetFlags::INTERVAL);
        let ty: Arc<dyn SetType> = Arc::new(RbtreeSetType);
        let backend = ty.create(&spec.params()).unwrap();
        Set::new(1, "ranges".to_string(), &spec, ty, backend)
    }

    fn add(set: &Set, spec: ElemSpec, cursor: &GenCursor) {
        let elem = Arc::new(set.build_elem(&spec, None).unwrap());
        set.backend().insert(elem, cursor.next_mask()).unwrap();
    }

    #[test]
    fn test_interval_lookup() {
        let cursor = GenCursor::new();
        let set = interval_set();
        // [10, 20) and [30, 40)
        add(&set, ElemSpec::key([0, 10]), &cursor);
        add(&set, ElemSpec::key([0, 20]).interval_end(), &cursor);
        add(&set, ElemSpec::key([0, 30]), &cursor);
        add(&set, ElemSpec::key([0, 40]).interval_end(), &cursor);

        let mask = cursor.cur_mask();
        let backend = set.backend();
        assert!(backend.lookup(&[0, 5], mask).is_none());
        assert!(backend.lookup(&[0, 10], mask).is_some());
        assert!(backend.lookup(&[0, 19], mask).is_some());
        assert!(backend.lookup(&[0, 20], mask).is_none());
        assert!(backend.lookup(&[0, 25], mask).is_none());
        assert!(backend.lookup(&[0, 35], mask).is_some());
        assert!(backend.lookup(&[1, 0], mask).is_none());
    }

    #[test]
    fn test_start_and_end_share_key() {
        let cursor = GenCursor::new();
        let set = interval_set();
        add(&set, ElemSpec::key([0, 10]), &cursor);
        add(&set, ElemSpec::key([0, 10]).interval_end(), &cursor);
        assert_eq!(set.backend().len(), 2);

        let dup = Arc::new(set.build_elem(&ElemSpec::key([0, 10]), None).unwrap());
        assert!(set.backend().insert(dup, cursor.next_mask()).is_err());
    }
}
