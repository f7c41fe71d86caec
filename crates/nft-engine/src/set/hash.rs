use super::backend::{SetBackend, SetClass, SetEstimate, SetParams, SetType};
use super::{ElemFlags, SetElem, SetFlags};
use crate::genmask::Genmask;
use nft_common::{Extension, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-element bookkeeping the estimate charges on top of key and data.
const ELEM_OVERHEAD: u64 = 64;
const BUCKET_SIZE: u64 = 8;

/// Exact-match hash table; the default for anything without intervals.
#[derive(Debug, Default)]
pub struct HashSetType;

impl Extension for HashSetType {
    fn name(&self) -> &str {
        "hash"
    }
}

impl SetType for HashSetType {
    fn features(&self) -> SetFlags {
        SetFlags::MAP | SetFlags::OBJECT | SetFlags::TIMEOUT
    }

    fn estimate(&self, params: &SetParams) -> Option<SetEstimate> {
        let size = if params.size == 0 {
            0
        } else {
            let elem = ELEM_OVERHEAD + u64::from(params.key_len) + u64::from(params.data_len);
            let buckets = u64::from(params.size).next_power_of_two() * BUCKET_SIZE;
            u64::from(params.size) * elem + buckets
        };
        Some(SetEstimate {
            size,
            lookup: SetClass::O1,
            space: SetClass::ON,
        })
    }

    fn create(&self, _params: &SetParams) -> Result<Box<dyn SetBackend>> {
        Ok(Box::new(HashBackend::default()))
    }
}

#[derive(Default)]
struct HashBackend {
    buckets: RwLock<HashMap<Vec<u8>, Vec<Arc<SetElem>>>>,
}

impl HashBackend {
    fn find(&self, key: &[u8], mask: Genmask, now: Instant) -> Option<Arc<SetElem>> {
        self.buckets
            .read()
            .get(key)?
            .iter()
            .find(|e| e.is_active(mask) && !e.is_expired(now))
            .cloned()
    }
}

impl SetBackend for HashBackend {
    fn insert(&self, elem: Arc<SetElem>, next: Genmask) -> std::result::Result<(), Arc<SetElem>> {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(elem.key().to_vec()).or_default();
        if let Some(existing) = bucket.iter().find(|e| e.is_active(next) && !e.is_expired(now)) {
            return Err(Arc::clone(existing));
        }
        bucket.push(elem);
        Ok(())
    }

    fn deactivate(&self, key: &[u8], _flags: ElemFlags, next: Genmask) -> Option<Arc<SetElem>> {
        let elem = self.find(key, next, Instant::now())?;
        elem.genmask.toggle(next);
        Some(elem)
    }

    fn remove(&self, elem: &Arc<SetElem>) {
        let mut buckets = self.buckets.write();
        if let Some(bucket) = buckets.get_mut(elem.key()) {
            bucket.retain(|e| !Arc::ptr_eq(e, elem));
            if bucket.is_empty() {
                buckets.remove(elem.key());
            }
        }
    }

    fn get(&self, key: &[u8], _flags: ElemFlags, mask: Genmask) -> Option<Arc<SetElem>> {
        self.find(key, mask, Instant::now())
    }

    fn lookup(&self, key: &[u8], mask: Genmask) -> Option<Arc<SetElem>> {
        self.find(key, mask, Instant::now())
    }

    fn walk(&self, mask: Genmask, f: &mut dyn FnMut(&Arc<SetElem>) -> Result<()>) -> Result<()> {
        let now = Instant::now();
        let buckets = self.buckets.read();
        buckets
            .values()
            .flatten()
            .filter(|e| e.is_active(mask) && !e.is_expired(now))
            .try_for_each(|e| f(e))
    }

    fn gc_scan(&self, mask: Genmask, now: Instant) -> Vec<Arc<SetElem>> {
        self.buckets
            .read()
            .values()
            .flatten()
            .filter(|e| e.is_active(mask) && e.is_expired(now) && e.claim_gc())
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.buckets.read().values().map(Vec::len).sum()
    }

    fn drain(&self) -> Vec<Arc<SetElem>> {
        self.buckets.write().drain().flat_map(|(_, b)| b).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ElemSpec, Set, SetSpec};
    use super::*;
    use crate::genmask::GenCursor;

    fn elem(set: &Set, key: u8, cursor: &GenCursor) -> Arc<SetElem> {
        let e = Arc::new(set.build_elem(&ElemSpec::key([key]), None).unwrap());
        e.genmask.activate_next(cursor.cur_mask());
        e
    }

    fn new_set() -> Set {
        let spec = SetSpec::new("s", 1);
        let ty: Arc<dyn SetType> = Arc::new(HashSetType);
        let backend = ty.create(&spec.params()).unwrap();
        Set::new(1, "s".to_string(), &spec, ty, backend)
    }

    #[test]
    fn test_insert_conflict_and_activate() {
        let cursor = GenCursor::new();
        let set = new_set();
        let backend = set.backend();

        let a = elem(&set, 1, &cursor);
        backend.insert(Arc::clone(&a), cursor.next_mask()).unwrap();
        assert!(backend.insert(elem(&set, 1, &cursor), cursor.next_mask()).is_err());
        assert!(backend.lookup(&[1], cursor.cur_mask()).is_none());

        cursor.flip();
        assert!(backend.lookup(&[1], cursor.cur_mask()).is_some());
        assert!(backend.lookup(&[1], cursor.next_mask()).is_none());
        backend.activate(&a, cursor.next_mask());
        assert!(backend.lookup(&[1], cursor.next_mask()).is_some());
    }

    #[test]
    fn test_deactivate_and_remove() {
        let cursor = GenCursor::new();
        let set = new_set();
        let backend = set.backend();
        let a = Arc::new(set.build_elem(&ElemSpec::key([5]), None).unwrap());
        backend.insert(Arc::clone(&a), cursor.next_mask()).unwrap();

        let gone = backend.deactivate(&[5], ElemFlags::empty(), cursor.next_mask()).unwrap();
        assert!(Arc::ptr_eq(&gone, &a));
        assert!(backend.deactivate(&[5], ElemFlags::empty(), cursor.next_mask()).is_none());
        assert!(backend.lookup(&[5], cursor.cur_mask()).is_some());

        backend.remove(&a);
        assert!(backend.is_empty());
    }
}
