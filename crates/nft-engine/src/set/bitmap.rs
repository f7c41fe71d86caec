use super::backend::{SetBackend, SetClass, SetEstimate, SetParams, SetType};
use super::{ElemFlags, SetElem, SetFlags};
use crate::genmask::Genmask;
use nft_common::{Extension, NftError, Result};
use parking_lot::RwLock;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

/// Widest key the bitmap backend accepts, in bytes.
const MAX_KEY_LEN: u32 = 2;

/// Direct-indexed backend for one and two byte keys.
///
/// Every possible key gets a slot up front, so the slot table dominates
/// the footprint of a sparse set.
#[derive(Debug, Default)]
pub struct BitmapSetType;

impl Extension for BitmapSetType {
    fn name(&self) -> &str {
        "bitmap"
    }
}

fn slots(key_len: u32) -> usize {
    1usize << (8 * key_len)
}

impl SetType for BitmapSetType {
    fn features(&self) -> SetFlags {
        SetFlags::empty()
    }

    fn estimate(&self, params: &SetParams) -> Option<SetEstimate> {
        if params.key_len == 0 || params.key_len > MAX_KEY_LEN {
            return None;
        }
        let slot = mem::size_of::<Vec<Arc<SetElem>>>() as u64;
        let elem = mem::size_of::<Arc<SetElem>>() as u64;
        Some(SetEstimate {
            size: slots(params.key_len) as u64 * slot + u64::from(params.size) * elem,
            lookup: SetClass::O1,
            space: SetClass::O1,
        })
    }

    fn create(&self, params: &SetParams) -> Result<Box<dyn SetBackend>> {
        if params.key_len == 0 || params.key_len > MAX_KEY_LEN {
            return Err(NftError::unsupported(format!(
                "bitmap cannot hold {} byte keys",
                params.key_len
            )));
        }
        Ok(Box::new(BitmapBackend {
            slots: RwLock::new(vec![Vec::new(); slots(params.key_len)]),
        }))
    }
}

struct BitmapBackend {
    slots: RwLock<Vec<Vec<Arc<SetElem>>>>,
}

fn index(key: &[u8]) -> usize {
    key.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
}

impl BitmapBackend {
    fn find(&self, key: &[u8], mask: Genmask) -> Option<Arc<SetElem>> {
        self.slots
            .read()
            .get(index(key))?
            .iter()
            .find(|e| e.is_active(mask))
            .cloned()
    }
}

impl SetBackend for BitmapBackend {
    fn insert(&self, elem: Arc<SetElem>, next: Genmask) -> std::result::Result<(), Arc<SetElem>> {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(index(elem.key())) else {
            return Err(elem);
        };
        if let Some(existing) = slot.iter().find(|e| e.is_active(next)) {
            return Err(Arc::clone(existing));
        }
        slot.push(elem);
        Ok(())
    }

    fn deactivate(&self, key: &[u8], _flags: ElemFlags, next: Genmask) -> Option<Arc<SetElem>> {
        let elem = self.find(key, next)?;
        elem.genmask.toggle(next);
        Some(elem)
    }

    fn remove(&self, elem: &Arc<SetElem>) {
        if let Some(slot) = self.slots.write().get_mut(index(elem.key())) {
            slot.retain(|e| !Arc::ptr_eq(e, elem));
        }
    }

    fn get(&self, key: &[u8], _flags: ElemFlags, mask: Genmask) -> Option<Arc<SetElem>> {
        self.find(key, mask)
    }

    fn lookup(&self, key: &[u8], mask: Genmask) -> Option<Arc<SetElem>> {
        self.find(key, mask)
    }

    fn walk(&self, mask: Genmask, f: &mut dyn FnMut(&Arc<SetElem>) -> Result<()>) -> Result<()> {
        let slots = self.slots.read();
        slots
            .iter()
            .flatten()
            .filter(|e| e.is_active(mask))
            .try_for_each(|e| f(e))
    }

    fn gc_scan(&self, _mask: Genmask, _now: Instant) -> Vec<Arc<SetElem>> {
        Vec::new()
    }

    fn len(&self) -> usize {
        self.slots.read().iter().map(Vec::len).sum()
    }

    fn drain(&self) -> Vec<Arc<SetElem>> {
        self.slots
            .write()
            .iter_mut()
            .flat_map(std::mem::take)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate() {
        let ty = BitmapSetType;
        let slot = mem::size_of::<Vec<Arc<SetElem>>>() as u64;
        let elem = mem::size_of::<Arc<SetElem>>() as u64;
        let one = ty
            .estimate(&SetParams {
                key_len: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(one.size, 256 * slot);
        let two = ty
            .estimate(&SetParams {
                key_len: 2,
                size: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(two.size, 65536 * slot + 10 * elem);
        assert!(ty
            .estimate(&SetParams {
                key_len: 3,
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn test_index_is_big_endian() {
        assert_eq!(index(&[0x01, 0x02]), 0x0102);
        assert_eq!(index(&[0xff]), 0xff);
    }
}
