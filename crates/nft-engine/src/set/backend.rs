//! Set backend contract and the cost model that picks a backend.
//!
//! Every backend type advertises the set features it implements and, for
//! a given declaration, an estimate of its lookup cost, memory growth and
//! (when the size is known) memory footprint. The selector filters the
//! registered types by features and keeps the best estimate under the
//! set's policy:
//!
//! | policy      | size known | ordering                          |
//! |-------------|------------|-----------------------------------|
//! | performance | any        | lookup class, then space class    |
//! | memory      | no         | space class, then lookup class    |
//! | memory      | yes        | estimated bytes                   |
//!
//! Remaining ties go to the backend whose name sorts first.

use super::{ElemFlags, SetElem, SetFlags, SetPolicy, SET_FEATURES};
use crate::genmask::Genmask;
use nft_common::{Extension, NftError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Asymptotic cost class; lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SetClass {
    O1,
    OLogN,
    ON,
}

/// What a backend expects to cost for a given declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetEstimate {
    /// Bytes for the declared size, 0 if unknown
    pub size: u64,
    pub lookup: SetClass,
    pub space: SetClass,
}

/// The parts of a set declaration a backend cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetParams {
    pub flags: SetFlags,
    pub key_len: u32,
    pub data_len: u32,
    /// Declared element count; 0 is unknown
    pub size: u32,
}

impl std::fmt::Debug for dyn SetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetType").field("name", &self.name()).finish()
    }
}

/// A backend implementation, registered in the extension registry.
pub trait SetType: Extension {
    /// Set flags this backend implements.
    fn features(&self) -> SetFlags;

    /// Cost of holding a set declared with `params`; `None` if the backend
    /// cannot hold it at all.
    fn estimate(&self, params: &SetParams) -> Option<SetEstimate>;

    fn create(&self, params: &SetParams) -> Result<Box<dyn SetBackend>>;
}

/// Storage of one set.
///
/// Staging calls `insert`, `deactivate` and `flush_one`; commit and abort
/// call `activate` and `remove`; the fast path calls `lookup`. Generation
/// masks are always passed in, backends keep no cursor of their own.
pub trait SetBackend: Send + Sync {
    /// Inserts `elem` (already inactive in the current generation).
    ///
    /// Returns the element in the way if one with the same key is live in
    /// the next generation and has not expired.
    fn insert(&self, elem: Arc<SetElem>, next: Genmask) -> std::result::Result<(), Arc<SetElem>>;

    /// Makes a staged insert (or undoes a staged delete) in the next
    /// generation.
    fn activate(&self, elem: &Arc<SetElem>, next: Genmask) {
        elem.genmask.toggle(next);
    }

    /// Stages the deletion of the element matching `key` and `flags`.
    fn deactivate(&self, key: &[u8], flags: ElemFlags, next: Genmask) -> Option<Arc<SetElem>>;

    /// Stages the deletion of `elem` as part of a flush. Returns false if
    /// it was already gone from the next generation.
    fn flush_one(&self, elem: &Arc<SetElem>, next: Genmask) -> bool {
        if !elem.is_active(next) {
            return false;
        }
        elem.genmask.toggle(next);
        true
    }

    /// Unlinks `elem` from the backend.
    fn remove(&self, elem: &Arc<SetElem>);

    /// Exact match on key and flags, in generation `mask`.
    fn get(&self, key: &[u8], flags: ElemFlags, mask: Genmask) -> Option<Arc<SetElem>>;

    /// Packet-path match, in generation `mask`.
    fn lookup(&self, key: &[u8], mask: Genmask) -> Option<Arc<SetElem>>;

    /// Visits every unexpired element active in `mask`.
    fn walk(&self, mask: Genmask, f: &mut dyn FnMut(&Arc<SetElem>) -> Result<()>) -> Result<()>;

    /// Claims expired elements active in `mask` for collection.
    fn gc_scan(&self, _mask: Genmask, _now: Instant) -> Vec<Arc<SetElem>> {
        Vec::new()
    }

    /// Number of stored elements, whatever their generation.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the backend and returns what it held.
    fn drain(&self) -> Vec<Arc<SetElem>>;
}

/// Picks the backend for a set declared with `params` under `policy`.
///
/// Fails with `Unsupported` when no registered backend can hold it.
pub fn select_backend<'a>(
    types: impl Iterator<Item = &'a Arc<dyn SetType>>,
    params: &SetParams,
    policy: SetPolicy,
) -> Result<Arc<dyn SetType>> {
    let required = params.flags & SET_FEATURES;
    let mut best: Option<(&'a Arc<dyn SetType>, SetEstimate)> = None;

    for ty in types {
        if !ty.features().contains(required) {
            continue;
        }
        let Some(est) = ty.estimate(params) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((cur, cur_est)) => {
                let key = |e: &SetEstimate| match (policy, params.size) {
                    (SetPolicy::Performance, _) => (e.lookup as u64, e.space as u64),
                    (SetPolicy::Memory, 0) => (e.space as u64, e.lookup as u64),
                    (SetPolicy::Memory, _) => (e.size, 0),
                };
                (key(&est), ty.name()) < (key(cur_est), cur.name())
            }
        };
        if better {
            best = Some((ty, est));
        }
    }

    best.map(|(ty, _)| Arc::clone(ty)).ok_or_else(|| {
        NftError::unsupported(format!(
            "no set backend supports flags {:?} with key length {}",
            params.flags, params.key_len
        ))
    })
}
