//! Tables: the per-family container of chains, sets, objects and
//! flowtables.

use crate::chain::{Chain, ChainInfo};
use crate::flowtable::{Flowtable, FlowtableInfo};
use crate::genmask::{GenBits, Genmask};
use crate::object::{Object, ObjectInfo};
use crate::set::{Set, SetInfo};
use bitflags::bitflags;
use nft_common::{Family, HasUse, NameIndex, NftError, Result, UseCount};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

bitflags! {
    /// User visible table flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, serde::Deserialize)]
    pub struct TableFlags: u32 {
        /// Base chains are not attached to their hooks.
        const DORMANT = 0x1;
    }
}

/// Dormancy toggle staged in the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableUpdate {
    None,
    /// Woken up; hooks were registered at staging time
    WasDormant,
    /// Going dormant; hooks are dropped at commit
    WasAwaken,
}

impl TableUpdate {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::WasDormant => 1,
            Self::WasAwaken => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WasDormant,
            2 => Self::WasAwaken,
            _ => Self::None,
        }
    }
}

#[derive(Default)]
pub(crate) struct TableContents {
    chains: Vec<Arc<Chain>>,
    chain_index: NameIndex<Arc<Chain>>,
    sets: Vec<Arc<Set>>,
    objects: Vec<Arc<Object>>,
    flowtables: Vec<Arc<Flowtable>>,
}

/// Dump of a table and everything in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableInfo {
    pub family: Family,
    pub name: String,
    pub handle: u64,
    pub flags: TableFlags,
    #[serde(rename = "use")]
    pub use_count: u32,
    pub chains: Vec<ChainInfo>,
    pub sets: Vec<SetInfo>,
    pub objects: Vec<ObjectInfo>,
    pub flowtables: Vec<FlowtableInfo>,
}

pub struct Table {
    name: String,
    family: Family,
    handle: u64,
    pub(crate) genmask: GenBits,
    flags: AtomicU32,
    update: AtomicU8,
    use_count: UseCount,
    hgenerator: AtomicU64,
    udata: Option<Vec<u8>>,
    contents: RwLock<TableContents>,
}

impl Table {
    pub(crate) fn new(handle: u64, name: &str, family: Family, flags: TableFlags, udata: Option<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            family,
            handle,
            genmask: GenBits::new(),
            flags: AtomicU32::new(flags.bits()),
            update: AtomicU8::new(TableUpdate::None.to_u8()),
            use_count: UseCount::new(),
            hgenerator: AtomicU64::new(0),
            udata,
            contents: RwLock::new(TableContents::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn udata(&self) -> Option<&[u8]> {
        self.udata.as_deref()
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    pub fn flags(&self) -> TableFlags {
        TableFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: TableFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_dormant(&self) -> bool {
        self.flags().contains(TableFlags::DORMANT)
    }

    pub(crate) fn pending_update(&self) -> TableUpdate {
        TableUpdate::from_u8(self.update.load(Ordering::Acquire))
    }

    pub(crate) fn set_pending_update(&self, update: TableUpdate) {
        self.update.store(update.to_u8(), Ordering::Release);
    }

    pub(crate) fn take_pending_update(&self) -> TableUpdate {
        TableUpdate::from_u8(self.update.swap(TableUpdate::None.to_u8(), Ordering::AcqRel))
    }

    /// Allocates a handle for a chain, rule, set, object or flowtable.
    pub(crate) fn next_handle(&self) -> u64 {
        self.hgenerator.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_chain(&self, chain: Arc<Chain>) {
        let mut contents = self.contents.write();
        contents.chain_index.insert(chain.name(), Arc::clone(&chain));
        contents.chains.push(chain);
    }

    pub(crate) fn remove_chain(&self, chain: &Arc<Chain>) {
        let mut contents = self.contents.write();
        contents.chains.retain(|c| !Arc::ptr_eq(c, chain));
        contents.chain_index.remove(&chain.name(), |c| Arc::ptr_eq(c, chain));
    }

    /// Renames `chain` and moves it in the name index.
    pub(crate) fn rename_chain(&self, chain: &Arc<Chain>, new_name: &str) {
        let mut contents = self.contents.write();
        let old_name = chain.name();
        if let Some(entry) = contents.chain_index.remove(&old_name, |c| Arc::ptr_eq(c, chain)) {
            chain.set_name(new_name);
            contents.chain_index.insert(new_name, entry);
        }
    }

    pub fn chain_lookup(&self, name: &str, mask: Genmask) -> Result<Arc<Chain>> {
        self.contents
            .read()
            .chain_index
            .find(name, |c| c.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("chain", name))
    }

    pub fn chain_by_handle(&self, handle: u64, mask: Genmask) -> Result<Arc<Chain>> {
        self.contents
            .read()
            .chains
            .iter()
            .find(|c| c.handle() == handle && c.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("chain", format!("handle {}", handle)))
    }

    /// Every chain, whatever its generation.
    pub fn chains(&self) -> Vec<Arc<Chain>> {
        self.contents.read().chains.clone()
    }

    pub(crate) fn add_set(&self, set: Arc<Set>) {
        self.contents.write().sets.push(set);
    }

    pub(crate) fn remove_set(&self, set: &Arc<Set>) {
        self.contents.write().sets.retain(|s| !Arc::ptr_eq(s, set));
    }

    /// Removes the set whose pointer is `set`; used by bindings, which
    /// hold a plain reference.
    pub(crate) fn remove_set_ptr(&self, set: &Set) {
        self.contents.write().sets.retain(|s| !std::ptr::eq(Arc::as_ptr(s), set));
    }

    pub fn set_lookup(&self, name: &str, mask: Genmask) -> Result<Arc<Set>> {
        self.contents
            .read()
            .sets
            .iter()
            .find(|s| s.name() == name && s.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("set", name))
    }

    pub fn sets(&self) -> Vec<Arc<Set>> {
        self.contents.read().sets.clone()
    }

    /// Names of the sets active in `mask`.
    pub(crate) fn set_names(&self, mask: Genmask) -> Vec<String> {
        self.contents
            .read()
            .sets
            .iter()
            .filter(|s| s.is_active(mask))
            .map(|s| s.name().to_string())
            .collect()
    }

    pub(crate) fn add_object(&self, obj: Arc<Object>) {
        self.contents.write().objects.push(obj);
    }

    pub(crate) fn remove_object(&self, obj: &Arc<Object>) {
        self.contents.write().objects.retain(|o| !Arc::ptr_eq(o, obj));
    }

    pub fn object_lookup(&self, obj_type: &str, name: &str, mask: Genmask) -> Result<Arc<Object>> {
        self.contents
            .read()
            .objects
            .iter()
            .find(|o| o.type_name() == obj_type && o.name() == name && o.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("object", name))
    }

    pub fn objects(&self) -> Vec<Arc<Object>> {
        self.contents.read().objects.clone()
    }

    pub(crate) fn add_flowtable(&self, ft: Arc<Flowtable>) {
        self.contents.write().flowtables.push(ft);
    }

    pub(crate) fn remove_flowtable(&self, ft: &Arc<Flowtable>) {
        self.contents.write().flowtables.retain(|f| !Arc::ptr_eq(f, ft));
    }

    pub fn flowtable_lookup(&self, name: &str, mask: Genmask) -> Result<Arc<Flowtable>> {
        self.contents
            .read()
            .flowtables
            .iter()
            .find(|f| f.name() == name && f.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("flowtable", name))
    }

    pub fn flowtables(&self) -> Vec<Arc<Flowtable>> {
        self.contents.read().flowtables.clone()
    }

    pub(crate) fn destroy(&self) {
        if self.use_count.in_use() {
            tracing::error!(table = %self.name, uses = self.use_count.get(), "destroying table still in use");
        }
    }

    /// Dumps the table with everything visible in `mask`.
    pub fn info(&self, mask: Genmask) -> TableInfo {
        let contents = self.contents.read();
        TableInfo {
            family: self.family,
            name: self.name.clone(),
            handle: self.handle,
            flags: self.flags(),
            use_count: self.use_count.get(),
            chains: contents
                .chains
                .iter()
                .filter(|c| c.is_active(mask))
                .map(|c| c.info(mask))
                .collect(),
            sets: contents
                .sets
                .iter()
                .filter(|s| s.is_active(mask))
                .map(|s| s.info(mask))
                .collect(),
            objects: contents
                .objects
                .iter()
                .filter(|o| o.is_active(mask))
                .map(|o| o.info())
                .collect(),
            flowtables: contents
                .flowtables
                .iter()
                .filter(|f| f.is_active(mask))
                .map(|f| f.info())
                .collect(),
        }
    }
}

impl HasUse for Table {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("family", &self.family)
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("flags", &self.flags())
            .field("use", &self.use_count.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genmask::GenCursor;

    #[test]
    fn test_chain_index_and_rename() {
        let cursor = GenCursor::new();
        let table = Table::new(1, "filter", Family::Inet, TableFlags::empty(), None);
        let chain = Arc::new(Chain::new(table.next_handle(), "input", None, None));
        table.add_chain(Arc::clone(&chain));

        assert_eq!(table.chain_lookup("input", cursor.cur_mask()).unwrap().handle(), 1);
        table.rename_chain(&chain, "in");
        assert!(table.chain_lookup("input", cursor.cur_mask()).is_err());
        assert_eq!(table.chain_lookup("in", cursor.cur_mask()).unwrap().name(), "in");

        table.remove_chain(&chain);
        assert!(table.chain_lookup("in", cursor.cur_mask()).is_err());
        assert!(table.chains().is_empty());
    }

    #[test]
    fn test_lookup_respects_generation() {
        let cursor = GenCursor::new();
        let table = Table::new(1, "filter", Family::Ipv4, TableFlags::empty(), None);
        let chain = Arc::new(Chain::new(table.next_handle(), "fwd", None, None));
        chain.genmask.activate_next(cursor.cur_mask());
        table.add_chain(chain);

        assert!(table.chain_lookup("fwd", cursor.cur_mask()).is_err());
        assert!(table.chain_lookup("fwd", cursor.next_mask()).is_ok());
    }

    #[test]
    fn test_pending_update() {
        let table = Table::new(1, "t", Family::Ipv6, TableFlags::DORMANT, None);
        assert!(table.is_dormant());
        assert_eq!(table.pending_update(), TableUpdate::None);
        table.set_pending_update(TableUpdate::WasDormant);
        assert_eq!(table.take_pending_update(), TableUpdate::WasDormant);
        assert_eq!(table.pending_update(), TableUpdate::None);
        assert_eq!(table.next_handle(), 1);
        assert_eq!(table.next_handle(), 2);
    }
}
