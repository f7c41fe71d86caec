//! Sets, maps and their elements.
//!
//! A set owns one backend instance picked at creation by the cost model
//! in [`backend::select_backend`]. Elements carry their own generation
//! bits, so adding or removing them follows the same staging rules as
//! every other entity: staged inserts are invisible to the current
//! generation, staged deletes to the next one.
//!
//! Sets are referenced by expressions through *bindings*. An anonymous
//! set lives exactly as long as its single binding; a named set is held
//! by its use counter.

mod backend;
mod bitmap;
mod hash;
pub(crate) mod name;
mod rbtree;

pub use backend::{select_backend, SetBackend, SetClass, SetEstimate, SetParams, SetType};
pub use bitmap::BitmapSetType;
pub use hash::HashSetType;
pub use rbtree::RbtreeSetType;

use crate::expr::{ExprCtx, TransPhase};
use crate::genmask::{GenBits, Genmask};
use crate::notify::{Event, EventKind};
use crate::object::Object;
use bitflags::bitflags;
use nft_common::{HasUse, NftError, Result, UseCount, DATA_VALUE_MAXLEN, USERDATA_MAXLEN};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SetFlags: u32 {
        /// Owned by a single rule, named from a template
        const ANONYMOUS = 0x1;
        /// Contents never change once bound
        const CONSTANT = 0x2;
        /// Elements describe ranges
        const INTERVAL = 0x4;
        /// Elements carry data
        const MAP = 0x8;
        /// Elements may expire
        const TIMEOUT = 0x10;
        /// Updated from the packet path
        const EVAL = 0x20;
        /// Elements reference stateful objects
        const OBJECT = 0x40;
    }
}

/// Flags a backend must implement to be considered for a set.
pub const SET_FEATURES: SetFlags = SetFlags::from_bits_truncate(0x4 | 0x8 | 0x10 | 0x40);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ElemFlags: u32 {
        /// Closes the interval opened by the preceding element
        const INTERVAL_END = 0x1;
    }
}

/// Which estimate wins when choosing a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetPolicy {
    #[default]
    Performance,
    Memory,
}

/// Declarative form of a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetSpec {
    /// Name, or a template with one `%d` for anonymous sets
    pub name: String,
    /// Batch-local id other records may refer to
    pub id: Option<u32>,
    pub flags: SetFlags,
    pub key_type: u32,
    pub key_len: u32,
    pub data_type: Option<u32>,
    pub data_len: u32,
    pub obj_type: Option<String>,
    pub policy: SetPolicy,
    /// Maximum element count; 0 is unbounded
    pub size: u32,
    pub timeout_ms: Option<u64>,
    pub gc_interval_ms: Option<u64>,
    pub udata: Option<Vec<u8>>,
}

impl SetSpec {
    pub fn new(name: &str, key_len: u32) -> Self {
        Self {
            name: name.to_string(),
            key_len,
            ..Default::default()
        }
    }

    pub fn flags(mut self, flags: SetFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn map(mut self, data_type: u32, data_len: u32) -> Self {
        self.flags |= SetFlags::MAP;
        self.data_type = Some(data_type);
        self.data_len = data_len;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn policy(mut self, policy: SetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) fn params(&self) -> SetParams {
        SetParams {
            flags: self.flags,
            key_len: self.key_len,
            data_len: self.data_len,
            size: self.size,
        }
    }
}

/// Checks the declaration of a new set.
pub(crate) fn validate_spec(spec: &SetSpec) -> Result<()> {
    let flags = spec.flags;
    if flags.bits() & !SetFlags::all().bits() != 0 {
        return Err(NftError::unsupported(format!("unknown set flags {:#x}", flags.bits())));
    }
    if spec.key_len == 0 || spec.key_len as usize > DATA_VALUE_MAXLEN {
        return Err(NftError::invalid(format!("bad key length {}", spec.key_len)));
    }
    if flags.contains(SetFlags::MAP | SetFlags::OBJECT) {
        return Err(NftError::unsupported("set cannot be both a map and an object map"));
    }
    if flags.contains(SetFlags::EVAL | SetFlags::OBJECT) {
        return Err(NftError::unsupported("object maps cannot be updated from the packet path"));
    }
    if flags.contains(SetFlags::ANONYMOUS | SetFlags::TIMEOUT) && !flags.contains(SetFlags::EVAL) {
        return Err(NftError::unsupported("anonymous sets cannot time out"));
    }
    if flags.contains(SetFlags::CONSTANT | SetFlags::TIMEOUT) {
        return Err(NftError::unsupported("constant sets cannot time out"));
    }

    if flags.contains(SetFlags::MAP) {
        if spec.data_type.is_none() || spec.data_len == 0 || spec.data_len as usize > DATA_VALUE_MAXLEN {
            return Err(NftError::invalid(format!("bad map data length {}", spec.data_len)));
        }
    } else if spec.data_type.is_some() || spec.data_len != 0 {
        return Err(NftError::invalid("data type given for a set that is not a map"));
    }

    match (flags.contains(SetFlags::OBJECT), &spec.obj_type) {
        (true, None) => return Err(NftError::invalid("object map without object type")),
        (false, Some(_)) => return Err(NftError::invalid("object type given for a set that is not an object map")),
        _ => {}
    }

    if (spec.timeout_ms.is_some() || spec.gc_interval_ms.is_some()) && !flags.contains(SetFlags::TIMEOUT) {
        return Err(NftError::invalid("timeout given for a set without timeout support"));
    }
    if spec.udata.as_ref().is_some_and(|u| u.len() > USERDATA_MAXLEN) {
        return Err(NftError::invalid("set user data too long"));
    }
    Ok(())
}

/// Declarative form of a set element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElemSpec {
    pub key: Vec<u8>,
    pub data: Option<Vec<u8>>,
    /// Object referenced by an object map element
    pub obj: Option<String>,
    pub flags: ElemFlags,
    pub timeout_ms: Option<u64>,
    pub expiration_ms: Option<u64>,
    pub udata: Option<Vec<u8>>,
}

impl ElemSpec {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn obj(mut self, name: &str) -> Self {
        self.obj = Some(name.to_string());
        self
    }

    pub fn interval_end(mut self) -> Self {
        self.flags |= ElemFlags::INTERVAL_END;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// One element stored in a set backend.
pub struct SetElem {
    key: Vec<u8>,
    data: Option<Vec<u8>>,
    obj: Option<Arc<Object>>,
    flags: ElemFlags,
    timeout: Option<Duration>,
    expires: Option<Instant>,
    udata: Option<Vec<u8>>,
    pub(crate) genmask: GenBits,
    gc_busy: AtomicBool,
}

/// Dump of an element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElemInfo {
    pub key: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obj: Option<String>,
    pub flags: ElemFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SetElem {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn obj(&self) -> Option<&Arc<Object>> {
        self.obj.as_ref()
    }

    pub fn flags(&self) -> ElemFlags {
        self.flags
    }

    pub fn is_interval_end(&self) -> bool {
        self.flags.contains(ElemFlags::INTERVAL_END)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn udata(&self) -> Option<&[u8]> {
        self.udata.as_deref()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    /// Returns true if `other` carries the same data and object.
    pub(crate) fn same_payload(&self, other: &SetElem) -> bool {
        let same_obj = match (&self.obj, &other.obj) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_obj && self.data == other.data && self.flags == other.flags
    }

    /// Claims the element for a GC batch; false if already claimed.
    pub(crate) fn claim_gc(&self) -> bool {
        !self.gc_busy.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_gc(&self) {
        self.gc_busy.store(false, Ordering::Release);
    }

    /// Gives back what the element holds. Called once, after the grace
    /// period.
    pub(crate) fn destroy(&self) {
        if let Some(obj) = &self.obj {
            obj.use_count().dec();
        }
    }

    pub fn info(&self) -> ElemInfo {
        ElemInfo {
            key: self.key.clone(),
            data: self.data.clone(),
            obj: self.obj.as_ref().map(|o| o.name().to_string()),
            flags: self.flags,
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
        }
    }
}

impl fmt::Debug for SetElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetElem")
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("genmask", &self.genmask.raw())
            .finish()
    }
}

struct SetBinding {
    id: u64,
    chain: u64,
}

/// Dump of a set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetInfo {
    pub handle: u64,
    pub name: String,
    pub flags: SetFlags,
    pub key_type: u32,
    pub key_len: u32,
    pub data_type: Option<u32>,
    pub data_len: u32,
    pub obj_type: Option<String>,
    pub size: u32,
    pub backend: String,
    #[serde(rename = "use")]
    pub use_count: u32,
    pub elements: Vec<ElemInfo>,
}

pub struct Set {
    handle: u64,
    name: String,
    flags: SetFlags,
    key_type: u32,
    key_len: u32,
    data_type: Option<u32>,
    data_len: u32,
    obj_type: Option<String>,
    policy: SetPolicy,
    size: u32,
    timeout: Option<Duration>,
    gc_interval: Option<Duration>,
    udata: Option<Vec<u8>>,
    pub(crate) genmask: GenBits,
    use_count: UseCount,
    nelems: AtomicU32,
    ndeact: AtomicU32,
    dead: AtomicBool,
    bound: AtomicBool,
    destroyed: AtomicBool,
    bindings: Mutex<Vec<SetBinding>>,
    binding_seq: AtomicU64,
    gc_deadline: Mutex<Option<Instant>>,
    set_type: Arc<dyn SetType>,
    backend: Box<dyn SetBackend>,
}

impl Set {
    pub(crate) fn new(
        handle: u64,
        name: String,
        spec: &SetSpec,
        set_type: Arc<dyn SetType>,
        backend: Box<dyn SetBackend>,
    ) -> Self {
        Self {
            handle,
            name,
            flags: spec.flags,
            key_type: spec.key_type,
            key_len: spec.key_len,
            data_type: spec.data_type,
            data_len: spec.data_len,
            obj_type: spec.obj_type.clone(),
            policy: spec.policy,
            size: spec.size,
            timeout: spec.timeout_ms.map(Duration::from_millis),
            gc_interval: spec.gc_interval_ms.map(Duration::from_millis),
            udata: spec.udata.clone(),
            genmask: GenBits::new(),
            use_count: UseCount::new(),
            nelems: AtomicU32::new(0),
            ndeact: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            bindings: Mutex::new(Vec::new()),
            binding_seq: AtomicU64::new(0),
            gc_deadline: Mutex::new(None),
            set_type,
            backend,
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> SetFlags {
        self.flags
    }

    pub fn key_len(&self) -> u32 {
        self.key_len
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn obj_type(&self) -> Option<&str> {
        self.obj_type.as_deref()
    }

    pub fn policy(&self) -> SetPolicy {
        self.policy
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Default element timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags.contains(SetFlags::ANONYMOUS)
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    /// Name of the backend the cost model picked.
    pub fn backend_name(&self) -> &str {
        self.set_type.name()
    }

    pub fn backend(&self) -> &dyn SetBackend {
        self.backend.as_ref()
    }

    pub fn nelems(&self) -> u32 {
        self.nelems.load(Ordering::Acquire)
    }

    pub(crate) fn ndeact(&self) -> u32 {
        self.ndeact.load(Ordering::Acquire)
    }

    /// Counts a new element against the size limit; staged deletions
    /// still hold their slot until commit.
    pub(crate) fn try_count_elem(&self) -> bool {
        if self.size == 0 {
            self.nelems.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let limit = self.size.saturating_add(self.ndeact());
        self.nelems
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    pub(crate) fn uncount_elem(&self) {
        let res = self
            .nelems
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if res.is_err() {
            tracing::error!(set = %self.name, "element count underflow");
        }
    }

    pub(crate) fn inc_ndeact(&self) {
        self.ndeact.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_ndeact(&self) {
        let res = self
            .ndeact
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if res.is_err() {
            tracing::error!(set = %self.name, "deactivated element count underflow");
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Returns true while an anonymous set is bound by a rule of the
    /// batch that created it.
    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub(crate) fn clear_bound(&self) {
        self.bound.store(false, Ordering::Release);
    }

    pub fn has_bindings(&self) -> bool {
        !self.bindings.lock().is_empty()
    }

    /// Chains holding a binding on this set.
    pub fn bound_chains(&self) -> Vec<u64> {
        self.bindings.lock().iter().map(|b| b.chain).collect()
    }

    /// Takes a binding for a lookup in `chain`.
    ///
    /// An anonymous set accepts a single binding.
    pub(crate) fn bind(&self, chain: u64) -> Result<u64> {
        let mut bindings = self.bindings.lock();
        if self.is_anonymous() && !bindings.is_empty() {
            return Err(NftError::busy(format!("anonymous set {} is already bound", self.name)));
        }
        self.use_count.inc()?;
        let id = self.binding_seq.fetch_add(1, Ordering::Relaxed) + 1;
        bindings.push(SetBinding { id, chain });
        if self.is_anonymous() {
            self.bound.store(true, Ordering::Release);
        }
        Ok(id)
    }

    pub(crate) fn activate_binding(&self, next: Genmask) {
        if self.is_anonymous() {
            self.genmask.clear(next);
        }
        self.use_count.inc_restore();
    }

    pub(crate) fn deactivate_binding(&self, ctx: &ExprCtx<'_>, binding: u64, phase: TransPhase) {
        let next = ctx.net.genmask_next();
        match phase {
            TransPhase::PrepareError => {
                if self.is_anonymous() {
                    self.clear_bound();
                    self.genmask.deactivate_next(next);
                } else {
                    self.remove_binding(binding);
                }
                self.use_count.dec();
            }
            TransPhase::Prepare => {
                if self.is_anonymous() {
                    self.genmask.deactivate_next(next);
                }
                self.use_count.dec();
            }
            TransPhase::Abort => {
                self.use_count.dec();
                self.unbind(ctx, binding, false);
            }
            TransPhase::Commit => self.unbind(ctx, binding, true),
        }
    }

    fn remove_binding(&self, binding: u64) -> bool {
        let mut bindings = self.bindings.lock();
        bindings.retain(|b| b.id != binding);
        bindings.is_empty()
    }

    fn unbind(&self, ctx: &ExprCtx<'_>, binding: u64, event: bool) {
        let empty = self.remove_binding(binding);
        if empty && self.is_anonymous() {
            ctx.table.remove_set_ptr(self);
            self.mark_dead();
            if event {
                ctx.net.emit(
                    Event::new(EventKind::DelSet, ctx.family, ctx.table.name())
                        .name(self.name.as_str())
                        .handle(self.handle),
                );
            }
        }
    }

    /// Tears down an anonymous set once its last binding is gone.
    pub(crate) fn destroy_if_unbound(&self) {
        if self.is_anonymous() && !self.has_bindings() {
            self.destroy();
        }
    }

    /// Releases every element. Safe to call more than once.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for elem in self.backend.drain() {
            elem.destroy();
        }
        tracing::debug!(set = %self.name, "set destroyed");
    }

    /// Builds an element from its declaration after checking it against
    /// the set's shape.
    pub(crate) fn build_elem(&self, spec: &ElemSpec, obj: Option<Arc<Object>>) -> Result<SetElem> {
        if spec.key.len() != self.key_len as usize {
            return Err(NftError::invalid(format!(
                "key length {} does not match set {} key length {}",
                spec.key.len(),
                self.name,
                self.key_len
            )));
        }
        let end = spec.flags.contains(ElemFlags::INTERVAL_END);
        if spec.flags.bits() & !ElemFlags::all().bits() != 0 {
            return Err(NftError::unsupported("unknown element flags"));
        }
        if end && !self.flags.contains(SetFlags::INTERVAL) {
            return Err(NftError::invalid("interval end on a set without intervals"));
        }

        if self.flags.contains(SetFlags::MAP) {
            match (&spec.data, end) {
                (None, false) => return Err(NftError::invalid("map element without data")),
                (Some(_), true) => return Err(NftError::invalid("interval end carries data")),
                (Some(data), false) if data.len() != self.data_len as usize => {
                    return Err(NftError::invalid(format!("bad data length {}", data.len())));
                }
                _ => {}
            }
        } else if spec.data.is_some() {
            return Err(NftError::invalid("data given for a set that is not a map"));
        }

        if self.flags.contains(SetFlags::OBJECT) {
            if obj.is_none() && !end {
                return Err(NftError::invalid("object map element without object"));
            }
        } else if obj.is_some() {
            return Err(NftError::invalid("object given for a set that is not an object map"));
        }

        let timeout = match spec.timeout_ms {
            Some(_) if !self.flags.contains(SetFlags::TIMEOUT) => {
                return Err(NftError::invalid("element timeout on a set without timeout support"));
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None if self.flags.contains(SetFlags::TIMEOUT) => self.timeout,
            None => None,
        };
        let expiration = match spec.expiration_ms {
            Some(_) if !self.flags.contains(SetFlags::TIMEOUT) => {
                return Err(NftError::invalid("element expiration on a set without timeout support"));
            }
            Some(ms) => {
                let exp = Duration::from_millis(ms);
                if timeout.map_or(true, |t| exp > t) {
                    return Err(NftError::invalid("expiration beyond timeout"));
                }
                Some(exp)
            }
            None => timeout,
        };
        if spec.udata.as_ref().is_some_and(|u| u.len() > USERDATA_MAXLEN) {
            return Err(NftError::invalid("element user data too long"));
        }

        Ok(SetElem {
            key: spec.key.clone(),
            data: spec.data.clone(),
            obj,
            flags: spec.flags,
            timeout,
            expires: expiration.and_then(|e| Instant::now().checked_add(e)),
            udata: spec.udata.clone(),
            genmask: GenBits::new(),
            gc_busy: AtomicBool::new(false),
        })
    }

    /// Elements visible in `mask`.
    pub fn elements(&self, mask: Genmask) -> Vec<Arc<SetElem>> {
        let mut elems = Vec::new();
        let res = self.backend.walk(mask, &mut |e| {
            elems.push(Arc::clone(e));
            Ok(())
        });
        if let Err(e) = res {
            tracing::warn!(set = %self.name, error = %e, "element walk failed");
        }
        elems
    }

    /// Returns true if a periodic scan is due; arms the next deadline.
    pub(crate) fn gc_due(&self, now: Instant, default_interval: Duration) -> bool {
        let mut deadline = self.gc_deadline.lock();
        match *deadline {
            Some(at) if at > now => false,
            _ => {
                *deadline = Some(now + self.gc_interval.unwrap_or(default_interval));
                true
            }
        }
    }

    pub fn info(&self, mask: Genmask) -> SetInfo {
        SetInfo {
            handle: self.handle,
            name: self.name.clone(),
            flags: self.flags,
            key_type: self.key_type,
            key_len: self.key_len,
            data_type: self.data_type,
            data_len: self.data_len,
            obj_type: self.obj_type.clone(),
            size: self.size,
            backend: self.backend_name().to_string(),
            use_count: self.use_count.get(),
            elements: self.elements(mask).iter().map(|e| e.info()).collect(),
        }
    }
}

impl HasUse for Set {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }
}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Set")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("backend", &self.backend_name())
            .field("nelems", &self.nelems())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hash_set(spec: &SetSpec) -> Set {
        let ty: Arc<dyn SetType> = Arc::new(HashSetType);
        let backend = ty.create(&spec.params()).unwrap();
        Set::new(1, spec.name.clone(), spec, ty, backend)
    }

    #[test]
    fn test_validate_spec() {
        assert!(validate_spec(&SetSpec::new("s", 4)).is_ok());
        assert!(validate_spec(&SetSpec::new("s", 0)).is_err());
        assert!(validate_spec(&SetSpec::new("s", 65)).is_err());

        let both = SetSpec::new("s", 4).flags(SetFlags::MAP | SetFlags::OBJECT);
        assert_eq!(validate_spec(&both).unwrap_err().kind(), nft_common::ErrorKind::Unsupported);

        let anon_timeout = SetSpec::new("s", 4).flags(SetFlags::ANONYMOUS | SetFlags::TIMEOUT);
        assert!(validate_spec(&anon_timeout).is_err());
        let constant_timeout = SetSpec::new("s", 4).flags(SetFlags::CONSTANT | SetFlags::TIMEOUT);
        assert!(validate_spec(&constant_timeout).is_err());

        let mut data_no_map = SetSpec::new("s", 4);
        data_no_map.data_type = Some(1);
        assert!(validate_spec(&data_no_map).is_err());
        assert!(validate_spec(&SetSpec::new("m", 4).map(1, 4)).is_ok());

        let timeout_no_flag = SetSpec::new("s", 4).timeout(Duration::from_secs(1));
        assert!(validate_spec(&timeout_no_flag).is_err());

        let obj_no_type = SetSpec::new("s", 4).flags(SetFlags::OBJECT);
        assert!(validate_spec(&obj_no_type).is_err());
    }

    #[test]
    fn test_build_elem_checks() {
        let set = hash_set(&SetSpec::new("m", 2).map(1, 1));
        assert!(set.build_elem(&ElemSpec::key([1, 2]).data([9]), None).is_ok());
        assert!(set.build_elem(&ElemSpec::key([1, 2]), None).is_err());
        assert!(set.build_elem(&ElemSpec::key([1]).data([9]), None).is_err());
        assert!(set.build_elem(&ElemSpec::key([1, 2]).data([9, 9]), None).is_err());
        assert!(set.build_elem(&ElemSpec::key([1, 2]).interval_end(), None).is_err());

        let plain = hash_set(&SetSpec::new("s", 1));
        assert!(plain.build_elem(&ElemSpec::key([1]).data([1]), None).is_err());
        assert!(plain.build_elem(&ElemSpec::key([1]).timeout(Duration::from_secs(1)), None).is_err());
    }

    #[test]
    fn test_default_timeout_applies() {
        let spec = SetSpec::new("t", 1)
            .flags(SetFlags::TIMEOUT)
            .timeout(Duration::from_secs(30));
        let set = hash_set(&spec);
        let elem = set.build_elem(&ElemSpec::key([1]), None).unwrap();
        assert_eq!(elem.timeout(), Some(Duration::from_secs(30)));
        assert!(!elem.is_expired(Instant::now()));

        let mut late = ElemSpec::key([2]).timeout(Duration::from_secs(1));
        late.expiration_ms = Some(5000);
        assert!(set.build_elem(&late, None).is_err());
    }

    #[test]
    fn test_size_accounting() {
        let set = hash_set(&SetSpec::new("s", 1).size(2));
        assert!(set.try_count_elem());
        assert!(set.try_count_elem());
        assert!(!set.try_count_elem());

        set.inc_ndeact();
        assert!(set.try_count_elem());
        set.dec_ndeact();
        set.uncount_elem();
        assert_eq!(set.nelems(), 2);
    }

    #[test]
    fn test_anonymous_single_binding() {
        let set = hash_set(&SetSpec::new("__set0", 1).flags(SetFlags::ANONYMOUS | SetFlags::CONSTANT));
        set.bind(7).unwrap();
        assert!(set.is_bound());
        assert_eq!(set.bound_chains(), vec![7]);
        assert_eq!(set.bind(8).unwrap_err().kind(), nft_common::ErrorKind::Busy);
        assert_eq!(set.use_count().get(), 1);
    }
}
