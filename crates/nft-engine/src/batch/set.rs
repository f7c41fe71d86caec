use super::Batch;
use crate::set::name::{alloc_name, is_template};
use crate::set::{select_backend, validate_spec, ElemSpec, Set, SetFlags, SetSpec, SetType};
use crate::table::Table;
use crate::trans::{set_by_id, Trans, TransOp};
use nft_common::{check_name, Extension, Family, HasUse, NftError, Result};
use std::sync::Arc;
use std::time::Instant;

/// How a set is named in element operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetRef {
    Name(String),
    /// Id a set was created with earlier in the batch
    Id(u32),
}

impl From<&str> for SetRef {
    fn from(name: &str) -> Self {
        SetRef::Name(name.to_string())
    }
}

impl From<String> for SetRef {
    fn from(name: String) -> Self {
        SetRef::Name(name)
    }
}

impl Batch<'_> {
    fn resolve_set(&self, table: &Arc<Table>, set: &SetRef) -> Result<Arc<Set>> {
        let next = self.next();
        match set {
            SetRef::Name(name) => table.set_lookup(name, next),
            SetRef::Id(id) => set_by_id(&self.state.commit_list, table, *id)
                .filter(|s| s.is_active(next))
                .ok_or_else(|| NftError::not_found("set", format!("id {}", id))),
        }
    }

    /// Creates a set and returns its name, which for a template is the
    /// expanded one. An existing set is left alone unless `exclusive`.
    pub fn new_set(&mut self, family: Family, table: &str, spec: &SetSpec, exclusive: bool) -> Result<String> {
        let table = self.lookup_table(family, table)?;
        validate_spec(spec)?;
        let next = self.next();

        let name = if is_template(&spec.name) {
            alloc_name(&spec.name, &table.set_names(next), |n| table.set_lookup(n, next).is_ok())?
        } else {
            check_name("set", &spec.name)?;
            if table.set_lookup(&spec.name, next).is_ok() {
                if exclusive {
                    return Err(NftError::exists("set", spec.name.as_str()));
                }
                return Ok(spec.name.clone());
            }
            spec.name.clone()
        };

        let net = self.net;
        let autoload = net.config.autoload;
        if let Some(obj_type) = &spec.obj_type {
            let state = &mut *self.state;
            net.registry
                .lock()
                .objects
                .lookup_or_request(obj_type, family, Batch::requests(state, autoload))?;
        }

        let types: Vec<Arc<dyn SetType>> = net.registry.lock().sets.iter().cloned().collect();
        if types.is_empty() {
            if let Some(requests) = Batch::requests(&mut self.state, autoload) {
                requests.request("nft-set")?;
            }
            return Err(NftError::unsupported("no set backend registered"));
        }
        let params = spec.params();
        let set_type = select_backend(types.iter(), &params, spec.policy)?;
        let backend = set_type.create(&params)?;
        tracing::debug!(set = %name, backend = set_type.name(), "backend selected");

        table.use_count().inc()?;
        let set = Arc::new(Set::new(table.next_handle(), name.clone(), spec, set_type, backend));
        set.genmask.activate_next(self.cur());
        table.add_set(Arc::clone(&set));
        if set.is_anonymous() {
            self.state.binding_list.push(Arc::clone(&set));
        }
        self.push(Trans::new(family, &table, TransOp::NewSet { set, id: spec.id }));
        Ok(name)
    }

    /// Deletes a set; fails with `Busy` while a rule or element still
    /// refers to it.
    pub fn del_set(&mut self, family: Family, table: &str, set: &str) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let set = table.set_lookup(set, self.next())?;
        self.delete_set(&table, &set)
    }

    pub(crate) fn delete_set(&mut self, table: &Arc<Table>, set: &Arc<Set>) -> Result<()> {
        set.ensure_unused("set")?;
        set.genmask.deactivate_next(self.next());
        table.use_count().dec();
        self.push(Trans::new(
            table.family(),
            table,
            TransOp::DelSet {
                set: Arc::clone(set),
            },
        ));
        Ok(())
    }

    /// Constant and anonymous sets are frozen once a rule binds them.
    fn check_mutable(set: &Set) -> Result<()> {
        if set.flags().intersects(SetFlags::CONSTANT | SetFlags::ANONYMOUS) && set.has_bindings() {
            return Err(NftError::busy(format!("set {} is bound and cannot change", set.name())));
        }
        Ok(())
    }

    /// Adds elements. A duplicate key with the same payload is accepted
    /// unless `exclusive`; one with a different payload fails with `Busy`.
    pub fn new_setelems(
        &mut self,
        family: Family,
        table: &str,
        set: impl Into<SetRef>,
        elems: &[ElemSpec],
        exclusive: bool,
    ) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let set = self.resolve_set(&table, &set.into())?;
        Self::check_mutable(&set)?;
        for spec in elems {
            self.new_setelem(&table, &set, spec, exclusive)?;
        }
        Ok(())
    }

    fn new_setelem(&mut self, table: &Arc<Table>, set: &Arc<Set>, spec: &ElemSpec, exclusive: bool) -> Result<()> {
        let next = self.next();
        let obj = match (&spec.obj, set.obj_type()) {
            (Some(name), Some(obj_type)) => Some(table.object_lookup(obj_type, name, next)?),
            (Some(_), None) => {
                return Err(NftError::invalid(format!("set {} does not map to objects", set.name())));
            }
            (None, _) => None,
        };
        let elem = Arc::new(set.build_elem(spec, obj)?);
        if let Some(obj) = elem.obj() {
            obj.use_count().inc()?;
        }
        let undo_obj = |elem: &crate::set::SetElem| {
            if let Some(obj) = elem.obj() {
                obj.use_count().dec();
            }
        };

        elem.genmask.activate_next(self.cur());
        if let Err(existing) = set.backend().insert(Arc::clone(&elem), next) {
            undo_obj(&elem);
            if existing.same_payload(&elem) {
                if exclusive {
                    return Err(NftError::exists("element", format!("{:?} in set {}", spec.key, set.name())));
                }
                return Ok(());
            }
            return Err(NftError::busy(format!(
                "element {:?} in set {} exists with a different payload",
                spec.key,
                set.name()
            )));
        }

        if !elem.is_interval_end() && !set.try_count_elem() {
            set.backend().remove(&elem);
            undo_obj(&elem);
            return Err(NftError::exhausted(format!("set {} is full", set.name())));
        }

        self.push(Trans::new(
            table.family(),
            table,
            TransOp::NewSetElem {
                set: Arc::clone(set),
                elem,
            },
        ));
        Ok(())
    }

    /// Deletes elements by key.
    pub fn del_setelems(&mut self, family: Family, table: &str, set: impl Into<SetRef>, elems: &[ElemSpec]) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let set = self.resolve_set(&table, &set.into())?;
        Self::check_mutable(&set)?;
        let next = self.next();

        for spec in elems {
            if spec.key.len() != set.key_len() as usize {
                return Err(NftError::invalid(format!(
                    "key length {} does not match set {} key length {}",
                    spec.key.len(),
                    set.name(),
                    set.key_len()
                )));
            }
            let elem = set
                .backend()
                .deactivate(&spec.key, spec.flags, next)
                .ok_or_else(|| NftError::not_found("element", format!("{:?} in set {}", spec.key, set.name())))?;
            set.inc_ndeact();
            self.push(Trans::new(
                family,
                &table,
                TransOp::DelSetElem {
                    set: Arc::clone(&set),
                    elem,
                    gc_claimed: false,
                },
            ));
        }
        Ok(())
    }

    /// Deletes every element of a set.
    pub fn flush_set(&mut self, family: Family, table: &str, set: impl Into<SetRef>) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let set = self.resolve_set(&table, &set.into())?;
        Self::check_mutable(&set)?;
        let next = self.next();

        for elem in set.elements(next) {
            if !set.backend().flush_one(&elem, next) {
                continue;
            }
            set.inc_ndeact();
            self.push(Trans::new(
                family,
                &table,
                TransOp::DelSetElem {
                    set: Arc::clone(&set),
                    elem,
                    gc_claimed: false,
                },
            ));
        }
        Ok(())
    }

    /// Stages the removal of every expired element, inside the batch.
    /// Returns how many were staged.
    pub fn gc_sync(&mut self, family: Family, table: &str, set: impl Into<SetRef>) -> Result<usize> {
        let table = self.lookup_table(family, table)?;
        let set = self.resolve_set(&table, &set.into())?;
        let (cur, next) = (self.cur(), self.next());

        let mut staged = 0;
        for elem in set.backend().gc_scan(next, Instant::now()) {
            if !elem.is_active(cur) || !set.backend().flush_one(&elem, next) {
                elem.release_gc();
                continue;
            }
            set.inc_ndeact();
            self.push(Trans::new(
                family,
                &table,
                TransOp::DelSetElem {
                    set: Arc::clone(&set),
                    elem,
                    gc_claimed: true,
                },
            ));
            staged += 1;
        }
        if staged > 0 {
            tracing::debug!(set = set.name(), staged, "expired elements staged for removal");
        }
        Ok(staged)
    }
}
