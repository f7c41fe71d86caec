use super::Batch;
use crate::flowtable::{Flowtable, FlowtableSpec};
use crate::object::{Object, ObjectSpec};
use crate::table::Table;
use crate::trans::{Trans, TransOp};
use nft_common::{check_name, Family, HasUse, NftError, Result, USERDATA_MAXLEN};
use std::sync::Arc;

impl Batch<'_> {
    /// Creates a stateful object. If it exists and `exclusive` is not set,
    /// the arguments are staged as an update applied at commit.
    pub fn new_obj(&mut self, family: Family, table: &str, spec: &ObjectSpec, exclusive: bool) -> Result<u64> {
        let table = self.lookup_table(family, table)?;
        check_name("object", &spec.name)?;
        if spec.udata.as_ref().is_some_and(|u| u.len() > USERDATA_MAXLEN) {
            return Err(NftError::invalid("object user data too long"));
        }
        let next = self.next();

        if let Ok(obj) = table.object_lookup(&spec.obj_type, &spec.name, next) {
            if exclusive {
                return Err(NftError::exists("object", spec.name.as_str()));
            }
            obj.state().validate_update(&spec.args)?;
            self.push(Trans::new(
                family,
                &table,
                TransOp::UpdObj {
                    obj: Arc::clone(&obj),
                    args: spec.args.clone(),
                },
            ));
            return Ok(obj.handle());
        }

        let obj_type = {
            let net = self.net;
            let state = &mut *self.state;
            let cats = net.registry.lock();
            cats.objects
                .lookup_or_request(&spec.obj_type, family, Batch::requests(state, net.config.autoload))?
        };
        let state = obj_type.create(&spec.args)?;

        table.use_count().inc()?;
        let handle = table.next_handle();
        let obj = Arc::new(Object::new(handle, &spec.name, obj_type, state, spec.udata.clone()));
        obj.genmask.activate_next(self.cur());
        table.add_object(Arc::clone(&obj));
        self.push(Trans::new(family, &table, TransOp::NewObj { obj }));
        Ok(handle)
    }

    /// Deletes an object; fails with `Busy` while referenced.
    pub fn del_obj(&mut self, family: Family, table: &str, obj_type: &str, name: &str) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let obj = table.object_lookup(obj_type, name, self.next())?;
        self.delete_object(&table, &obj)
    }

    pub(crate) fn delete_object(&mut self, table: &Arc<Table>, obj: &Arc<Object>) -> Result<()> {
        obj.ensure_unused("object")?;
        obj.genmask.deactivate_next(self.next());
        table.use_count().dec();
        self.push(Trans::new(table.family(), table, TransOp::DelObj { obj: Arc::clone(obj) }));
        Ok(())
    }

    /// Creates a flowtable and attaches its device hooks.
    pub fn new_flowtable(&mut self, family: Family, table: &str, spec: &FlowtableSpec, exclusive: bool) -> Result<u64> {
        let table = self.lookup_table(family, table)?;
        check_name("flowtable", &spec.name)?;
        let next = self.next();

        if let Ok(ft) = table.flowtable_lookup(&spec.name, next) {
            if exclusive {
                return Err(NftError::exists("flowtable", spec.name.as_str()));
            }
            return Ok(ft.handle());
        }
        spec.check()?;

        let ft_type = {
            let net = self.net;
            let state = &mut *self.state;
            let cats = net.registry.lock();
            cats.flowtables
                .lookup_or_request("flowoffload", family, Batch::requests(state, net.config.autoload))?
        };
        ft_type.check(spec)?;

        for other in table.flowtables().iter().filter(|f| f.is_active(next)) {
            let taken = other.devices();
            if let Some(dev) = spec.devices.iter().find(|d| taken.contains(d)) {
                return Err(NftError::exists(
                    "flowtable device",
                    format!("{} (bound to {})", dev, other.name()),
                ));
            }
        }

        table.use_count().inc()?;
        let handle = table.next_handle();
        let ft = Arc::new(Flowtable::new(handle, table.handle(), family, spec, ft_type));
        if let Err(e) = self.net.register_flowtable_hooks(&ft) {
            table.use_count().dec();
            return Err(e);
        }
        ft.genmask.activate_next(self.cur());
        table.add_flowtable(Arc::clone(&ft));
        self.push(Trans::new(family, &table, TransOp::NewFlowtable { ft }));
        Ok(handle)
    }

    /// Deletes a flowtable; fails with `Busy` while referenced.
    pub fn del_flowtable(&mut self, family: Family, table: &str, name: &str) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let ft = table.flowtable_lookup(name, self.next())?;
        self.delete_flowtable(&table, &ft)
    }

    pub(crate) fn delete_flowtable(&mut self, table: &Arc<Table>, ft: &Arc<Flowtable>) -> Result<()> {
        ft.ensure_unused("flowtable")?;
        ft.genmask.deactivate_next(self.next());
        table.use_count().dec();
        self.push(Trans::new(table.family(), table, TransOp::DelFlowtable { ft: Arc::clone(ft) }));
        Ok(())
    }
}
