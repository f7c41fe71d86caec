//! Staging API.
//!
//! A [`Batch`] owns the namespace commit mutex from
//! [`Net::begin_transaction`] until it is committed, aborted or dropped.
//! Every staging call either appends records to the transaction log or
//! fails without leaving anything the fast path could observe; the caller
//! then decides whether to go on, commit or abort. Dropping an unfinished
//! batch aborts it.

mod chain;
mod object;
mod set;

pub use chain::{RulePosition, RuleRef, RuleSpec};
pub use set::SetRef;

use crate::genmask::Genmask;
use crate::net::{Net, NetState, TransactionState, ValidateState};
use crate::table::{Table, TableFlags, TableUpdate};
use crate::trans::{Trans, TransOp};
use nft_common::{check_name, Family, HasUse, ModuleRequests, NftError, Result};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// What to do besides unwinding when a batch is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortAction {
    #[default]
    None,
    /// Issue the module requests the batch queued, so a replay can find
    /// the extensions it missed
    Autoload,
    /// Validate after every staged rule in the replayed batch, so the
    /// failing rule is the one reported
    Validate,
}

/// An open transaction.
pub struct Batch<'a> {
    pub(crate) net: &'a Net,
    pub(crate) state: MutexGuard<'a, NetState>,
    finished: bool,
}

impl std::fmt::Debug for Batch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("state", &self.state.tx_state)
            .field("len", &self.state.commit_list.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> Batch<'a> {
    pub(crate) fn new(net: &'a Net, mut state: MutexGuard<'a, NetState>) -> Self {
        state.tx_state = TransactionState::Staging;
        if state.validate_state != ValidateState::Do {
            state.validate_state = ValidateState::Skip;
        }
        Self {
            net,
            state,
            finished: false,
        }
    }

    /// Where the batch is in the commit protocol.
    pub fn state(&self) -> TransactionState {
        self.state.tx_state
    }

    /// Number of staged records.
    pub fn len(&self) -> usize {
        self.state.commit_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.commit_list.is_empty()
    }

    pub(crate) fn cur(&self) -> Genmask {
        self.net.genmask_cur()
    }

    pub(crate) fn next(&self) -> Genmask {
        self.net.genmask_next()
    }

    pub(crate) fn push(&mut self, trans: Trans) {
        tracing::debug!(op = trans.op.kind(), table = trans.table.name(), "staged");
        self.state.commit_list.push(trans);
    }

    /// Module request list to record extension misses in, if autoload is on.
    pub(crate) fn requests(state: &mut NetState, autoload: bool) -> Option<&mut ModuleRequests> {
        autoload.then_some(&mut state.module_requests)
    }

    /// Table live in the next generation.
    pub(crate) fn lookup_table(&self, family: Family, name: &str) -> Result<Arc<Table>> {
        self.net.find_table(family, name, self.next())
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Creates a table; updates its flags if it exists and `exclusive` is
    /// not set.
    pub fn new_table(&mut self, family: Family, name: &str, flags: TableFlags, exclusive: bool) -> Result<u64> {
        check_name("table", name)?;
        if family.is_unspec() {
            return Err(NftError::invalid("table needs a family"));
        }
        if let Ok(table) = self.lookup_table(family, name) {
            if exclusive {
                return Err(NftError::exists("table", name));
            }
            self.update_table(&table, flags)?;
            return Ok(table.handle());
        }

        let handle = self.net.table_handle.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let table = Arc::new(Table::new(handle, name, family, flags, None));
        table.genmask.activate_next(self.cur());
        self.net.tables.write().push(Arc::clone(&table));
        self.push(Trans::new(family, &table, TransOp::NewTable));
        Ok(handle)
    }

    fn update_table(&mut self, table: &Arc<Table>, flags: TableFlags) -> Result<()> {
        if table.pending_update() != TableUpdate::None {
            return Err(NftError::invalid(format!(
                "table {} dormancy already changes in this batch",
                table.name()
            )));
        }
        if flags == table.flags() {
            return Ok(());
        }

        let going_dormant = flags.contains(TableFlags::DORMANT) && !table.is_dormant();
        let waking = !flags.contains(TableFlags::DORMANT) && table.is_dormant();
        if going_dormant {
            table.set_pending_update(TableUpdate::WasAwaken);
        } else if waking {
            table.set_flags(table.flags() - TableFlags::DORMANT);
            if let Err(e) = self.net.table_enable(table) {
                table.set_flags(table.flags() | TableFlags::DORMANT);
                return Err(e);
            }
            table.set_pending_update(TableUpdate::WasDormant);
        }
        self.push(Trans::new(table.family(), table, TransOp::UpdTable));
        Ok(())
    }

    /// Deletes a table and everything in it. With `nonrec`, fails with
    /// `Busy` unless the table is already empty.
    pub fn del_table(&mut self, family: Family, name: &str, nonrec: bool) -> Result<()> {
        let table = self.lookup_table(family, name)?;
        if nonrec && table.use_count().in_use() {
            return Err(NftError::busy(format!("table {} is not empty", name)));
        }
        self.flush_table(&table)
    }

    /// Deletes every table, or every table of `family`.
    pub fn flush_ruleset(&mut self, family: Option<Family>) -> Result<()> {
        let next = self.next();
        let tables: Vec<_> = self
            .net
            .tables
            .read()
            .iter()
            .filter(|t| t.is_active(next) && family.map_or(true, |f| t.family() == f))
            .cloned()
            .collect();
        for table in &tables {
            self.flush_table(table)?;
        }
        Ok(())
    }

    fn flush_table(&mut self, table: &Arc<Table>) -> Result<()> {
        let next = self.next();
        let chains: Vec<_> = table.chains().into_iter().filter(|c| c.is_active(next)).collect();
        for chain in &chains {
            self.delete_chain_rules(table, chain);
        }
        for set in table.sets().iter().filter(|s| s.is_active(next)) {
            if set.is_anonymous() && set.has_bindings() {
                continue;
            }
            self.delete_set(table, set)?;
        }
        for ft in table.flowtables().iter().filter(|f| f.is_active(next)) {
            self.delete_flowtable(table, ft)?;
        }
        for obj in table.objects().iter().filter(|o| o.is_active(next)) {
            self.delete_object(table, obj)?;
        }
        for chain in &chains {
            self.delete_chain(table, chain)?;
        }
        table.genmask.deactivate_next(next);
        self.push(Trans::new(table.family(), table, TransOp::DelTable));
        Ok(())
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(records = self.state.commit_list.len(), "unfinished batch dropped, aborting");
            if let Err(e) = self.abort_locked(AbortAction::None) {
                tracing::error!(error = %e, "abort of dropped batch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::NetBuilder;

    fn net() -> Arc<Net> {
        NetBuilder::new(Arc::new(Registry::with_builtins())).build().unwrap()
    }

    #[test]
    fn test_new_table_exclusive() {
        let net = net();
        let mut batch = net.begin_transaction(0).unwrap();
        batch.new_table(Family::Inet, "filter", TableFlags::empty(), true).unwrap();
        let err = batch
            .new_table(Family::Inet, "filter", TableFlags::empty(), true)
            .unwrap_err();
        assert_eq!(err.kind(), nft_common::ErrorKind::AlreadyExists);
        assert!(batch
            .new_table(Family::Inet, "filter", TableFlags::empty(), false)
            .is_ok());
        assert_eq!(batch.len(), 1);
        batch.commit().unwrap();
        assert!(net.table(Family::Inet, "filter").is_ok());
    }

    #[test]
    fn test_unspec_family_rejected() {
        let net = net();
        let mut batch = net.begin_transaction(0).unwrap();
        assert!(batch.new_table(Family::Unspec, "t", TableFlags::empty(), false).is_err());
        assert!(batch.new_table(Family::Inet, "", TableFlags::empty(), false).is_err());
    }

    #[test]
    fn test_drop_aborts() {
        let net = net();
        {
            let mut batch = net.begin_transaction(0).unwrap();
            batch.new_table(Family::Ipv4, "t", TableFlags::empty(), false).unwrap();
            assert_eq!(batch.state(), TransactionState::Staging);
        }
        assert!(net.tables().is_empty());
        let batch = net.begin_transaction(0).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_double_toggle_rejected() {
        let net = net();
        let mut batch = net.begin_transaction(0).unwrap();
        batch.new_table(Family::Inet, "t", TableFlags::empty(), false).unwrap();
        batch.commit().unwrap();

        let mut batch = net.begin_transaction(0).unwrap();
        batch.new_table(Family::Inet, "t", TableFlags::DORMANT, false).unwrap();
        let err = batch
            .new_table(Family::Inet, "t", TableFlags::empty(), false)
            .unwrap_err();
        assert_eq!(err.kind(), nft_common::ErrorKind::InvalidArgument);
    }
}
