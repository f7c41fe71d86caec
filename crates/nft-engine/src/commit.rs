//! Commit and abort.
//!
//! ```text
//!   Staging ─► Validating ─► Publishing ─► (flip) ─► Releasing ─► Idle
//!      │            │             │
//!      └────────────┴─────────────┴──────► Aborting ───────────► Idle
//! ```
//!
//! Commit may fail only before the generation flip: the binding check,
//! loop validation and rule array preparation all run first. Once the
//! cursor flips, every record is applied and nothing can fail. Abort walks
//! the log backwards and restores what staging changed. Either way the
//! records end up with the reclaimer, which releases what they own after
//! a grace period.

use crate::batch::{AbortAction, Batch};
use crate::chain::{Chain, RuleArray};
use crate::expr::{ExprCtx, TransPhase};
use crate::net::{Net, TransactionState, ValidateState};
use crate::notify::{Event, EventKind};
use crate::release::Deferred;
use crate::table::{Table, TableFlags, TableUpdate};
use crate::trans::{Trans, TransOp};
use itertools::Itertools;
use nft_common::{ErrorKind, Family, HasUse, NftError, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

fn snapshot<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn dec_table_use(table: &Table) -> Result<()> {
    table
        .use_count()
        .dec()
        .map(|_| ())
        .ok_or_else(|| NftError::fatal(format!("table {} use count underflow", table.name())))
}

impl Batch<'_> {
    /// Applies every staged record atomically and returns the new
    /// generation id. On failure the batch is aborted before returning.
    pub fn commit(mut self) -> Result<u32> {
        let res = self.commit_locked();
        if let Err(e) = &res {
            tracing::warn!(error = %e, kind = %e.kind(), "commit failed, aborting batch");
            let action = if e.kind() == ErrorKind::CycleDetected {
                AbortAction::Validate
            } else {
                AbortAction::None
            };
            if let Err(abort_err) = self.abort_locked(action) {
                tracing::error!(error = %abort_err, "abort after failed commit");
            }
        }
        self.mark_finished();
        res
    }

    fn commit_locked(&mut self) -> Result<u32> {
        let net = self.net;
        if self.state.commit_list.is_empty() {
            self.state.module_requests.clear();
            self.state.binding_list.clear();
            self.state.tx_state = TransactionState::Idle;
            return Ok(net.genid());
        }
        let next = self.next();

        for set in self.state.binding_list.iter().filter(|s| s.is_active(next)) {
            if set.is_anonymous() && !set.is_bound() {
                return Err(NftError::invalid(format!("anonymous set {} is not bound", set.name())));
            }
        }

        self.state.tx_state = TransactionState::Validating;
        if self.state.validate_state != ValidateState::Skip {
            let tables: Vec<_> = net.tables.read().iter().filter(|t| t.is_active(next)).cloned().collect();
            for table in &tables {
                net.validate_table(table, next)?;
            }
        }

        self.state.tx_state = TransactionState::Publishing;
        let touched: Vec<Arc<Chain>> = self
            .state
            .commit_list
            .iter()
            .filter_map(Trans::rule_chain)
            .unique_by(|c| Arc::as_ptr(c))
            .cloned()
            .collect();
        for (i, chain) in touched.iter().enumerate() {
            if let Err(e) = chain.prepare_next(next) {
                for done in &touched[..i] {
                    done.cancel_next();
                }
                return Err(e);
            }
        }

        let next_gen = net.gencursor.next();
        let mut old_arrays: Vec<RuleArray> = Vec::new();
        for table in net.tables.read().iter() {
            old_arrays.extend(table.chains().iter().filter_map(|c| c.commit_generation(next_gen)));
        }

        let genid = net.bump_genid();
        net.gc_seq_begin();
        net.gencursor.flip();

        let list = std::mem::take(&mut self.state.commit_list);
        let records = list.len();
        for trans in &list {
            net.emit(commit_one(net, trans));
        }
        net.emit(Event::new(EventKind::NewGen, Family::Unspec, "").handle(u64::from(genid)));
        net.gc_seq_end();

        self.state.tx_state = TransactionState::Releasing;
        net.reclaimer.defer(Deferred::Committed(list));
        if !old_arrays.is_empty() {
            net.reclaimer.defer(Deferred::Rules(old_arrays));
        }

        self.state.binding_list.clear();
        self.state.module_requests.clear();
        self.state.validate_state = ValidateState::Skip;
        self.state.tx_state = TransactionState::Idle;
        tracing::info!(genid, records, "ruleset committed");
        Ok(genid)
    }

    /// Discards every staged record.
    ///
    /// With [`AbortAction::Autoload`] the module requests the batch queued
    /// are issued once the records are unwound, so a replay can find the
    /// extensions it missed.
    pub fn abort(mut self, action: AbortAction) -> Result<()> {
        let res = self.abort_locked(action);
        self.mark_finished();
        if action != AbortAction::Autoload {
            return res;
        }

        let pending = self.state.module_requests.pending();
        if !pending.is_empty() {
            let loader = Arc::clone(&self.net.loader);
            parking_lot::MutexGuard::unlocked(&mut self.state, || {
                for module in &pending {
                    let status = loader.request(module);
                    tracing::info!(module = module.as_str(), ?status, "module requested");
                }
            });
            for module in &pending {
                self.state.module_requests.mark_done(module);
            }
        }
        res
    }

    pub(crate) fn abort_locked(&mut self, action: AbortAction) -> Result<()> {
        let net = self.net;
        self.state.tx_state = TransactionState::Aborting;

        let mut list = std::mem::take(&mut self.state.commit_list);
        let records = list.len();
        let mut first_err = None;
        for trans in list.iter().rev() {
            if let Err(e) = abort_one(net, trans) {
                tracing::error!(op = trans.op.kind(), table = trans.table.name(), error = %e, "abort failed");
                first_err.get_or_insert(e);
            }
        }
        list.reverse();
        if !list.is_empty() {
            net.reclaimer.defer(Deferred::Aborted(list));
        }

        self.state.binding_list.clear();
        match action {
            AbortAction::Validate => {
                self.state.validate_state = ValidateState::Do;
                self.state.module_requests.clear();
            }
            AbortAction::Autoload => {}
            AbortAction::None => {
                self.state.validate_state = ValidateState::Skip;
                self.state.module_requests.clear();
            }
        }
        self.state.tx_state = TransactionState::Idle;
        tracing::info!(records, ?action, "batch aborted");
        first_err.map_or(Ok(()), Err)
    }
}

/// Applies one record after the flip. The next mask now names the
/// generation that was current before it.
fn commit_one(net: &Net, trans: &Trans) -> Event {
    let next = net.genmask_next();
    let cur = net.genmask_cur();
    let table = &trans.table;
    let event = |kind| Event::new(kind, trans.family, table.name());

    match &trans.op {
        TransOp::NewTable => {
            table.genmask.clear(next);
            event(EventKind::NewTable).name(table.name()).handle(table.handle())
        }
        TransOp::UpdTable => {
            if table.take_pending_update() == TableUpdate::WasAwaken {
                net.table_disable(table);
                table.set_flags(table.flags() | TableFlags::DORMANT);
            }
            event(EventKind::NewTable)
                .name(table.name())
                .handle(table.handle())
                .snapshot(snapshot(&table.flags()))
        }
        TransOp::DelTable => {
            net.tables.write().retain(|t| !Arc::ptr_eq(t, table));
            event(EventKind::DelTable).name(table.name()).handle(table.handle())
        }
        TransOp::NewChain { chain, policy } => {
            chain.genmask.clear(next);
            if let (Some(policy), Some(base)) = (policy, chain.base()) {
                base.set_policy(*policy);
            }
            event(EventKind::NewChain)
                .name(chain.name())
                .handle(chain.handle())
                .snapshot(snapshot(&chain.info(cur)))
        }
        TransOp::UpdChain { chain, name, policy } => {
            if let Some(name) = name {
                table.rename_chain(chain, name);
            }
            if let (Some(policy), Some(base)) = (policy, chain.base()) {
                base.set_policy(*policy);
            }
            event(EventKind::NewChain).name(chain.name()).handle(chain.handle())
        }
        TransOp::DelChain { chain } => {
            net.unregister_chain_hook(chain);
            table.remove_chain(chain);
            event(EventKind::DelChain).name(chain.name()).handle(chain.handle())
        }
        TransOp::NewRule { chain, rule, .. } => {
            rule.genmask.clear(next);
            event(EventKind::NewRule)
                .name(chain.name())
                .handle(rule.handle())
                .snapshot(snapshot(&rule.info()))
        }
        TransOp::DelRule { chain, rule } => {
            chain.remove_rule(rule);
            rule.deactivate_exprs(&ExprCtx::new(net, trans.family, table), TransPhase::Commit);
            event(EventKind::DelRule).name(chain.name()).handle(rule.handle())
        }
        TransOp::NewSet { set, .. } => {
            set.genmask.clear(next);
            if set.is_anonymous() && set.has_bindings() {
                set.clear_bound();
                table.use_count().dec();
            }
            event(EventKind::NewSet)
                .name(set.name())
                .handle(set.handle())
                .snapshot(snapshot(&set.info(cur)))
        }
        TransOp::DelSet { set } => {
            table.remove_set(set);
            set.mark_dead();
            event(EventKind::DelSet).name(set.name()).handle(set.handle())
        }
        TransOp::NewSetElem { set, elem } => {
            set.backend().activate(elem, next);
            event(EventKind::NewSetElem).name(set.name()).snapshot(snapshot(&elem.info()))
        }
        TransOp::DelSetElem { set, elem, .. } => {
            set.backend().remove(elem);
            if !elem.is_interval_end() {
                set.uncount_elem();
            }
            set.dec_ndeact();
            event(EventKind::DelSetElem).name(set.name()).snapshot(snapshot(&elem.info()))
        }
        TransOp::NewObj { obj } => {
            obj.genmask.clear(next);
            event(EventKind::NewObj)
                .name(obj.name())
                .handle(obj.handle())
                .snapshot(snapshot(&obj.info()))
        }
        TransOp::UpdObj { obj, args } => {
            obj.state().apply_update(args);
            event(EventKind::NewObj)
                .name(obj.name())
                .handle(obj.handle())
                .snapshot(snapshot(&obj.info()))
        }
        TransOp::DelObj { obj } => {
            table.remove_object(obj);
            event(EventKind::DelObj).name(obj.name()).handle(obj.handle())
        }
        TransOp::NewFlowtable { ft } => {
            ft.genmask.clear(next);
            event(EventKind::NewFlowtable)
                .name(ft.name())
                .handle(ft.handle())
                .snapshot(snapshot(&ft.info()))
        }
        TransOp::DelFlowtable { ft } => {
            net.unregister_flowtable_hooks(ft);
            table.remove_flowtable(ft);
            event(EventKind::DelFlowtable).name(ft.name()).handle(ft.handle())
        }
    }
}

/// Undoes one record. Runs before any flip, so the next mask still names
/// the generation the batch was building.
fn abort_one(net: &Net, trans: &Trans) -> Result<()> {
    let next = net.genmask_next();
    let table = &trans.table;

    match &trans.op {
        TransOp::NewTable => {
            net.tables.write().retain(|t| !Arc::ptr_eq(t, table));
        }
        TransOp::UpdTable => {
            if table.take_pending_update() == TableUpdate::WasDormant {
                net.table_disable(table);
                table.set_flags(table.flags() | TableFlags::DORMANT);
            }
        }
        TransOp::DelTable => table.genmask.clear(next),
        TransOp::NewChain { chain, .. } => {
            dec_table_use(table)?;
            net.unregister_chain_hook(chain);
            table.remove_chain(chain);
        }
        TransOp::UpdChain { .. } => {}
        TransOp::DelChain { chain } => {
            table.use_count().inc_restore();
            chain.genmask.clear(next);
        }
        TransOp::NewRule { chain, rule, .. } => {
            chain.remove_rule(rule);
            rule.deactivate_exprs(&ExprCtx::new(net, trans.family, table), TransPhase::Abort);
        }
        TransOp::DelRule { rule, .. } => {
            rule.genmask.clear(next);
            rule.activate_exprs(&ExprCtx::new(net, trans.family, table));
        }
        TransOp::NewSet { set, .. } => {
            dec_table_use(table)?;
            if !set.is_bound() {
                table.remove_set(set);
            }
        }
        TransOp::DelSet { set } => {
            set.genmask.clear(next);
            table.use_count().inc_restore();
        }
        TransOp::NewSetElem { set, elem } => {
            if !set.is_bound() {
                set.backend().remove(elem);
                if !elem.is_interval_end() {
                    set.uncount_elem();
                }
            }
        }
        TransOp::DelSetElem { set, elem, gc_claimed } => {
            set.backend().activate(elem, next);
            set.dec_ndeact();
            if *gc_claimed {
                elem.release_gc();
            }
        }
        TransOp::NewObj { obj } => {
            dec_table_use(table)?;
            table.remove_object(obj);
        }
        TransOp::UpdObj { .. } => {}
        TransOp::DelObj { obj } => {
            obj.genmask.clear(next);
            table.use_count().inc_restore();
        }
        TransOp::NewFlowtable { ft } => {
            dec_table_use(table)?;
            net.unregister_flowtable_hooks(ft);
            table.remove_flowtable(ft);
        }
        TransOp::DelFlowtable { ft } => {
            ft.genmask.clear(next);
            table.use_count().inc_restore();
        }
    }
    Ok(())
}

/// Frees what committed deletions still hold.
pub(crate) fn release_committed(list: Vec<Trans>) {
    for trans in list {
        match trans.op {
            TransOp::DelTable => trans.table.destroy(),
            TransOp::DelChain { chain } => chain.destroy(),
            TransOp::DelRule { rule, .. } => rule.destroy(),
            TransOp::DelSet { set } => set.destroy(),
            TransOp::DelSetElem { elem, .. } => elem.destroy(),
            TransOp::DelObj { obj } => obj.destroy(),
            _ => {}
        }
    }
}

/// Frees what aborted creations built. `list` is in unwind order.
pub(crate) fn release_aborted(list: Vec<Trans>) {
    for trans in list {
        match trans.op {
            TransOp::NewTable => trans.table.destroy(),
            TransOp::NewChain { chain, .. } => chain.destroy(),
            TransOp::NewRule { rule, .. } => rule.destroy(),
            TransOp::NewSet { set, .. } => set.destroy(),
            TransOp::NewSetElem { set, elem } => {
                if !set.is_bound() {
                    elem.destroy();
                }
            }
            TransOp::NewObj { obj } => obj.destroy(),
            _ => {}
        }
    }
}
