use super::Batch;
use crate::chain::{validate_chain, BaseChain, Chain, ChainSpec, InsertAt, ValidateCtx};
use crate::expr::{Expr, ExprCtx, ExprInitCtx, ExprSpec, ExprType, TransPhase};
use crate::genmask::Genmask;
use crate::hooks::{HookOps, HookOwner};
use crate::net::{Net, ValidateState};
use crate::rule::Rule;
use crate::table::Table;
use crate::trans::{pending_rename, rule_by_id, Trans, TransOp};
use crate::types::{ChainPolicy, RULE_MAXEXPRS};
use nft_common::{check_name, Family, HasUse, NftError, Result, USERDATA_MAXLEN};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a new rule goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "at", content = "ref")]
pub enum RulePosition {
    #[default]
    Append,
    Prepend,
    /// After the rule with this handle
    After(u64),
    /// Before the rule with this handle
    Before(u64),
    /// After a rule created earlier in the batch with this id
    AfterId(u32),
    /// Before a rule created earlier in the batch with this id
    BeforeId(u32),
    /// In place of the rule with this handle
    Replace(u64),
}

/// Declarative form of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    pub exprs: Vec<ExprSpec>,
    pub position: RulePosition,
    /// Batch-local id later rules may position themselves against
    pub id: Option<u32>,
    pub udata: Option<Vec<u8>>,
}

impl RuleSpec {
    pub fn new(exprs: Vec<ExprSpec>) -> Self {
        Self {
            exprs,
            ..Default::default()
        }
    }

    pub fn position(mut self, position: RulePosition) -> Self {
        self.position = position;
        self
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }
}

/// How a rule to delete is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleRef {
    Handle(u64),
    /// Id of a rule created earlier in the batch
    Id(u32),
}

fn check_udata(udata: Option<&Vec<u8>>) -> Result<()> {
    match udata {
        Some(u) if u.len() > USERDATA_MAXLEN => Err(NftError::invalid("user data too long")),
        _ => Ok(()),
    }
}

fn active_rule(chain: &Chain, handle: u64, next: Genmask) -> Result<Arc<Rule>> {
    chain
        .rule_by_handle(handle)
        .filter(|r| r.is_active(next))
        .ok_or_else(|| NftError::not_found("rule", format!("handle {}", handle)))
}

impl Net {
    /// Walks every chain of `table` live in `mask`, following jumps.
    pub(crate) fn validate_table(&self, table: &Table, mask: Genmask) -> Result<()> {
        for chain in table.chains().iter().filter(|c| c.is_active(mask)) {
            let hook = chain.base().map(BaseChain::hook);
            let mut ctx = ValidateCtx::new(mask, hook);
            validate_chain(&mut ctx, chain).map_err(|e| {
                tracing::debug!(table = table.name(), chain = %chain.name(), error = %e, "validation failed");
                e
            })?;
            std::thread::yield_now();
        }
        Ok(())
    }
}

impl Batch<'_> {
    /// Creates a chain. If it exists and `exclusive` is not set, a policy
    /// in `spec` is staged as an update instead.
    pub fn new_chain(&mut self, family: Family, table: &str, spec: &ChainSpec, exclusive: bool) -> Result<u64> {
        let table = self.lookup_table(family, table)?;
        check_name("chain", &spec.name)?;
        check_udata(spec.udata.as_ref())?;
        let next = self.next();

        if let Ok(chain) = table.chain_lookup(&spec.name, next) {
            if exclusive {
                return Err(NftError::exists("chain", spec.name.as_str()));
            }
            self.update_chain(&table, &chain, spec)?;
            return Ok(chain.handle());
        }

        let handle = table.next_handle();
        let base = match &spec.hook {
            Some(hook) => {
                if family == Family::Netdev && hook.device.is_none() {
                    return Err(NftError::invalid("netdev base chain needs a device"));
                }
                let chain_type = {
                    let net = self.net;
                    let state = &mut *self.state;
                    let cats = net.registry.lock();
                    cats.chains.lookup_or_request(
                        &hook.chain_type,
                        family,
                        Batch::requests(state, net.config.autoload),
                    )?
                };
                if !chain_type.supports(hook.hook) {
                    return Err(NftError::unsupported(format!(
                        "chain type {} cannot attach to hook {}",
                        hook.chain_type, hook.hook
                    )));
                }
                let ops = HookOps {
                    family,
                    hooknum: hook.hook,
                    priority: hook.priority,
                    device: hook.device.clone(),
                    owner: HookOwner::Chain {
                        table: table.handle(),
                        chain: handle,
                    },
                };
                Some(BaseChain::new(ops, chain_type))
            }
            None if spec.policy.is_some() => {
                return Err(NftError::unsupported("policy on a regular chain"));
            }
            None => None,
        };

        table.use_count().inc()?;
        let chain = Arc::new(Chain::new(handle, &spec.name, base, spec.udata.clone()));
        if let Err(e) = self.net.register_chain_hook(&table, &chain) {
            table.use_count().dec();
            return Err(e);
        }
        chain.genmask.activate_next(self.cur());
        table.add_chain(Arc::clone(&chain));

        // drop takes effect at commit, once the batch's rules are live
        let policy = spec.policy.filter(|p| *p == ChainPolicy::Drop);
        self.push(Trans::new(family, &table, TransOp::NewChain { chain, policy }));
        Ok(handle)
    }

    fn update_chain(&mut self, table: &Arc<Table>, chain: &Arc<Chain>, spec: &ChainSpec) -> Result<()> {
        match (chain.base(), &spec.hook) {
            (None, Some(_)) => {
                return Err(NftError::exists("chain", spec.name.as_str()));
            }
            (Some(base), Some(hook)) => {
                let ops = base.ops();
                if ops.hooknum != hook.hook || ops.priority != hook.priority || ops.device != hook.device {
                    return Err(NftError::exists("chain", spec.name.as_str()));
                }
            }
            _ => {}
        }
        let Some(policy) = spec.policy else {
            return Ok(());
        };
        if !chain.is_base() {
            return Err(NftError::unsupported("policy on a regular chain"));
        }
        self.push(Trans::new(
            table.family(),
            table,
            TransOp::UpdChain {
                chain: Arc::clone(chain),
                name: None,
                policy: Some(policy),
            },
        ));
        Ok(())
    }

    /// Stages a rename, applied at commit.
    pub fn rename_chain(&mut self, family: Family, table: &str, chain: &str, new_name: &str) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        check_name("chain", new_name)?;
        let next = self.next();
        let target = table.chain_lookup(chain, next)?;
        if chain == new_name {
            return Ok(());
        }
        if table.chain_lookup(new_name, next).is_ok() || pending_rename(&self.state.commit_list, &table, new_name) {
            return Err(NftError::exists("chain", new_name));
        }
        self.push(Trans::new(
            family,
            &table,
            TransOp::UpdChain {
                chain: target,
                name: Some(new_name.to_string()),
                policy: None,
            },
        ));
        Ok(())
    }

    /// Deletes a chain and its rules. With `nonrec`, fails with `Busy`
    /// while the chain still has rules.
    pub fn del_chain(&mut self, family: Family, table: &str, chain: &str, nonrec: bool) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let next = self.next();
        let chain = table.chain_lookup(chain, next)?;
        if nonrec && !chain.active_rules(next).is_empty() {
            return Err(NftError::busy(format!("chain {} has rules", chain.name())));
        }
        self.delete_chain(&table, &chain)
    }

    pub(crate) fn delete_chain(&mut self, table: &Arc<Table>, chain: &Arc<Chain>) -> Result<()> {
        chain.ensure_unused("chain")?;
        self.delete_chain_rules(table, chain);
        table.use_count().dec();
        chain.genmask.deactivate_next(self.next());
        self.push(Trans::new(
            table.family(),
            table,
            TransOp::DelChain {
                chain: Arc::clone(chain),
            },
        ));
        Ok(())
    }

    /// Deletes every rule of a chain.
    pub fn flush_chain(&mut self, family: Family, table: &str, chain: &str) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let chain = table.chain_lookup(chain, self.next())?;
        self.delete_chain_rules(&table, &chain);
        Ok(())
    }

    pub(crate) fn delete_chain_rules(&mut self, table: &Arc<Table>, chain: &Arc<Chain>) {
        for rule in chain.active_rules(self.next()) {
            self.delete_rule(table, chain, rule);
        }
    }

    fn delete_rule(&mut self, table: &Arc<Table>, chain: &Arc<Chain>, rule: Arc<Rule>) {
        rule.genmask.deactivate_next(self.next());
        rule.deactivate_exprs(&ExprCtx::new(self.net, table.family(), table), TransPhase::Prepare);
        self.push(Trans::new(
            table.family(),
            table,
            TransOp::DelRule {
                chain: Arc::clone(chain),
                rule,
            },
        ));
    }

    /// Creates a rule and returns its handle.
    pub fn new_rule(&mut self, family: Family, table: &str, chain: &str, spec: &RuleSpec) -> Result<u64> {
        let table = self.lookup_table(family, table)?;
        let next = self.next();
        let chain = table.chain_lookup(chain, next)?;
        if spec.exprs.len() > RULE_MAXEXPRS {
            return Err(NftError::exhausted(format!(
                "rule has {} expressions, at most {} allowed",
                spec.exprs.len(),
                RULE_MAXEXPRS
            )));
        }
        check_udata(spec.udata.as_ref())?;

        let (at, replaced) = match spec.position {
            RulePosition::Append => (InsertAt::Tail, None),
            RulePosition::Prepend => (InsertAt::Head, None),
            RulePosition::After(handle) => (InsertAt::After(active_rule(&chain, handle, next)?), None),
            RulePosition::Before(handle) => (InsertAt::Before(active_rule(&chain, handle, next)?), None),
            RulePosition::AfterId(id) | RulePosition::BeforeId(id) => {
                let rule = rule_by_id(&self.state.commit_list, &chain, id)
                    .filter(|r| r.is_active(next))
                    .ok_or_else(|| NftError::not_found("rule", format!("id {}", id)))?;
                if matches!(spec.position, RulePosition::AfterId(_)) {
                    (InsertAt::After(rule), None)
                } else {
                    (InsertAt::Before(rule), None)
                }
            }
            RulePosition::Replace(handle) => {
                let old = active_rule(&chain, handle, next)?;
                (InsertAt::After(Arc::clone(&old)), Some(old))
            }
        };

        let (exprs, types) = self.build_exprs(family, &table, &chain, &spec.exprs)?;
        let rule = Arc::new(Rule::new(table.next_handle(), exprs, types, spec.udata.clone()));
        rule.genmask.activate_next(self.cur());
        if rule.needs_validation() && self.state.validate_state == ValidateState::Skip {
            self.state.validate_state = ValidateState::Need;
        }

        if let Some(old) = replaced {
            self.delete_rule(&table, &chain, old);
        }
        chain.insert_rule(at, Arc::clone(&rule));
        let handle = rule.handle();
        self.push(Trans::new(
            family,
            &table,
            TransOp::NewRule {
                chain,
                rule,
                id: spec.id,
            },
        ));

        if self.state.validate_state == ValidateState::Do {
            self.net.validate_table(&table, next)?;
        }
        Ok(handle)
    }

    fn build_exprs(
        &mut self,
        family: Family,
        table: &Arc<Table>,
        chain: &Arc<Chain>,
        specs: &[ExprSpec],
    ) -> Result<(Vec<Box<dyn Expr>>, Vec<Arc<dyn ExprType>>)> {
        let net = self.net;
        let state = &mut *self.state;
        let mut exprs: Vec<Box<dyn Expr>> = Vec::with_capacity(specs.len());
        let mut types: Vec<Arc<dyn ExprType>> = Vec::with_capacity(specs.len());

        for spec in specs {
            let built = {
                let ty = net.registry.lock().exprs.lookup_or_request(
                    &spec.name,
                    family,
                    Batch::requests(state, net.config.autoload),
                );
                ty.and_then(|ty| {
                    let ctx = ExprInitCtx {
                        net,
                        family,
                        table,
                        chain,
                        pending: &state.commit_list,
                    };
                    ty.init(&ctx, &spec.args).map(|expr| (expr, ty))
                })
            };
            match built {
                Ok((expr, ty)) => {
                    exprs.push(expr);
                    types.push(ty);
                }
                Err(e) => {
                    let ctx = ExprCtx::new(net, family, table);
                    for expr in &exprs {
                        expr.deactivate(&ctx, TransPhase::PrepareError);
                        expr.destroy();
                    }
                    return Err(e);
                }
            }
        }
        Ok((exprs, types))
    }

    /// Deletes a rule by handle, or one created earlier in the batch by id.
    pub fn del_rule(&mut self, family: Family, table: &str, chain: &str, rule: RuleRef) -> Result<()> {
        let table = self.lookup_table(family, table)?;
        let next = self.next();
        let chain = table.chain_lookup(chain, next)?;
        let rule = match rule {
            RuleRef::Handle(handle) => active_rule(&chain, handle, next)?,
            RuleRef::Id(id) => rule_by_id(&self.state.commit_list, &chain, id)
                .filter(|r| r.is_active(next))
                .ok_or_else(|| NftError::not_found("rule", format!("id {}", id)))?,
        };
        self.delete_rule(&table, &chain, rule);
        Ok(())
    }
}
