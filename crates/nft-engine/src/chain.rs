//! Chains, chain types and loop validation.
//!
//! A chain keeps its rules twice. The control-plane list (`rules`) is what
//! staging edits; it holds every rule whatever its generation. The fast
//! path never walks that list: it reads one of two immutable arrays
//! (`rules_gen`), indexed by the generation cursor. Commit compacts the
//! rules active in the next generation into a fresh array, publishes it
//! in the next slot and hands the array it replaced to the reclaimer.
//!
//! ```text
//!              staging                 commit                  flip
//!   rules  ──► [r1 r2* r3]  ── prepare ──► next = [r1 r3] ─► slot[next]
//!                                                              │
//!   fast path ◄── slot[cur] ◄──────────────────────────────────┘
//! ```

use crate::genmask::{GenBits, Genmask};
use crate::hooks::HookOps;
use crate::rule::{Rule, RuleInfo};
use crate::types::{ChainPolicy, JUMP_STACK_SIZE};
use arc_swap::ArcSwap;
use nft_common::{Extension, Family, HasUse, HookNum, NftError, Result, UseCount};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Immutable rule array published to the fast path.
pub type RuleArray = Arc<Vec<Arc<Rule>>>;

/// A chain type: which hooks a base chain of this type may attach to.
#[derive(Debug)]
pub struct ChainType {
    name: String,
    family: Family,
    hook_mask: u32,
}

impl ChainType {
    pub fn new(name: &str, family: Family, hook_mask: u32) -> Self {
        Self {
            name: name.to_string(),
            family,
            hook_mask,
        }
    }

    pub fn supports(&self, hook: HookNum) -> bool {
        self.hook_mask & hook.mask() != 0
    }
}

impl Extension for ChainType {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> Family {
        self.family
    }
}

fn default_chain_type() -> String {
    "filter".to_string()
}

/// Hook attachment requested for a base chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseHookSpec {
    #[serde(rename = "type", default = "default_chain_type")]
    pub chain_type: String,
    pub hook: HookNum,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub device: Option<String>,
}

impl BaseHookSpec {
    pub fn new(chain_type: &str, hook: HookNum, priority: i32) -> Self {
        Self {
            chain_type: chain_type.to_string(),
            hook,
            priority,
            device: None,
        }
    }

    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }
}

/// Declarative form of a chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    #[serde(default)]
    pub hook: Option<BaseHookSpec>,
    #[serde(default)]
    pub policy: Option<ChainPolicy>,
    #[serde(default)]
    pub udata: Option<Vec<u8>>,
}

impl ChainSpec {
    /// A regular chain, reachable only through jump and goto.
    pub fn regular(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A base chain attached to `hook`.
    pub fn base(name: &str, hook: BaseHookSpec, policy: ChainPolicy) -> Self {
        Self {
            name: name.to_string(),
            hook: Some(hook),
            policy: Some(policy),
            udata: None,
        }
    }
}

/// Hook-related state of a base chain.
pub struct BaseChain {
    ops: HookOps,
    chain_type: Arc<ChainType>,
    policy: AtomicU8,
    registered: AtomicBool,
}

impl BaseChain {
    pub(crate) fn new(ops: HookOps, chain_type: Arc<ChainType>) -> Self {
        Self {
            ops,
            chain_type,
            policy: AtomicU8::new(ChainPolicy::Accept.to_u8()),
            registered: AtomicBool::new(false),
        }
    }

    pub fn ops(&self) -> &HookOps {
        &self.ops
    }

    pub fn hook(&self) -> HookNum {
        self.ops.hooknum
    }

    pub fn chain_type(&self) -> &ChainType {
        &self.chain_type
    }

    pub fn policy(&self) -> ChainPolicy {
        ChainPolicy::from_u8(self.policy.load(Ordering::Acquire))
    }

    pub(crate) fn set_policy(&self, policy: ChainPolicy) {
        self.policy.store(policy.to_u8(), Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Records the registration state; returns the previous one.
    pub(crate) fn set_registered(&self, registered: bool) -> bool {
        self.registered.swap(registered, Ordering::AcqRel)
    }
}

/// Hook attachment as dumped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseChainInfo {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub hook: HookNum,
    pub priority: i32,
    pub device: Option<String>,
    pub policy: ChainPolicy,
}

/// Dump of a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainInfo {
    pub handle: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<BaseChainInfo>,
    #[serde(rename = "use")]
    pub use_count: u32,
    pub rules: Vec<RuleInfo>,
}

/// Where a staged rule goes in the control-plane list.
pub(crate) enum InsertAt {
    Head,
    Tail,
    After(Arc<Rule>),
    Before(Arc<Rule>),
}

/// A named, ordered list of rules.
pub struct Chain {
    handle: u64,
    name: RwLock<String>,
    pub(crate) genmask: GenBits,
    use_count: UseCount,
    base: Option<BaseChain>,
    udata: Option<Vec<u8>>,
    rules: RwLock<Vec<Arc<Rule>>>,
    rules_gen: [ArcSwap<Vec<Arc<Rule>>>; 2],
    rules_next: Mutex<Option<RuleArray>>,
}

impl Chain {
    pub(crate) fn new(handle: u64, name: &str, base: Option<BaseChain>, udata: Option<Vec<u8>>) -> Self {
        let empty: RuleArray = Arc::new(Vec::new());
        Self {
            handle,
            name: RwLock::new(name.to_string()),
            genmask: GenBits::new(),
            use_count: UseCount::new(),
            base,
            udata,
            rules: RwLock::new(Vec::new()),
            rules_gen: [ArcSwap::new(Arc::clone(&empty)), ArcSwap::new(empty)],
            rules_next: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    pub fn is_base(&self) -> bool {
        self.base.is_some()
    }

    pub fn base(&self) -> Option<&BaseChain> {
        self.base.as_ref()
    }

    /// Base chain policy; `None` for regular chains.
    pub fn policy(&self) -> Option<ChainPolicy> {
        self.base.as_ref().map(BaseChain::policy)
    }

    pub fn udata(&self) -> Option<&[u8]> {
        self.udata.as_deref()
    }

    pub(crate) fn insert_rule(&self, at: InsertAt, rule: Arc<Rule>) {
        let mut rules = self.rules.write();
        let pos = match at {
            InsertAt::Head => 0,
            InsertAt::Tail => rules.len(),
            InsertAt::After(prev) => rules
                .iter()
                .position(|r| Arc::ptr_eq(r, &prev))
                .map_or(rules.len(), |p| p + 1),
            InsertAt::Before(succ) => rules.iter().position(|r| Arc::ptr_eq(r, &succ)).unwrap_or(0),
        };
        rules.insert(pos, rule);
    }

    pub(crate) fn remove_rule(&self, rule: &Arc<Rule>) {
        self.rules.write().retain(|r| !Arc::ptr_eq(r, rule));
    }

    /// Finds a rule by handle, whatever its generation.
    pub fn rule_by_handle(&self, handle: u64) -> Option<Arc<Rule>> {
        self.rules.read().iter().find(|r| r.handle() == handle).cloned()
    }

    /// Rules active in the generation `mask` selects, in list order.
    pub fn active_rules(&self, mask: Genmask) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.is_active(mask))
            .cloned()
            .collect()
    }

    /// Array the fast path reads for generation `gen`.
    pub fn live_rules(&self, gen: u8) -> RuleArray {
        self.rules_gen[usize::from(gen & 1)].load_full()
    }

    /// Compacts the rules active in the next generation into a fresh
    /// array, kept aside until commit publishes it.
    pub(crate) fn prepare_next(&self, next: Genmask) -> Result<()> {
        let rules = self.rules.read();
        let mut compacted = Vec::new();
        compacted.try_reserve_exact(rules.len()).map_err(|_| {
            NftError::exhausted(format!("rule array for chain {}", self.name()))
        })?;
        compacted.extend(rules.iter().filter(|r| r.is_active(next)).cloned());
        *self.rules_next.lock() = Some(Arc::new(compacted));
        Ok(())
    }

    pub(crate) fn cancel_next(&self) {
        *self.rules_next.lock() = None;
    }

    /// Publishes the prepared array (or the current one, if nothing was
    /// prepared) in slot `next_gen`. Returns the array it replaced.
    pub(crate) fn commit_generation(&self, next_gen: u8) -> Option<RuleArray> {
        let next_slot = &self.rules_gen[usize::from(next_gen & 1)];
        let cur = self.rules_gen[usize::from((next_gen ^ 1) & 1)].load_full();
        match self.rules_next.lock().take() {
            Some(prepared) => {
                let old = next_slot.swap(prepared);
                (!Arc::ptr_eq(&old, &cur)).then_some(old)
            }
            None => {
                let published = next_slot.load_full();
                if Arc::ptr_eq(&published, &cur) {
                    return None;
                }
                Some(next_slot.swap(cur))
            }
        }
    }

    /// Drops every rule reference, breaking jump cycles.
    pub(crate) fn clear_rules(&self) {
        self.rules.write().clear();
        let empty: RuleArray = Arc::new(Vec::new());
        self.rules_gen[0].store(Arc::clone(&empty));
        self.rules_gen[1].store(empty);
        self.cancel_next();
    }

    pub(crate) fn destroy(&self) {
        if self.use_count.in_use() {
            tracing::error!(chain = %self.name(), uses = self.use_count.get(), "destroying chain still in use");
        }
        self.clear_rules();
    }

    pub fn info(&self, mask: Genmask) -> ChainInfo {
        ChainInfo {
            handle: self.handle,
            name: self.name(),
            base: self.base.as_ref().map(|b| BaseChainInfo {
                chain_type: b.chain_type.name().to_string(),
                hook: b.ops.hooknum,
                priority: b.ops.priority,
                device: b.ops.device.clone(),
                policy: b.policy(),
            }),
            use_count: self.use_count.get(),
            rules: self.active_rules(mask).iter().map(|r| r.info()).collect(),
        }
    }
}

impl HasUse for Chain {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("handle", &self.handle)
            .field("name", &self.name())
            .field("base", &self.is_base())
            .field("use", &self.use_count.get())
            .finish()
    }
}

/// State of one validation walk.
pub struct ValidateCtx {
    genmask: Genmask,
    hook: Option<HookNum>,
    level: usize,
    path: Vec<u64>,
}

impl ValidateCtx {
    pub(crate) fn new(genmask: Genmask, hook: Option<HookNum>) -> Self {
        Self {
            genmask,
            hook,
            level: 0,
            path: Vec::with_capacity(JUMP_STACK_SIZE),
        }
    }

    /// Jump depth of the chain being walked.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Hook of the base chain the walk started from.
    pub fn hook(&self) -> Option<HookNum> {
        self.hook
    }

    /// Fails unless the walk started at a hook inside `mask`.
    pub fn validate_hooks(&self, mask: u32) -> Result<()> {
        match self.hook {
            Some(hook) if hook.mask() & mask == 0 => Err(NftError::unsupported(format!(
                "expression not allowed at hook {}",
                hook
            ))),
            _ => Ok(()),
        }
    }

    /// Walks a jump or goto target one level deeper.
    pub fn descend(&mut self, chain: &Arc<Chain>) -> Result<()> {
        self.level += 1;
        let res = validate_chain(self, chain);
        self.level -= 1;
        res
    }
}

/// Validates every rule of `chain` active in the next generation,
/// following jumps. Fails with `CycleDetected` on a loop or on nesting
/// deeper than [`JUMP_STACK_SIZE`].
pub(crate) fn validate_chain(ctx: &mut ValidateCtx, chain: &Arc<Chain>) -> Result<()> {
    if ctx.level >= JUMP_STACK_SIZE {
        return Err(NftError::cycle(format!(
            "jump depth exceeds {} at chain {}",
            JUMP_STACK_SIZE,
            chain.name()
        )));
    }
    if ctx.path.contains(&chain.handle()) {
        return Err(NftError::cycle(format!("chain {} jumps back into itself", chain.name())));
    }

    ctx.path.push(chain.handle());
    let res = chain
        .active_rules(ctx.genmask)
        .iter()
        .flat_map(|rule| rule.exprs().iter())
        .try_for_each(|expr| expr.validate(ctx));
    ctx.path.pop();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genmask::GenCursor;

    fn rule(handle: u64) -> Arc<Rule> {
        Arc::new(Rule::new(handle, Vec::new(), Vec::new(), None))
    }

    fn handles(rules: &[Arc<Rule>]) -> Vec<u64> {
        rules.iter().map(|r| r.handle()).collect()
    }

    #[test]
    fn test_insert_positions() {
        let chain = Chain::new(1, "c", None, None);
        let (a, b, c) = (rule(1), rule(2), rule(3));
        chain.insert_rule(InsertAt::Tail, Arc::clone(&a));
        chain.insert_rule(InsertAt::Head, Arc::clone(&b));
        chain.insert_rule(InsertAt::After(Arc::clone(&b)), Arc::clone(&c));
        chain.insert_rule(InsertAt::Before(Arc::clone(&b)), rule(4));

        let cursor = GenCursor::new();
        assert_eq!(handles(&chain.active_rules(cursor.cur_mask())), vec![4, 2, 3, 1]);
        assert!(chain.rule_by_handle(3).is_some());
        chain.remove_rule(&c);
        assert!(chain.rule_by_handle(3).is_none());
    }

    #[test]
    fn test_generation_publish() {
        let cursor = GenCursor::new();
        let chain = Chain::new(1, "c", None, None);
        let r = rule(1);
        r.genmask.activate_next(cursor.cur_mask());
        chain.insert_rule(InsertAt::Tail, Arc::clone(&r));

        chain.prepare_next(cursor.next_mask()).unwrap();
        assert!(chain.commit_generation(cursor.next()).is_none());
        r.genmask.clear(cursor.next_mask());
        cursor.flip();

        assert_eq!(handles(&chain.live_rules(cursor.cur())), vec![1]);
        assert!(chain.live_rules(cursor.next()).is_empty());

        // untouched chain: the next slot catches up with the current one
        let old = chain.commit_generation(cursor.next()).unwrap();
        assert!(old.is_empty());
        assert_eq!(handles(&chain.live_rules(cursor.next())), vec![1]);
        assert!(chain.commit_generation(cursor.next()).is_none());
    }

    #[test]
    fn test_validate_hooks() {
        let ctx = ValidateCtx::new(Genmask::for_gen(1), Some(HookNum::Output));
        assert!(ctx.validate_hooks(HookNum::Output.mask()).is_ok());
        assert!(ctx.validate_hooks(HookNum::Input.mask()).is_err());
        let ctx = ValidateCtx::new(Genmask::for_gen(1), None);
        assert!(ctx.validate_hooks(0).is_ok());
    }
}
