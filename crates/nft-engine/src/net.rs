//! One ruleset namespace.
//!
//! [`Net`] owns the table list, the generation cursor, the commit mutex
//! and the collaborators (hook registrar, notifier, module loader). All
//! mutation goes through a [`Batch`] obtained from
//! [`Net::begin_transaction`], which holds the commit mutex for its whole
//! lifetime. Queries and the fast path never take that mutex.

use crate::batch::Batch;
use crate::chain::Chain;
use crate::config::EngineConfig;
use crate::flowtable::Flowtable;
use crate::gc::GcWorker;
use crate::genmask::{GenCursor, Genmask};
use crate::hooks::{HookRegistrar, NoopHooks};
use crate::notify::{Event, Notifier, NullNotifier};
use crate::object::Object;
use crate::rcu::Rcu;
use crate::registry::Registry;
use crate::release::Reclaimer;
use crate::rule::RuleInfo;
use crate::set::{ElemInfo, Set};
use crate::table::{Table, TableInfo};
use crate::trans::Trans;
use nft_common::{Family, ModuleLoader, ModuleRequests, NftError, NoLoader, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Where the namespace is in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Idle,
    Staging,
    Validating,
    Publishing,
    Releasing,
    Aborting,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Staging => "staging",
            Self::Validating => "validating",
            Self::Publishing => "publishing",
            Self::Releasing => "releasing",
            Self::Aborting => "aborting",
        };
        f.write_str(s)
    }
}

/// Whether commit has to run loop validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ValidateState {
    /// Nothing staged needs it
    #[default]
    Skip,
    /// Run it once at commit
    Need,
    /// Run it after every staged rule
    Do,
}

/// State guarded by the commit mutex.
pub(crate) struct NetState {
    pub commit_list: Vec<Trans>,
    /// Anonymous sets created in this batch; each must end up bound
    pub binding_list: Vec<Arc<Set>>,
    pub module_requests: ModuleRequests,
    pub validate_state: ValidateState,
    pub tx_state: TransactionState,
}

impl Default for NetState {
    fn default() -> Self {
        Self {
            commit_list: Vec::new(),
            binding_list: Vec::new(),
            module_requests: ModuleRequests::new(),
            validate_state: ValidateState::Skip,
            tx_state: TransactionState::Idle,
        }
    }
}

/// Everything visible in the current generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RulesetDump {
    pub genid: u32,
    pub tables: Vec<TableInfo>,
}

/// Builder for [`Net`].
pub struct NetBuilder {
    config: EngineConfig,
    registry: Arc<Registry>,
    hooks: Arc<dyn HookRegistrar>,
    notifier: Arc<dyn Notifier>,
    loader: Arc<dyn ModuleLoader>,
}

impl NetBuilder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            config: EngineConfig::default(),
            registry,
            hooks: Arc::new(NoopHooks),
            notifier: Arc::new(NullNotifier),
            loader: Arc::new(NoLoader),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn HookRegistrar>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Starts the reclaimer and GC threads and returns the namespace.
    pub fn build(self) -> Result<Arc<Net>> {
        let rcu = Arc::new(Rcu::new());
        let reclaimer = Reclaimer::spawn(Arc::clone(&rcu))
            .map_err(|e| NftError::exhausted(format!("cannot start reclaimer: {}", e)))?;
        let mut spawn_err = None;
        let net = Arc::new_cyclic(|weak| {
            let gc = match GcWorker::spawn(weak.clone(), &self.config) {
                Ok(gc) => Some(gc),
                Err(e) => {
                    spawn_err = Some(e);
                    None
                }
            };
            Net {
                config: self.config,
                registry: self.registry,
                hooks: self.hooks,
                notifier: self.notifier,
                loader: self.loader,
                state: Mutex::new(NetState::default()),
                tables: RwLock::new(Vec::new()),
                table_handle: AtomicU64::new(0),
                gencursor: GenCursor::new(),
                base_seq: AtomicU32::new(1),
                gc_seq: AtomicU32::new(0),
                rcu,
                reclaimer,
                gc,
            }
        });
        if let Some(e) = spawn_err {
            return Err(NftError::exhausted(format!("cannot start gc worker: {}", e)));
        }
        tracing::info!(gc_worker = net.config.gc_worker, autoload = net.config.autoload, "ruleset namespace ready");
        Ok(net)
    }
}

pub struct Net {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) hooks: Arc<dyn HookRegistrar>,
    notifier: Arc<dyn Notifier>,
    pub(crate) loader: Arc<dyn ModuleLoader>,
    pub(crate) state: Mutex<NetState>,
    pub(crate) tables: RwLock<Vec<Arc<Table>>>,
    pub(crate) table_handle: AtomicU64,
    pub(crate) gencursor: GenCursor,
    base_seq: AtomicU32,
    pub(crate) gc_seq: AtomicU32,
    pub(crate) rcu: Arc<Rcu>,
    pub(crate) reclaimer: Reclaimer,
    pub(crate) gc: Option<GcWorker>,
}

impl Net {
    /// Opens a batch.
    ///
    /// `genid` is the generation the caller last saw; a non-zero value
    /// that no longer matches fails with `Busy`. Blocks while another
    /// batch is open.
    pub fn begin_transaction(&self, genid: u32) -> Result<Batch<'_>> {
        let state = self.state.lock();
        let cur = self.genid();
        if genid != 0 && genid != cur {
            return Err(NftError::busy(format!(
                "ruleset changed: generation {} is now {}",
                genid, cur
            )));
        }
        Ok(Batch::new(self, state))
    }

    /// Generation id; bumped by every commit that publishes, never 0.
    pub fn genid(&self) -> u32 {
        self.base_seq.load(Ordering::Acquire)
    }

    /// Index (0 or 1) of the generation readers currently see; the key
    /// for [`Chain::live_rules`].
    pub fn generation(&self) -> u8 {
        self.gencursor.cur()
    }

    pub(crate) fn bump_genid(&self) -> u32 {
        loop {
            let seq = self.base_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    pub(crate) fn gc_seq_begin(&self) -> u32 {
        loop {
            let seq = self.gc_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    pub(crate) fn gc_seq_end(&self) {
        self.gc_seq.fetch_add(1, Ordering::AcqRel);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn genmask_cur(&self) -> Genmask {
        self.gencursor.cur_mask()
    }

    pub(crate) fn genmask_next(&self) -> Genmask {
        self.gencursor.next_mask()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.notifier.emit(event);
    }

    /// Waits until everything committed or aborted so far is released.
    pub fn barrier(&self) {
        self.reclaimer.barrier();
    }

    pub(crate) fn register_chain_hook(&self, table: &Table, chain: &Chain) -> Result<()> {
        let Some(base) = chain.base() else {
            return Ok(());
        };
        if table.is_dormant() || base.is_registered() {
            return Ok(());
        }
        self.hooks.register(base.ops())?;
        base.set_registered(true);
        Ok(())
    }

    pub(crate) fn unregister_chain_hook(&self, chain: &Chain) {
        if let Some(base) = chain.base() {
            if base.set_registered(false) {
                self.hooks.unregister(base.ops());
            }
        }
    }

    /// Attaches every base chain of a table that is waking up.
    pub(crate) fn table_enable(&self, table: &Table) -> Result<()> {
        let next = self.genmask_next();
        let chains: Vec<_> = table
            .chains()
            .into_iter()
            .filter(|c| c.is_base() && c.is_active(next))
            .collect();
        for (i, chain) in chains.iter().enumerate() {
            if let Err(e) = self.register_chain_hook(table, chain) {
                for done in &chains[..i] {
                    self.unregister_chain_hook(done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn table_disable(&self, table: &Table) {
        for chain in table.chains().iter().filter(|c| c.is_base()) {
            self.unregister_chain_hook(chain);
        }
    }

    pub(crate) fn register_flowtable_hooks(&self, ft: &Flowtable) -> Result<()> {
        let hooks = ft.hooks();
        for (i, ops) in hooks.iter().enumerate() {
            if let Err(e) = self.hooks.register(ops) {
                for done in &hooks[..i] {
                    self.hooks.unregister(done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn unregister_flowtable_hooks(&self, ft: &Flowtable) {
        for ops in ft.hooks() {
            self.hooks.unregister(&ops);
        }
    }

    /// A network device went away: detach every hook bound to it.
    ///
    /// Takes the commit mutex; must not be called with a batch open on
    /// the same thread.
    pub fn netdev_unregister(&self, device: &str) {
        let _state = self.state.lock();
        let tables = self.tables.read().clone();
        for table in tables {
            for ft in table.flowtables() {
                if let Some(ops) = ft.take_device_hook(device) {
                    self.hooks.unregister(&ops);
                    tracing::info!(table = table.name(), flowtable = ft.name(), device, "device removed from flowtable");
                }
            }
            if table.family() != Family::Netdev {
                continue;
            }
            for chain in table.chains() {
                let on_device = chain
                    .base()
                    .is_some_and(|b| b.ops().device.as_deref() == Some(device));
                if on_device {
                    self.unregister_chain_hook(&chain);
                    tracing::info!(table = table.name(), chain = %chain.name(), device, "device hook detached");
                }
            }
        }
    }

    pub(crate) fn find_table(&self, family: Family, name: &str, mask: Genmask) -> Result<Arc<Table>> {
        self.tables
            .read()
            .iter()
            .find(|t| t.family() == family && t.name() == name && t.is_active(mask))
            .cloned()
            .ok_or_else(|| NftError::not_found("table", name))
    }

    /// Tables visible in the current generation.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        let cur = self.genmask_cur();
        self.tables
            .read()
            .iter()
            .filter(|t| t.is_active(cur))
            .cloned()
            .collect()
    }

    pub fn table(&self, family: Family, name: &str) -> Result<Arc<Table>> {
        self.find_table(family, name, self.genmask_cur())
    }

    pub fn chain(&self, family: Family, table: &str, chain: &str) -> Result<Arc<Chain>> {
        self.table(family, table)?.chain_lookup(chain, self.genmask_cur())
    }

    /// Rules of a chain as the current generation sees them.
    pub fn chain_rules(&self, family: Family, table: &str, chain: &str) -> Result<Vec<RuleInfo>> {
        let chain = self.chain(family, table, chain)?;
        Ok(chain
            .active_rules(self.genmask_cur())
            .iter()
            .map(|r| r.info())
            .collect())
    }

    pub fn set(&self, family: Family, table: &str, set: &str) -> Result<Arc<Set>> {
        self.table(family, table)?.set_lookup(set, self.genmask_cur())
    }

    pub fn set_elements(&self, family: Family, table: &str, set: &str) -> Result<Vec<ElemInfo>> {
        let set = self.set(family, table, set)?;
        Ok(set
            .elements(self.genmask_cur())
            .iter()
            .map(|e| e.info())
            .collect())
    }

    pub fn object(&self, family: Family, table: &str, obj_type: &str, name: &str) -> Result<Arc<Object>> {
        self.table(family, table)?
            .object_lookup(obj_type, name, self.genmask_cur())
    }

    pub fn flowtable(&self, family: Family, table: &str, name: &str) -> Result<Arc<Flowtable>> {
        self.table(family, table)?
            .flowtable_lookup(name, self.genmask_cur())
    }

    /// Snapshot of the current generation.
    pub fn dump(&self) -> RulesetDump {
        let cur = self.genmask_cur();
        RulesetDump {
            genid: self.genid(),
            tables: self.tables().iter().map(|t| t.info(cur)).collect(),
        }
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        // jump verdicts keep their target chains alive
        for table in self.tables.get_mut().drain(..) {
            for chain in table.chains() {
                chain.clear_rules();
            }
        }
    }
}

impl fmt::Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("genid", &self.genid())
            .field("gencursor", &self.gencursor.cur())
            .field("tables", &self.tables.read().len())
            .finish()
    }
}
