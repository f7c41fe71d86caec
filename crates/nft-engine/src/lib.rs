//! Transactional packet-filter ruleset engine.
//!
//! A namespace ([`Net`]) holds tables of chains, rules, sets, stateful
//! objects and flowtables. Every change is staged in a [`Batch`] and made
//! visible all at once by [`Batch::commit`], or thrown away by
//! [`Batch::abort`]. Readers on the fast path ([`Net::evaluate`]) see
//! either the whole batch or none of it.
//!
//! # Architecture
//!
//! ```text
//! [Batch] ──stage──> [commit list] ──commit──> [genmask flip] ──> [Reclaimer]
//!    │                                              │
//!    └──abort──> [undo in reverse] ──> [Reclaimer]  └──> [Notifier]
//! ```
//!
//! # Key Components
//!
//! - [`genmask`]: two-bit generation masks and the generation cursor
//! - [`registry`]: expression, set, object and flowtable extensions
//! - [`set`]: set engine with cost-based backend selection
//! - [`chain`]: chains with double-buffered rule arrays
//! - [`batch`] / [`commit`]: staging, commit and abort
//! - [`gc`]: asynchronous collection of expired set elements

pub mod batch;
pub mod chain;
pub mod commit;
pub mod config;
pub mod eval;
pub mod expr;
pub mod flowtable;
pub mod gc;
pub mod genmask;
pub mod hooks;
pub mod net;
pub mod notify;
pub mod object;
pub mod rcu;
pub mod registry;
pub mod release;
pub mod rule;
pub mod ruleset;
pub mod set;
pub mod table;
pub mod trans;
pub mod types;

pub use batch::{AbortAction, Batch, RulePosition, RuleRef, RuleSpec, SetRef};
pub use chain::{BaseHookSpec, Chain, ChainInfo, ChainSpec};
pub use config::EngineConfig;
pub use expr::ExprSpec;
pub use flowtable::{Flowtable, FlowtableSpec};
pub use gc::{GcBatch, GcOutcome};
pub use hooks::{HookOps, HookOwner, HookRegistrar, NoopHooks, RecordingHooks};
pub use net::{Net, NetBuilder, RulesetDump, TransactionState};
pub use notify::{BroadcastNotifier, CollectingNotifier, Event, EventKind, Notifier, NullNotifier};
pub use object::{Object, ObjectSpec};
pub use registry::{Registry, StaticLoader};
pub use rule::RuleInfo;
pub use ruleset::RulesetSpec;
pub use set::{ElemFlags, ElemInfo, ElemSpec, Set, SetFlags, SetPolicy, SetSpec};
pub use table::{Table, TableFlags, TableInfo};
pub use types::{ChainPolicy, Packet, Verdict};

pub use nft_common::{ErrorKind, Family, HookNum, NftError, Result};
