//! Transaction records.
//!
//! Every staged change appends one [`Trans`] to the namespace log. Commit
//! walks the log forward, abort walks it backward, and after the grace
//! period the reclaimer releases whatever the records still own.

use crate::chain::Chain;
use crate::expr::ExprArgs;
use crate::flowtable::Flowtable;
use crate::object::Object;
use crate::rule::Rule;
use crate::set::{Set, SetElem};
use crate::table::Table;
use crate::types::ChainPolicy;
use nft_common::Family;
use std::fmt;
use std::sync::Arc;

pub(crate) enum TransOp {
    NewTable,
    UpdTable,
    DelTable,
    NewChain {
        chain: Arc<Chain>,
        /// Policy applied at commit
        policy: Option<ChainPolicy>,
    },
    UpdChain {
        chain: Arc<Chain>,
        name: Option<String>,
        policy: Option<ChainPolicy>,
    },
    DelChain {
        chain: Arc<Chain>,
    },
    NewRule {
        chain: Arc<Chain>,
        rule: Arc<Rule>,
        id: Option<u32>,
    },
    DelRule {
        chain: Arc<Chain>,
        rule: Arc<Rule>,
    },
    NewSet {
        set: Arc<Set>,
        id: Option<u32>,
    },
    DelSet {
        set: Arc<Set>,
    },
    NewSetElem {
        set: Arc<Set>,
        elem: Arc<SetElem>,
    },
    DelSetElem {
        set: Arc<Set>,
        elem: Arc<SetElem>,
        /// The element's GC claim was taken by this record
        gc_claimed: bool,
    },
    NewObj {
        obj: Arc<Object>,
    },
    UpdObj {
        obj: Arc<Object>,
        args: ExprArgs,
    },
    DelObj {
        obj: Arc<Object>,
    },
    NewFlowtable {
        ft: Arc<Flowtable>,
    },
    DelFlowtable {
        ft: Arc<Flowtable>,
    },
}

impl TransOp {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TransOp::NewTable => "newtable",
            TransOp::UpdTable => "updtable",
            TransOp::DelTable => "deltable",
            TransOp::NewChain { .. } => "newchain",
            TransOp::UpdChain { .. } => "updchain",
            TransOp::DelChain { .. } => "delchain",
            TransOp::NewRule { .. } => "newrule",
            TransOp::DelRule { .. } => "delrule",
            TransOp::NewSet { .. } => "newset",
            TransOp::DelSet { .. } => "delset",
            TransOp::NewSetElem { .. } => "newsetelem",
            TransOp::DelSetElem { .. } => "delsetelem",
            TransOp::NewObj { .. } => "newobj",
            TransOp::UpdObj { .. } => "updobj",
            TransOp::DelObj { .. } => "delobj",
            TransOp::NewFlowtable { .. } => "newflowtable",
            TransOp::DelFlowtable { .. } => "delflowtable",
        }
    }
}

/// One staged change and the table it belongs to.
pub(crate) struct Trans {
    pub family: Family,
    pub table: Arc<Table>,
    pub op: TransOp,
}

impl Trans {
    pub(crate) fn new(family: Family, table: &Arc<Table>, op: TransOp) -> Self {
        Self {
            family,
            table: Arc::clone(table),
            op,
        }
    }

    /// Chain whose rule array the record changes.
    pub(crate) fn rule_chain(&self) -> Option<&Arc<Chain>> {
        match &self.op {
            TransOp::NewRule { chain, .. } | TransOp::DelRule { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

impl fmt::Debug for Trans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trans")
            .field("op", &self.op.kind())
            .field("family", &self.family)
            .field("table", &self.table.name())
            .finish()
    }
}

/// Rule created earlier in the batch under `id`, in `chain`.
pub(crate) fn rule_by_id(list: &[Trans], chain: &Arc<Chain>, id: u32) -> Option<Arc<Rule>> {
    list.iter().find_map(|trans| match &trans.op {
        TransOp::NewRule {
            chain: c,
            rule,
            id: Some(rid),
        } if *rid == id && Arc::ptr_eq(c, chain) => Some(Arc::clone(rule)),
        _ => None,
    })
}

/// Set created earlier in the batch under `id`, in `table`.
pub(crate) fn set_by_id(list: &[Trans], table: &Arc<Table>, id: u32) -> Option<Arc<Set>> {
    list.iter().find_map(|trans| match &trans.op {
        TransOp::NewSet { set, id: Some(sid) } if *sid == id && Arc::ptr_eq(&trans.table, table) => {
            Some(Arc::clone(set))
        }
        _ => None,
    })
}

/// Returns true if a chain of `table` is already being renamed to `name`.
pub(crate) fn pending_rename(list: &[Trans], table: &Arc<Table>, name: &str) -> bool {
    list.iter().any(|trans| {
        matches!(&trans.op, TransOp::UpdChain { name: Some(n), .. } if n == name)
            && Arc::ptr_eq(&trans.table, table)
    })
}
