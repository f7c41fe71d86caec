use crate::expr::{Expr, ExprCtx, ExprType, TransPhase};
use crate::genmask::{GenBits, Genmask};
use nft_common::Extension;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// An ordered list of expressions inside a chain.
pub struct Rule {
    handle: u64,
    pub(crate) genmask: GenBits,
    exprs: Vec<Box<dyn Expr>>,
    /// Keeps every expression type registered while the rule lives
    types: Vec<Arc<dyn ExprType>>,
    udata: Option<Vec<u8>>,
}

/// Dump of a rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleInfo {
    pub handle: u64,
    pub exprs: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udata: Option<Vec<u8>>,
}

impl Rule {
    pub(crate) fn new(
        handle: u64,
        exprs: Vec<Box<dyn Expr>>,
        types: Vec<Arc<dyn ExprType>>,
        udata: Option<Vec<u8>>,
    ) -> Self {
        Self {
            handle,
            genmask: GenBits::new(),
            exprs,
            types,
            udata,
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn exprs(&self) -> &[Box<dyn Expr>] {
        &self.exprs
    }

    pub fn udata(&self) -> Option<&[u8]> {
        self.udata.as_deref()
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    pub(crate) fn needs_validation(&self) -> bool {
        self.exprs.iter().any(|e| e.needs_validation())
    }

    pub(crate) fn activate_exprs(&self, ctx: &ExprCtx<'_>) {
        for expr in &self.exprs {
            expr.activate(ctx);
        }
    }

    pub(crate) fn deactivate_exprs(&self, ctx: &ExprCtx<'_>, phase: TransPhase) {
        for expr in &self.exprs {
            expr.deactivate(ctx, phase);
        }
    }

    pub(crate) fn destroy(&self) {
        for expr in &self.exprs {
            expr.destroy();
        }
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            handle: self.handle,
            exprs: self
                .exprs
                .iter()
                .map(|e| {
                    let mut dump = e.dump();
                    if let Value::Object(map) = &mut dump {
                        map.insert("type".to_string(), Value::String(e.name().to_string()));
                    }
                    dump
                })
                .collect(),
            udata: self.udata.clone(),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("handle", &self.handle)
            .field("genmask", &self.genmask.raw())
            .field("exprs", &self.types.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}
