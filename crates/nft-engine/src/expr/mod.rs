//! Expression contract.
//!
//! The engine treats expressions as opaque: it creates them through an
//! [`ExprType`] looked up in the registry, evaluates them on the fast path
//! and drives their lifecycle through the transaction phases. Everything
//! an expression references (chains, sets, objects) is pinned by a use it
//! takes at `init` and gives back on deactivation.
//!
//! # Lifecycle
//!
//! ```text
//!   init ─► (staged) ─► commit ─────────────────────────────► destroy
//!              │            delete staged: deactivate(Prepare)
//!              │                 ├─ commit: deactivate(Commit)
//!              │                 └─ abort : activate
//!              └─ abort: deactivate(Abort) ─────────────────► destroy
//! ```

mod counter;
mod immediate;
mod lookup;
mod objref;

pub use counter::CounterType;
pub use immediate::ImmediateType;
pub use lookup::LookupType;
pub use objref::ObjrefType;

use crate::chain::{Chain, ValidateCtx};
use crate::genmask::Genmask;
use crate::net::Net;
use crate::object::Object;
use crate::set::Set;
use crate::table::Table;
use crate::trans::{set_by_id, Trans};
use crate::types::{PktInfo, Registers};
use nft_common::{Extension, Family, NftError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Attribute bag an expression is created from.
pub type ExprArgs = serde_json::Map<String, Value>;

/// Declarative form of one expression: its type name plus arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExprSpec {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(flatten)]
    pub args: ExprArgs,
}

impl ExprSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: ExprArgs::new(),
        }
    }

    /// Adds an argument.
    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

/// Transaction phase passed to [`Expr::deactivate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransPhase {
    /// The rule failed to stage after this expression was created
    PrepareError,
    /// The owning rule was staged for deletion
    Prepare,
    /// The batch creating the owning rule was aborted
    Abort,
    /// The deletion of the owning rule was committed
    Commit,
}

/// A packet-matching expression.
pub trait Expr: Send + Sync {
    /// Type name, as registered.
    fn name(&self) -> &str;

    /// Evaluates against a packet; sets `regs.verdict` to stop the rule.
    fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>);

    /// Returns true if commit must run validation for rules using it.
    fn needs_validation(&self) -> bool {
        false
    }

    fn validate(&self, _ctx: &mut ValidateCtx) -> Result<()> {
        Ok(())
    }

    /// Re-takes the references a deactivation released.
    fn activate(&self, _ctx: &ExprCtx<'_>) {}

    fn deactivate(&self, _ctx: &ExprCtx<'_>, _phase: TransPhase) {}

    /// Final release, after the grace period.
    fn destroy(&self) {}

    fn dump(&self) -> Value;
}

/// Creates expressions of one type.
pub trait ExprType: Extension {
    fn init(&self, ctx: &ExprInitCtx<'_>, args: &ExprArgs) -> Result<Box<dyn Expr>>;
}

/// What an expression may look at while being created.
pub struct ExprInitCtx<'a> {
    pub(crate) net: &'a Net,
    pub(crate) family: Family,
    pub(crate) table: &'a Arc<Table>,
    pub(crate) chain: &'a Arc<Chain>,
    pub(crate) pending: &'a [Trans],
}

impl<'a> ExprInitCtx<'a> {
    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &Arc<Table> {
        self.table
    }

    /// Chain the new rule goes into.
    pub fn chain(&self) -> &Arc<Chain> {
        self.chain
    }

    pub(crate) fn genmask_next(&self) -> Genmask {
        self.net.genmask_next()
    }

    /// Finds a chain of the same table that is live in the next generation.
    pub fn find_chain(&self, name: &str) -> Result<Arc<Chain>> {
        self.table.chain_lookup(name, self.genmask_next())
    }

    /// Finds a set by name, or by the id it was created with earlier in
    /// the same batch.
    pub fn find_set(&self, name: Option<&str>, id: Option<u32>) -> Result<Arc<Set>> {
        let next = self.genmask_next();
        if let Some(name) = name {
            return self.table.set_lookup(name, next);
        }
        let id = id.ok_or_else(|| NftError::invalid("lookup needs a set name or id"))?;
        set_by_id(self.pending, self.table, id)
            .filter(|set| set.is_active(next))
            .ok_or_else(|| NftError::not_found("set", format!("id {}", id)))
    }

    pub fn find_object(&self, obj_type: &str, name: &str) -> Result<Arc<Object>> {
        self.table.object_lookup(obj_type, name, self.genmask_next())
    }
}

/// What an expression may touch during activate/deactivate.
pub struct ExprCtx<'a> {
    pub(crate) net: &'a Net,
    pub(crate) family: Family,
    pub(crate) table: &'a Arc<Table>,
}

impl<'a> ExprCtx<'a> {
    pub(crate) fn new(net: &'a Net, family: Family, table: &'a Arc<Table>) -> Self {
        Self { net, family, table }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &Arc<Table> {
        self.table
    }
}

pub(crate) fn arg_str<'a>(args: &'a ExprArgs, key: &str) -> Result<Option<&'a str>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(NftError::invalid(format!("{} must be a string, got {}", key, other))),
    }
}

pub(crate) fn required_str<'a>(args: &'a ExprArgs, key: &str) -> Result<&'a str> {
    arg_str(args, key)?.ok_or_else(|| NftError::invalid(format!("missing {}", key)))
}

pub(crate) fn arg_u64(args: &ExprArgs, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| NftError::invalid(format!("{} must be an unsigned integer", key))),
    }
}

pub(crate) fn arg_bool(args: &ExprArgs, key: &str) -> Result<bool> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(NftError::invalid(format!("{} must be a boolean", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_spec_json_shape() {
        let spec = ExprSpec::new("lookup").arg("set", "blocked").arg("len", 4);
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, json!({"type": "lookup", "set": "blocked", "len": 4}));

        let back: ExprSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_arg_helpers() {
        let spec = ExprSpec::new("x")
            .arg("name", "c")
            .arg("n", 7)
            .arg("flag", true)
            .arg("bad", -1);
        assert_eq!(arg_str(&spec.args, "name").unwrap(), Some("c"));
        assert_eq!(arg_str(&spec.args, "missing").unwrap(), None);
        assert!(required_str(&spec.args, "missing").is_err());
        assert!(arg_str(&spec.args, "n").is_err());
        assert_eq!(arg_u64(&spec.args, "n").unwrap(), Some(7));
        assert!(arg_u64(&spec.args, "bad").is_err());
        assert!(arg_bool(&spec.args, "flag").unwrap());
        assert!(!arg_bool(&spec.args, "missing").unwrap());
    }
}
