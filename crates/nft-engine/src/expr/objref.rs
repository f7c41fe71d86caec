use super::{required_str, Expr, ExprArgs, ExprCtx, ExprInitCtx, ExprType, TransPhase};
use crate::object::Object;
use crate::types::{PktInfo, Registers};
use nft_common::{Extension, HasUse, Result};
use serde_json::{json, Value};
use std::sync::Arc;

/// Reference to a named stateful object; evaluation runs the object.
#[derive(Debug, Default)]
pub struct ObjrefType;

impl Extension for ObjrefType {
    fn name(&self) -> &str {
        "objref"
    }
}

impl ExprType for ObjrefType {
    fn init(&self, ctx: &ExprInitCtx<'_>, args: &ExprArgs) -> Result<Box<dyn Expr>> {
        let obj_type = required_str(args, "obj_type")?;
        let obj = ctx.find_object(obj_type, required_str(args, "name")?)?;
        obj.use_count().inc()?;
        Ok(Box::new(Objref { obj }))
    }
}

struct Objref {
    obj: Arc<Object>,
}

impl Expr for Objref {
    fn name(&self) -> &str {
        "objref"
    }

    fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>) {
        self.obj.eval(regs, pkt);
    }

    fn activate(&self, _ctx: &ExprCtx<'_>) {
        self.obj.use_count().inc_restore();
    }

    fn deactivate(&self, _ctx: &ExprCtx<'_>, phase: TransPhase) {
        if phase != TransPhase::Commit {
            self.obj.use_count().dec();
        }
    }

    fn dump(&self) -> Value {
        json!({"obj_type": self.obj.type_name(), "name": self.obj.name()})
    }
}
