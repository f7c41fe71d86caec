//! Set membership match.
//!
//! Reads `len` bytes at `offset` from the packet and looks them up in a
//! set. The expression binds the set for its whole lifetime; for an
//! anonymous set the binding is what keeps the set alive.

use super::{arg_bool, arg_str, arg_u64, Expr, ExprArgs, ExprCtx, ExprInitCtx, ExprType, TransPhase};
use crate::set::{Set, SetFlags};
use crate::types::{PktInfo, Registers};
use nft_common::{Extension, NftError, Result};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct LookupType;

impl Extension for LookupType {
    fn name(&self) -> &str {
        "lookup"
    }
}

impl ExprType for LookupType {
    fn init(&self, ctx: &ExprInitCtx<'_>, args: &ExprArgs) -> Result<Box<dyn Expr>> {
        let set_id = arg_u64(args, "set_id")?
            .map(|id| u32::try_from(id).map_err(|_| NftError::invalid("set id out of range")))
            .transpose()?;
        let set = ctx.find_set(arg_str(args, "set")?, set_id)?;

        let offset = arg_u64(args, "offset")?.unwrap_or(0) as usize;
        let len = arg_u64(args, "len")?.unwrap_or(u64::from(set.key_len())) as usize;
        if len != set.key_len() as usize {
            return Err(NftError::invalid(format!(
                "lookup length {} does not match key length {} of set {}",
                len,
                set.key_len(),
                set.name()
            )));
        }
        let invert = arg_bool(args, "invert")?;
        if invert && set.flags().contains(SetFlags::MAP) {
            return Err(NftError::invalid("cannot invert a map lookup"));
        }

        let binding = set.bind(ctx.chain().handle())?;
        Ok(Box::new(Lookup {
            set,
            binding,
            offset,
            len,
            invert,
        }))
    }
}

struct Lookup {
    set: Arc<Set>,
    binding: u64,
    offset: usize,
    len: usize,
    invert: bool,
}

impl Expr for Lookup {
    fn name(&self) -> &str {
        "lookup"
    }

    fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>) {
        let key = self
            .offset
            .checked_add(self.len)
            .and_then(|end| pkt.packet.payload.get(self.offset..end));
        let found = match key {
            Some(key) => self.set.backend().lookup(key, pkt.genmask).is_some(),
            None => false,
        };
        if found == self.invert {
            regs.mismatch();
        }
    }

    fn activate(&self, ctx: &ExprCtx<'_>) {
        self.set.activate_binding(ctx.net.genmask_next());
    }

    fn deactivate(&self, ctx: &ExprCtx<'_>, phase: TransPhase) {
        self.set.deactivate_binding(ctx, self.binding, phase);
    }

    fn destroy(&self) {
        self.set.destroy_if_unbound();
    }

    fn dump(&self) -> Value {
        json!({
            "set": self.set.name(),
            "offset": self.offset,
            "len": self.len,
            "invert": self.invert,
        })
    }
}
