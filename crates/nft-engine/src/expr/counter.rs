use super::{Expr, ExprArgs, ExprInitCtx, ExprType};
use crate::types::{PktInfo, Registers};
use nft_common::{Extension, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Anonymous per-rule packet and byte counter.
#[derive(Debug, Default)]
pub struct CounterType;

impl Extension for CounterType {
    fn name(&self) -> &str {
        "counter"
    }
}

impl ExprType for CounterType {
    fn init(&self, _ctx: &ExprInitCtx<'_>, _args: &ExprArgs) -> Result<Box<dyn Expr>> {
        Ok(Box::new(Counter::default()))
    }
}

#[derive(Debug, Default)]
struct Counter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Expr for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn eval(&self, _regs: &mut Registers, pkt: &PktInfo<'_>) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(pkt.packet.len() as u64, Ordering::Relaxed);
    }

    fn dump(&self) -> Value {
        json!({
            "packets": self.packets.load(Ordering::Relaxed),
            "bytes": self.bytes.load(Ordering::Relaxed),
        })
    }
}
