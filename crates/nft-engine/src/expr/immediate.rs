//! Verdict expression: accept, drop, queue, jump and goto.

use super::{arg_u64, required_str, Expr, ExprArgs, ExprCtx, ExprInitCtx, ExprType, TransPhase};
use crate::chain::ValidateCtx;
use crate::types::{PktInfo, Registers, Verdict};
use nft_common::{Extension, HasUse, NftError, Result};
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct ImmediateType;

impl Extension for ImmediateType {
    fn name(&self) -> &str {
        "immediate"
    }
}

impl ExprType for ImmediateType {
    fn init(&self, ctx: &ExprInitCtx<'_>, args: &ExprArgs) -> Result<Box<dyn Expr>> {
        let code = required_str(args, "verdict")?;
        let verdict = match code {
            "accept" => Verdict::Accept,
            "drop" => Verdict::Drop,
            "continue" => Verdict::Continue,
            "break" => Verdict::Break,
            "return" => Verdict::Return,
            "queue" => {
                let num = arg_u64(args, "queue")?.unwrap_or(0);
                let num = u16::try_from(num)
                    .map_err(|_| NftError::invalid(format!("queue number {} out of range", num)))?;
                Verdict::Queue(num)
            }
            "jump" | "goto" => {
                let target = ctx.find_chain(required_str(args, "chain")?)?;
                if target.is_base() {
                    return Err(NftError::unsupported(format!(
                        "cannot {} to base chain {}",
                        code,
                        target.name()
                    )));
                }
                target.use_count().inc()?;
                if code == "jump" {
                    Verdict::Jump(target)
                } else {
                    Verdict::Goto(target)
                }
            }
            other => return Err(NftError::invalid(format!("unknown verdict {}", other))),
        };
        Ok(Box::new(Immediate { verdict }))
    }
}

struct Immediate {
    verdict: Verdict,
}

impl Expr for Immediate {
    fn name(&self) -> &str {
        "immediate"
    }

    fn eval(&self, regs: &mut Registers, _pkt: &PktInfo<'_>) {
        regs.verdict = self.verdict.clone();
    }

    fn needs_validation(&self) -> bool {
        self.verdict.chain().is_some()
    }

    fn validate(&self, ctx: &mut ValidateCtx) -> Result<()> {
        match self.verdict.chain() {
            Some(target) => ctx.descend(target),
            None => Ok(()),
        }
    }

    fn activate(&self, _ctx: &ExprCtx<'_>) {
        if let Some(target) = self.verdict.chain() {
            target.use_count().inc_restore();
        }
    }

    fn deactivate(&self, _ctx: &ExprCtx<'_>, phase: TransPhase) {
        if phase == TransPhase::Commit {
            return;
        }
        if let Some(target) = self.verdict.chain() {
            target.use_count().dec();
        }
    }

    fn dump(&self) -> Value {
        match (&self.verdict, self.verdict.chain()) {
            (_, Some(target)) => json!({"verdict": self.verdict.code(), "chain": target.name()}),
            (Verdict::Queue(num), None) => json!({"verdict": "queue", "queue": num}),
            _ => json!({"verdict": self.verdict.code()}),
        }
    }
}
