//! Fast-path evaluation.
//!
//! Rule traversal takes no lock and never waits on the commit mutex. It
//! reads the generation cursor once, then walks the rule arrays published
//! for that generation inside an RCU read section, so a concurrent commit
//! can neither free an array under it nor mix rules of two generations
//! into one walk. Set lookups go through the backend, which guards its
//! storage with a short read lock and filters elements by the same
//! generation mask.

use crate::chain::{Chain, RuleArray};
use crate::genmask::Genmask;
use crate::net::Net;
use crate::types::{Packet, PktInfo, Registers, Verdict, JUMP_STACK_SIZE};
use std::sync::Arc;

impl Net {
    /// Runs `packet` through `chain` and returns the final verdict: the
    /// first terminal verdict, else the chain policy for a base chain, else
    /// `Continue`.
    pub fn evaluate(&self, chain: &Arc<Chain>, packet: &Packet) -> Verdict {
        let _rcu = self.rcu.read();
        let gen = self.gencursor.cur();
        let pkt = PktInfo {
            packet,
            genmask: Genmask::for_gen(gen),
        };

        let mut regs = Registers::new();
        let mut stack: Vec<(RuleArray, usize)> = Vec::with_capacity(JUMP_STACK_SIZE);
        let mut rules = chain.live_rules(gen);
        let mut idx = 0;

        'chains: loop {
            while idx < rules.len() {
                let rule = Arc::clone(&rules[idx]);
                idx += 1;

                regs.verdict = Verdict::Continue;
                for expr in rule.exprs() {
                    expr.eval(&mut regs, &pkt);
                    if !matches!(regs.verdict, Verdict::Continue) {
                        break;
                    }
                }

                match std::mem::take(&mut regs.verdict) {
                    Verdict::Continue | Verdict::Break => {}
                    Verdict::Jump(target) => {
                        if stack.len() >= JUMP_STACK_SIZE {
                            tracing::warn!(chain = %target.name(), "jump stack overflow, dropping packet");
                            return Verdict::Drop;
                        }
                        let resume = std::mem::replace(&mut rules, target.live_rules(gen));
                        stack.push((resume, idx));
                        idx = 0;
                        continue 'chains;
                    }
                    Verdict::Goto(target) => {
                        rules = target.live_rules(gen);
                        idx = 0;
                        continue 'chains;
                    }
                    Verdict::Return => break,
                    terminal => return terminal,
                }
            }

            match stack.pop() {
                Some((resume, at)) => {
                    rules = resume;
                    idx = at;
                }
                None => break,
            }
        }

        chain.policy().map_or(Verdict::Continue, Verdict::from)
    }
}
