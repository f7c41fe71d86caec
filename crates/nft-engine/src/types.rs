//! Core value types shared by the control plane and the fast path.

use crate::chain::Chain;
use crate::genmask::Genmask;
use nft_common::{Family, HookNum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Deepest jump/goto nesting the fast path supports and validation allows.
pub const JUMP_STACK_SIZE: usize = 16;

/// Most expressions a single rule may carry.
pub const RULE_MAXEXPRS: usize = 128;

/// Default policy of a base chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    #[default]
    Accept,
    Drop,
}

impl ChainPolicy {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Accept => 0,
            Self::Drop => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::Drop
        } else {
            Self::Accept
        }
    }
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "accept"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

impl FromStr for ChainPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(format!("Unknown chain policy: {}", s)),
        }
    }
}

/// Outcome of evaluating an expression, a rule or a chain.
///
/// `Continue` moves on to the next expression, `Break` abandons the
/// current rule. Jump and goto carry the target chain.
#[derive(Clone, Default)]
pub enum Verdict {
    #[default]
    Continue,
    Break,
    Accept,
    Drop,
    Queue(u16),
    Return,
    Jump(Arc<Chain>),
    Goto(Arc<Chain>),
}

impl Verdict {
    /// Returns true for verdicts that end evaluation of the packet.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Verdict::Accept | Verdict::Drop | Verdict::Queue(_))
    }

    /// Short name, as used in dumps.
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Continue => "continue",
            Verdict::Break => "break",
            Verdict::Accept => "accept",
            Verdict::Drop => "drop",
            Verdict::Queue(_) => "queue",
            Verdict::Return => "return",
            Verdict::Jump(_) => "jump",
            Verdict::Goto(_) => "goto",
        }
    }

    /// Target chain of a jump or goto.
    pub fn chain(&self) -> Option<&Arc<Chain>> {
        match self {
            Verdict::Jump(chain) | Verdict::Goto(chain) => Some(chain),
            _ => None,
        }
    }
}

impl From<ChainPolicy> for Verdict {
    fn from(policy: ChainPolicy) -> Self {
        match policy {
            ChainPolicy::Accept => Verdict::Accept,
            ChainPolicy::Drop => Verdict::Drop,
        }
    }
}

impl fmt::Debug for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Queue(num) => write!(f, "Queue({})", num),
            Verdict::Jump(chain) => write!(f, "Jump({})", chain.name()),
            Verdict::Goto(chain) => write!(f, "Goto({})", chain.name()),
            other => f.write_str(match other {
                Verdict::Continue => "Continue",
                Verdict::Break => "Break",
                Verdict::Accept => "Accept",
                Verdict::Drop => "Drop",
                _ => "Return",
            }),
        }
    }
}

impl PartialEq for Verdict {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Verdict::Queue(a), Verdict::Queue(b)) => a == b,
            (Verdict::Jump(a), Verdict::Jump(b)) | (Verdict::Goto(a), Verdict::Goto(b)) => {
                Arc::ptr_eq(a, b)
            }
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

/// A packet as seen by the fast path.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub family: Family,
    pub hook: Option<HookNum>,
    /// Input device name, if known
    pub iifname: Option<String>,
    /// Bytes expressions may read keys from
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Per-evaluation view handed to expressions.
pub struct PktInfo<'a> {
    pub packet: &'a Packet,
    /// Generation the evaluation runs in
    pub genmask: Genmask,
}

/// Evaluation registers.
#[derive(Debug, Default)]
pub struct Registers {
    pub verdict: Verdict,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the current rule as not matching.
    pub fn mismatch(&mut self) {
        self.verdict = Verdict::Break;
    }
}
