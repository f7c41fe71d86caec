//! Named stateful objects: counters and quotas shared between rules.

use crate::expr::{arg_bool, arg_u64, ExprArgs};
use crate::genmask::{GenBits, Genmask};
use crate::types::{PktInfo, Registers};
use nft_common::{Extension, HasUse, NftError, Result, UseCount};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime state of one object.
pub trait ObjectState: Send + Sync {
    fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>);

    fn dump(&self) -> Value;

    /// Checks an update before it is staged.
    fn validate_update(&self, _args: &ExprArgs) -> Result<()> {
        Ok(())
    }

    /// Applies a staged update; runs at commit.
    fn apply_update(&self, _args: &ExprArgs) {}
}

/// Creates objects of one type.
pub trait ObjectType: Extension {
    fn create(&self, args: &ExprArgs) -> Result<Box<dyn ObjectState>>;
}

/// Declarative form of an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub obj_type: String,
    #[serde(default)]
    pub udata: Option<Vec<u8>>,
    #[serde(flatten)]
    pub args: ExprArgs,
}

impl ObjectSpec {
    pub fn new(obj_type: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            obj_type: obj_type.to_string(),
            udata: None,
            args: ExprArgs::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

/// Dump of an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub handle: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub obj_type: String,
    #[serde(rename = "use")]
    pub use_count: u32,
    pub state: Value,
}

pub struct Object {
    handle: u64,
    name: String,
    obj_type: Arc<dyn ObjectType>,
    pub(crate) genmask: GenBits,
    use_count: UseCount,
    state: Box<dyn ObjectState>,
    udata: Option<Vec<u8>>,
}

impl Object {
    pub(crate) fn new(
        handle: u64,
        name: &str,
        obj_type: Arc<dyn ObjectType>,
        state: Box<dyn ObjectState>,
        udata: Option<Vec<u8>>,
    ) -> Self {
        Self {
            handle,
            name: name.to_string(),
            obj_type,
            genmask: GenBits::new(),
            use_count: UseCount::new(),
            state,
            udata,
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        self.obj_type.name()
    }

    pub fn udata(&self) -> Option<&[u8]> {
        self.udata.as_deref()
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    pub fn state(&self) -> &dyn ObjectState {
        self.state.as_ref()
    }

    pub fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>) {
        self.state.eval(regs, pkt);
    }

    pub(crate) fn destroy(&self) {
        if self.use_count.in_use() {
            tracing::error!(object = %self.name, uses = self.use_count.get(), "destroying object still in use");
        }
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            handle: self.handle,
            name: self.name.clone(),
            obj_type: self.type_name().to_string(),
            use_count: self.use_count.get(),
            state: self.state.dump(),
        }
    }
}

impl HasUse for Object {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("handle", &self.handle)
            .field("type", &self.type_name())
            .field("name", &self.name)
            .field("use", &self.use_count.get())
            .finish()
    }
}

/// Named packet and byte counter.
#[derive(Debug, Default)]
pub struct CounterObjType;

impl Extension for CounterObjType {
    fn name(&self) -> &str {
        "counter"
    }
}

impl ObjectType for CounterObjType {
    fn create(&self, args: &ExprArgs) -> Result<Box<dyn ObjectState>> {
        Ok(Box::new(CounterState {
            packets: AtomicU64::new(arg_u64(args, "packets")?.unwrap_or(0)),
            bytes: AtomicU64::new(arg_u64(args, "bytes")?.unwrap_or(0)),
        }))
    }
}

struct CounterState {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl ObjectState for CounterState {
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

/// Byte quota; the rule stops matching once it is used up (or, inverted,
/// until it is).
#[derive(Debug, Default)]
pub struct QuotaObjType;

impl Extension for QuotaObjType {
    fn name(&self) -> &str {
        "quota"
    }
}

fn quota_limit(args: &ExprArgs) -> Result<u64> {
    arg_u64(args, "bytes")?.ok_or_else(|| NftError::invalid("quota needs bytes"))
}

impl ObjectType for QuotaObjType {
    fn create(&self, args: &ExprArgs) -> Result<Box<dyn ObjectState>> {
        Ok(Box::new(QuotaState {
            limit: AtomicU64::new(quota_limit(args)?),
            consumed: AtomicU64::new(arg_u64(args, "consumed")?.unwrap_or(0)),
            invert: AtomicBool::new(arg_bool(args, "inv")?),
        }))
    }
}

struct QuotaState {
    limit: AtomicU64,
    consumed: AtomicU64,
    invert: AtomicBool,
}

impl ObjectState for QuotaState {
    fn eval(&self, regs: &mut Registers, pkt: &PktInfo<'_>) {
        let len = pkt.packet.len() as u64;
        let consumed = self.consumed.fetch_add(len, Ordering::Relaxed).saturating_add(len);
        let over = consumed > self.limit.load(Ordering::Relaxed);
        if over ^ self.invert.load(Ordering::Relaxed) {
            regs.mismatch();
        }
    }

    fn dump(&self) -> Value {
        json!({
            "bytes": self.limit.load(Ordering::Relaxed),
            "consumed": self.consumed.load(Ordering::Relaxed),
            "inv": self.invert.load(Ordering::Relaxed),
        })
    }

    fn validate_update(&self, args: &ExprArgs) -> Result<()> {
        quota_limit(args)?;
        arg_bool(args, "inv")?;
        Ok(())
    }

    fn apply_update(&self, args: &ExprArgs) {
        if let Ok(limit) = quota_limit(args) {
            self.limit.store(limit, Ordering::Relaxed);
        }
        if let Ok(invert) = arg_bool(args, "inv") {
            self.invert.store(invert, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Packet;

    fn run(state: &dyn ObjectState, len: usize) -> bool {
        let packet = Packet::new(vec![0u8; len]);
        let pkt = PktInfo {
            packet: &packet,
            genmask: Genmask::for_gen(0),
        };
        let mut regs = Registers::new();
        state.eval(&mut regs, &pkt);
        regs.verdict != crate::types::Verdict::Break
    }

    #[test]
    fn test_quota() {
        let spec = ObjectSpec::new("quota", "q").arg("bytes", 100);
        let state = QuotaObjType.create(&spec.args).unwrap();
        assert!(run(state.as_ref(), 60));
        assert!(!run(state.as_ref(), 60));

        let raise = ObjectSpec::new("quota", "q").arg("bytes", 1000);
        state.validate_update(&raise.args).unwrap();
        state.apply_update(&raise.args);
        assert!(run(state.as_ref(), 60));
        assert!(QuotaObjType.create(&ExprArgs::new()).is_err());
    }

    #[test]
    fn test_counter() {
        let state = CounterObjType.create(&ExprArgs::new()).unwrap();
        run(state.as_ref(), 10);
        run(state.as_ref(), 5);
        assert_eq!(state.dump(), json!({"packets": 2, "bytes": 15}));
    }
}
