//! Hook registration service.
//!
//! The engine does not wire chains into a packet path itself. It tells a
//! [`HookRegistrar`] when a base chain or a flowtable device becomes
//! reachable and when it stops being reachable, exactly once each.

use nft_common::{Family, HookNum, Result};
use parking_lot::Mutex;
use serde::Serialize;

/// Who owns a hook registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOwner {
    /// A base chain, by table and chain handle
    Chain { table: u64, chain: u64 },
    /// A flowtable device hook, by table and flowtable handle
    Flowtable { table: u64, flowtable: u64 },
}

/// One hook registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HookOps {
    pub family: Family,
    pub hooknum: HookNum,
    pub priority: i32,
    pub device: Option<String>,
    pub owner: HookOwner,
}

/// Attaches hooks to the packet path.
pub trait HookRegistrar: Send + Sync {
    /// Makes `ops` reachable from the packet path.
    fn register(&self, ops: &HookOps) -> Result<()>;

    /// Detaches `ops`. Never fails.
    fn unregister(&self, ops: &HookOps);
}

/// Accepts every registration and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl HookRegistrar for NoopHooks {
    fn register(&self, _ops: &HookOps) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _ops: &HookOps) {}
}

/// Keeps the set of live registrations; used by tests and `nftd`.
#[derive(Debug, Default)]
pub struct RecordingHooks {
    live: Mutex<Vec<HookOps>>,
    failing_device: Mutex<Option<String>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently registered hooks.
    pub fn live(&self) -> Vec<HookOps> {
        self.live.lock().clone()
    }

    /// Number of currently registered hooks.
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Makes every registration on `device` fail, like a missing netdev.
    pub fn fail_device(&self, device: Option<&str>) {
        *self.failing_device.lock() = device.map(str::to_string);
    }
}

impl HookRegistrar for RecordingHooks {
    fn register(&self, ops: &HookOps) -> Result<()> {
        if let (Some(bad), Some(dev)) = (self.failing_device.lock().as_deref(), ops.device.as_deref()) {
            if bad == dev {
                return Err(nft_common::NftError::not_found("device", dev));
            }
        }
        let mut live = self.live.lock();
        if live.contains(ops) {
            return Err(nft_common::NftError::exists("hook", format!("{:?}", ops.owner)));
        }
        live.push(ops.clone());
        Ok(())
    }

    fn unregister(&self, ops: &HookOps) {
        let mut live = self.live.lock();
        match live.iter().position(|o| o == ops) {
            Some(pos) => {
                live.remove(pos);
            }
            None => tracing::warn!(owner = ?ops.owner, "unregistering unknown hook"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(device: Option<&str>) -> HookOps {
        HookOps {
            family: Family::Netdev,
            hooknum: HookNum::Ingress,
            priority: 0,
            device: device.map(str::to_string),
            owner: HookOwner::Flowtable { table: 1, flowtable: 2 },
        }
    }

    #[test]
    fn test_register_unregister() {
        let hooks = RecordingHooks::new();
        hooks.register(&ops(Some("eth0"))).unwrap();
        assert_eq!(hooks.len(), 1);
        assert!(hooks.register(&ops(Some("eth0"))).is_err());
        hooks.unregister(&ops(Some("eth0")));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_failing_device() {
        let hooks = RecordingHooks::new();
        hooks.fail_device(Some("eth1"));
        assert!(hooks.register(&ops(Some("eth1"))).is_err());
        assert!(hooks.register(&ops(Some("eth2"))).is_ok());
    }
}
