//! Flowtables: device-attached fast forwarding tables.
//!
//! The engine only manages their lifecycle and device hooks; the flow
//! offload itself lives behind the [`FlowtableType`].

use crate::genmask::{GenBits, Genmask};
use crate::hooks::{HookOps, HookOwner};
use nft_common::{Extension, Family, HasUse, HookNum, NftError, Result, UseCount};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Flow offload implementation for one family.
pub trait FlowtableType: Extension {
    /// Checks a declaration before the flowtable is created.
    fn check(&self, _spec: &FlowtableSpec) -> Result<()> {
        Ok(())
    }
}

/// Software flow offload.
#[derive(Debug)]
pub struct FlowOffloadType {
    family: Family,
}

impl FlowOffloadType {
    pub fn new(family: Family) -> Self {
        Self { family }
    }
}

impl Extension for FlowOffloadType {
    fn name(&self) -> &str {
        "flowoffload"
    }

    fn family(&self) -> Family {
        self.family
    }
}

impl FlowtableType for FlowOffloadType {}

fn default_hook() -> HookNum {
    HookNum::Ingress
}

/// Declarative form of a flowtable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowtableSpec {
    pub name: String,
    #[serde(default = "default_hook")]
    pub hook: HookNum,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub devices: Vec<String>,
}

impl FlowtableSpec {
    pub fn new(name: &str, devices: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            hook: HookNum::Ingress,
            priority: 0,
            devices: devices.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.hook != HookNum::Ingress {
            return Err(NftError::unsupported(format!("flowtable hook {} is not ingress", self.hook)));
        }
        if self.devices.is_empty() {
            return Err(NftError::invalid("flowtable without devices"));
        }
        Ok(())
    }
}

/// Dump of a flowtable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowtableInfo {
    pub handle: u64,
    pub name: String,
    pub hook: HookNum,
    pub priority: i32,
    pub devices: Vec<String>,
    #[serde(rename = "use")]
    pub use_count: u32,
}

pub struct Flowtable {
    handle: u64,
    name: String,
    family: Family,
    hooknum: HookNum,
    priority: i32,
    hooks: Mutex<Vec<HookOps>>,
    ft_type: Arc<dyn FlowtableType>,
    pub(crate) genmask: GenBits,
    use_count: UseCount,
}

impl Flowtable {
    pub(crate) fn new(
        handle: u64,
        table: u64,
        family: Family,
        spec: &FlowtableSpec,
        ft_type: Arc<dyn FlowtableType>,
    ) -> Self {
        let hooks = spec
            .devices
            .iter()
            .map(|dev| HookOps {
                family,
                hooknum: spec.hook,
                priority: spec.priority,
                device: Some(dev.clone()),
                owner: HookOwner::Flowtable {
                    table,
                    flowtable: handle,
                },
            })
            .collect();
        Self {
            handle,
            name: spec.name.clone(),
            family,
            hooknum: spec.hook,
            priority: spec.priority,
            hooks: Mutex::new(hooks),
            ft_type,
            genmask: GenBits::new(),
            use_count: UseCount::new(),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn type_name(&self) -> &str {
        self.ft_type.name()
    }

    pub fn is_active(&self, mask: Genmask) -> bool {
        self.genmask.is_active(mask)
    }

    /// Devices the flowtable is still attached to.
    pub fn devices(&self) -> Vec<String> {
        self.hooks.lock().iter().filter_map(|h| h.device.clone()).collect()
    }

    pub(crate) fn hooks(&self) -> Vec<HookOps> {
        self.hooks.lock().clone()
    }

    /// Drops the hook on `device`, returning it if there was one.
    pub(crate) fn take_device_hook(&self, device: &str) -> Option<HookOps> {
        let mut hooks = self.hooks.lock();
        let pos = hooks.iter().position(|h| h.device.as_deref() == Some(device))?;
        Some(hooks.remove(pos))
    }

    pub fn info(&self) -> FlowtableInfo {
        FlowtableInfo {
            handle: self.handle,
            name: self.name.clone(),
            hook: self.hooknum,
            priority: self.priority,
            devices: self.devices(),
            use_count: self.use_count.get(),
        }
    }
}

impl HasUse for Flowtable {
    fn use_count(&self) -> &UseCount {
        &self.use_count
    }
}

impl fmt::Debug for Flowtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flowtable")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("devices", &self.devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_check() {
        assert!(FlowtableSpec::new("ft", &["eth0"]).check().is_ok());
        assert!(FlowtableSpec::new("ft", &[]).check().is_err());
        let mut wrong_hook = FlowtableSpec::new("ft", &["eth0"]);
        wrong_hook.hook = HookNum::Forward;
        assert_eq!(
            wrong_hook.check().unwrap_err().kind(),
            nft_common::ErrorKind::Unsupported
        );
    }

    #[test]
    fn test_device_hooks() {
        let ty: Arc<dyn FlowtableType> = Arc::new(FlowOffloadType::new(Family::Inet));
        let ft = Flowtable::new(3, 1, Family::Inet, &FlowtableSpec::new("ft", &["eth0", "eth1"]), ty);
        assert_eq!(ft.hooks().len(), 2);
        assert!(ft.take_device_hook("eth0").is_some());
        assert!(ft.take_device_hook("eth0").is_none());
        assert_eq!(ft.devices(), vec!["eth1".to_string()]);
    }
}
