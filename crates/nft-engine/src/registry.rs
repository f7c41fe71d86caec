//! Extension registry of one engine instance.
//!
//! All five catalogues sit behind a single mutex. Staging holds it only
//! for the duration of a lookup; the `Arc` it hands out is what keeps an
//! extension registered while something built from it is alive.

use crate::chain::ChainType;
use crate::expr::{CounterType, ExprType, ImmediateType, LookupType, ObjrefType};
use crate::flowtable::{FlowOffloadType, FlowtableType};
use crate::object::{CounterObjType, ObjectType, QuotaObjType};
use crate::set::{BitmapSetType, HashSetType, RbtreeSetType, SetType};
use nft_common::{Catalogue, Family, HookNum, LoadStatus, ModuleLoader, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Catalogues {
    pub exprs: Catalogue<dyn ExprType>,
    pub sets: Catalogue<dyn SetType>,
    pub objects: Catalogue<dyn ObjectType>,
    pub flowtables: Catalogue<dyn FlowtableType>,
    pub chains: Catalogue<ChainType>,
}

pub struct Registry {
    inner: Mutex<Catalogues>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Catalogues {
                exprs: Catalogue::new("expr"),
                sets: Catalogue::new("set"),
                objects: Catalogue::new("obj"),
                flowtables: Catalogue::new("flowtable"),
                chains: Catalogue::new("chain"),
            }),
        }
    }

    /// Creates a registry holding every built-in extension.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        if let Err(e) = registry.register_builtins() {
            tracing::error!(error = %e, "failed to register built-in extensions");
        }
        registry
    }

    fn register_builtins(&self) -> Result<()> {
        let mut cats = self.lock();

        cats.exprs.register(Arc::new(ImmediateType))?;
        cats.exprs.register(Arc::new(CounterType))?;
        cats.exprs.register(Arc::new(LookupType))?;
        cats.exprs.register(Arc::new(ObjrefType))?;

        cats.sets.register(Arc::new(HashSetType))?;
        cats.sets.register(Arc::new(RbtreeSetType))?;
        cats.sets.register(Arc::new(BitmapSetType))?;

        cats.objects.register(Arc::new(CounterObjType))?;
        cats.objects.register(Arc::new(QuotaObjType))?;

        for family in [Family::Inet, Family::Ipv4, Family::Ipv6] {
            cats.flowtables.register(Arc::new(FlowOffloadType::new(family)))?;
        }

        cats.chains.register(Arc::new(ChainType::new("filter", Family::Unspec, HookNum::ALL)))?;
        let nat_hooks = HookNum::Prerouting.mask()
            | HookNum::Input.mask()
            | HookNum::Output.mask()
            | HookNum::Postrouting.mask();
        for family in [Family::Inet, Family::Ipv4, Family::Ipv6] {
            cats.chains.register(Arc::new(ChainType::new("nat", family, nat_hooks)))?;
        }
        for family in [Family::Ipv4, Family::Ipv6] {
            cats.chains
                .register(Arc::new(ChainType::new("route", family, HookNum::Output.mask())))?;
        }
        Ok(())
    }

    /// Locks the catalogues.
    pub fn lock(&self) -> MutexGuard<'_, Catalogues> {
        self.inner.lock()
    }
}

type Provider = Box<dyn FnOnce(&mut Catalogues) -> Result<()> + Send>;

/// Module loader backed by in-process providers.
///
/// Each provider registers its extensions the first time its module is
/// requested; requests for anything else are reported unavailable.
pub struct StaticLoader {
    registry: Arc<Registry>,
    providers: Mutex<HashMap<String, Provider>>,
    requested: Mutex<Vec<String>>,
}

impl StaticLoader {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            providers: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Adds a provider for `module`, e.g. `nft-expr-counter`.
    pub fn provide<F>(self, module: &str, provider: F) -> Self
    where
        F: FnOnce(&mut Catalogues) -> Result<()> + Send + 'static,
    {
        self.providers.lock().insert(module.to_string(), Box::new(provider));
        self
    }

    /// Every module requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

impl ModuleLoader for StaticLoader {
    fn request(&self, module: &str) -> LoadStatus {
        self.requested.lock().push(module.to_string());
        let Some(provider) = self.providers.lock().remove(module) else {
            tracing::debug!(module, "no provider");
            return LoadStatus::Unavailable;
        };
        match provider(&mut *self.registry.lock()) {
            Ok(()) => {
                tracing::info!(module, "module loaded");
                LoadStatus::Pending
            }
            Err(e) => {
                tracing::warn!(module, error = %e, "module failed to register");
                LoadStatus::Unavailable
            }
        }
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticLoader")
            .field("providers", &self.providers.lock().keys().collect::<Vec<_>>())
            .field("requested", &self.requested.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = Registry::with_builtins();
        let cats = registry.lock();
        assert_eq!(cats.exprs.len(), 4);
        assert_eq!(cats.sets.len(), 3);
        assert!(cats.chains.lookup("nat", Family::Ipv4).is_some());
        assert!(cats.chains.lookup("nat", Family::Arp).is_none());
        assert!(cats.chains.lookup("filter", Family::Bridge).is_some());
        assert!(cats.flowtables.lookup("flowoffload", Family::Netdev).is_none());
    }

    #[test]
    fn test_static_loader_registers_once() {
        let registry = Arc::new(Registry::new());
        let loader = StaticLoader::new(Arc::clone(&registry)).provide("nft-expr-counter", |cats| {
            cats.exprs.register(Arc::new(CounterType))
        });
        assert_eq!(loader.request("nft-expr-counter"), LoadStatus::Pending);
        assert!(registry.lock().exprs.lookup("counter", Family::Inet).is_some());
        assert_eq!(loader.request("nft-expr-counter"), LoadStatus::Unavailable);
        assert_eq!(loader.request("nft-expr-meta"), LoadStatus::Unavailable);
        assert_eq!(loader.requested().len(), 3);
    }

    #[test]
    fn test_unregister_pinned() {
        let registry = Registry::with_builtins();
        let pinned = registry.lock().exprs.lookup("counter", Family::Inet).unwrap();
        assert!(registry.lock().exprs.unregister("counter", Family::Unspec).is_err());
        drop(pinned);
        assert!(registry.lock().exprs.unregister("counter", Family::Unspec).is_ok());
    }
}
