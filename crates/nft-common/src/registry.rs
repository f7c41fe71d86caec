//! Catalogue of pluggable extensions.
//!
//! Each catalogue stores descriptors of one kind (expression types, set
//! backends, ...) keyed by name and family. Family-specific entries sit
//! at the front and family-agnostic ones at the back, so the first name
//! match for a family is always the most specific one.
//!
//! Descriptors are handed out as `Arc`s. An entity that was built from a
//! descriptor keeps its `Arc` for as long as it lives, which is what
//! pins the descriptor: [`Catalogue::unregister`] refuses while any such
//! clone exists.

use crate::autoload::ModuleRequests;
use crate::error::{NftError, Result};
use crate::family::Family;
use std::sync::Arc;

/// A named, family-scoped extension descriptor.
pub trait Extension: Send + Sync {
    /// Extension name, unique per family.
    fn name(&self) -> &str;

    /// Family the extension serves; `Unspec` serves all of them.
    fn family(&self) -> Family {
        Family::Unspec
    }
}

/// Descriptors of one extension kind.
pub struct Catalogue<T: ?Sized> {
    kind: &'static str,
    entries: Vec<Arc<T>>,
}

impl<T: ?Sized + Extension> Catalogue<T> {
    /// Creates an empty catalogue; `kind` names it in errors and module
    /// requests (`nft-<kind>-<name>`).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a descriptor.
    ///
    /// Fails with `AlreadyExists` if the same (name, family) is present. A
    /// family-specific entry may shadow an agnostic one of the same name.
    pub fn register(&mut self, ext: Arc<T>) -> Result<()> {
        let conflict = self
            .entries
            .iter()
            .any(|e| e.name() == ext.name() && e.family() == ext.family());
        if conflict {
            return Err(NftError::exists(self.kind, ext.name()));
        }

        tracing::debug!(kind = self.kind, name = ext.name(), family = %ext.family(), "registering extension");
        if ext.family().is_unspec() {
            self.entries.push(ext);
        } else {
            self.entries.insert(0, ext);
        }
        Ok(())
    }

    /// Removes a descriptor.
    ///
    /// Fails with `Busy` while an entity still holds it.
    pub fn unregister(&mut self, name: &str, family: Family) -> Result<Arc<T>> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name() == name && e.family() == family)
            .ok_or_else(|| NftError::not_found(self.kind, name))?;

        if Arc::strong_count(&self.entries[pos]) > 1 {
            return Err(NftError::busy(format!("{} {} is in use", self.kind, name)));
        }
        Ok(self.entries.remove(pos))
    }

    /// Finds the best descriptor for (name, family).
    ///
    /// An exact family match wins over a family-agnostic entry.
    pub fn lookup(&self, name: &str, family: Family) -> Option<Arc<T>> {
        self.entries
            .iter()
            .filter(|e| e.name() == name)
            .find(|e| e.family() == family || e.family().is_unspec())
            .cloned()
    }

    /// Like [`lookup`](Self::lookup), but a miss queues a module request
    /// when `requests` is given.
    ///
    /// Returns `TryAgainLater` for a newly queued request and `NotFound`
    /// once the request was already issued.
    pub fn lookup_or_request(
        &self,
        name: &str,
        family: Family,
        requests: Option<&mut ModuleRequests>,
    ) -> Result<Arc<T>> {
        if let Some(ext) = self.lookup(name, family) {
            return Ok(ext);
        }
        if let Some(requests) = requests {
            requests.request(&format!("nft-{}-{}", self.kind, name))?;
        }
        Err(NftError::not_found(self.kind, name))
    }

    /// Iterates over every descriptor, most specific first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Kind {
        name: &'static str,
        family: Family,
        tag: u32,
    }

    impl Extension for Kind {
        fn name(&self) -> &str {
            self.name
        }

        fn family(&self) -> Family {
            self.family
        }
    }

    fn kind(name: &'static str, family: Family, tag: u32) -> Arc<Kind> {
        Arc::new(Kind { name, family, tag })
    }

    #[test]
    fn test_exact_family_wins() {
        let mut cat = Catalogue::new("expr");
        cat.register(kind("meta", Family::Unspec, 1)).unwrap();
        cat.register(kind("meta", Family::Bridge, 2)).unwrap();

        assert_eq!(cat.lookup("meta", Family::Bridge).unwrap().tag, 2);
        assert_eq!(cat.lookup("meta", Family::Inet).unwrap().tag, 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut cat = Catalogue::new("expr");
        cat.register(kind("counter", Family::Unspec, 1)).unwrap();
        let err = cat.register(kind("counter", Family::Unspec, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_unregister_pinned() {
        let mut cat = Catalogue::new("set");
        cat.register(kind("hash", Family::Unspec, 1)).unwrap();
        let pin = cat.lookup("hash", Family::Inet).unwrap();

        let err = cat.unregister("hash", Family::Unspec).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        drop(pin);
        assert!(cat.unregister("hash", Family::Unspec).is_ok());
        assert!(cat.is_empty());
    }

    #[test]
    fn test_lookup_or_request() {
        let cat: Catalogue<Kind> = Catalogue::new("obj");
        let mut requests = ModuleRequests::new();

        let err = cat
            .lookup_or_request("quota", Family::Inet, Some(&mut requests))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TryAgainLater);
        assert_eq!(requests.pending(), vec!["nft-obj-quota".to_string()]);

        requests.mark_done("nft-obj-quota");
        let err = cat
            .lookup_or_request("quota", Family::Inet, Some(&mut requests))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = cat.lookup_or_request("quota", Family::Inet, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
