//! Module autoload bookkeeping.
//!
//! A lookup that misses records a module request and fails the batch with
//! `TryAgainLater`. The session aborts with the autoload action, which
//! issues the requests outside the commit mutex and marks them done; the
//! replayed batch then finds either the freshly registered extension or a
//! done request, which turns the miss into a plain `NotFound` instead of
//! another retry.

use crate::error::{NftError, Result};

/// Outcome of a module request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The loader accepted the request; the extension may show up.
    Pending,
    /// Nothing provides this module.
    Unavailable,
}

/// Loads extension providers on demand.
pub trait ModuleLoader: Send + Sync {
    /// Requests the module named `module`.
    fn request(&self, module: &str) -> LoadStatus;
}

/// A loader that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoader;

impl ModuleLoader for NoLoader {
    fn request(&self, _module: &str) -> LoadStatus {
        LoadStatus::Unavailable
    }
}

/// One outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Module name, e.g. `nft-expr-counter`
    pub module: String,
    /// Set once the loader was asked
    pub done: bool,
}

/// Requests recorded by the current and the replayed batch.
#[derive(Debug, Default)]
pub struct ModuleRequests {
    list: Vec<ModuleRequest>,
}

impl ModuleRequests {
    /// Creates an empty request list.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Records a request for `module`.
    ///
    /// Returns `Ok` only if the same request was already issued; the caller
    /// then reports its original miss. Otherwise the request is queued and
    /// `TryAgainLater` is returned.
    pub fn request(&mut self, module: &str) -> Result<()> {
        match self.list.iter().find(|r| r.module == module) {
            Some(req) if req.done => Ok(()),
            Some(_) => Err(NftError::try_again(module)),
            None => {
                tracing::debug!(module, "queueing module request");
                self.list.push(ModuleRequest {
                    module: module.to_string(),
                    done: false,
                });
                Err(NftError::try_again(module))
            }
        }
    }

    /// Names of requests not issued yet.
    pub fn pending(&self) -> Vec<String> {
        self.list
            .iter()
            .filter(|r| !r.done)
            .map(|r| r.module.clone())
            .collect()
    }

    /// Marks `module` as issued.
    pub fn mark_done(&mut self, module: &str) {
        for req in self.list.iter_mut().filter(|r| r.module == module) {
            req.done = true;
        }
    }

    /// Forgets every request.
    pub fn clear(&mut self) {
        self.list.clear();
    }
}
