//! Shared vocabulary for the transactional ruleset engine.
//!
//! This crate holds the pieces every layer of the engine agrees on:
//!
//! - [`NftError`]: the error taxonomy returned by staging, commit and abort
//! - [`Family`] / [`HookNum`]: address families and hook points
//! - [`UseCount`]: saturating use counters for shared entities
//! - [`NameIndex`]: multi-valued name index (no auto-vivification)
//! - [`Catalogue`]: family-scoped extension descriptors
//! - [`ModuleRequests`]: autoload bookkeeping behind `TryAgainLater`

mod autoload;
mod error;
mod family;
mod name_index;
mod registry;
mod use_count;

pub use autoload::{LoadStatus, ModuleLoader, ModuleRequest, ModuleRequests, NoLoader};
pub use error::{ErrorKind, NftError, Result};
pub use family::{Family, HookNum};
pub use name_index::NameIndex;
pub use registry::{Catalogue, Extension};
pub use use_count::{HasUse, UseCount};

/// Longest table, chain, set, object or flowtable name.
pub const NAME_MAXLEN: usize = 256;

/// Longest key or map value.
pub const DATA_VALUE_MAXLEN: usize = 64;

/// Longest user annotation blob.
pub const USERDATA_MAXLEN: usize = 256;

/// Checks a user supplied name against [`NAME_MAXLEN`].
pub fn check_name(what: &'static str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= NAME_MAXLEN {
        return Err(NftError::invalid(format!("bad {} name length {}", what, name.len())));
    }
    Ok(())
}
