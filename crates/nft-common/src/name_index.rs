//! Multi-valued name index.
//!
//! A table may briefly hold two chains with the same name: one staged for
//! deletion and one staged for creation in the same batch. The index
//! therefore maps a name to every entry carrying it, and callers filter by
//! generation.
//!
//! Like a map that never auto-vivifies, lookups return `Option` and
//! removing the last entry for a name drops the bucket.

use std::collections::HashMap;

/// Name → entries index.
#[derive(Debug, Clone)]
pub struct NameIndex<V> {
    inner: HashMap<String, Vec<V>>,
}

impl<V> Default for NameIndex<V> {
    fn default() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }
}

impl<V> NameIndex<V> {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Adds an entry under `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: V) {
        self.inner.entry(name.into()).or_default().push(value);
    }

    /// Returns every entry stored under `name`.
    ///
    /// **This never creates entries.**
    pub fn get(&self, name: &str) -> &[V] {
        self.inner.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the first entry under `name` matching `pred`.
    pub fn find(&self, name: &str, pred: impl Fn(&V) -> bool) -> Option<&V> {
        self.get(name).iter().find(|v| pred(v))
    }

    /// Removes the first entry under `name` matching `pred`.
    pub fn remove(&mut self, name: &str, pred: impl Fn(&V) -> bool) -> Option<V> {
        let bucket = self.inner.get_mut(name)?;
        let pos = bucket.iter().position(pred)?;
        let value = bucket.remove(pos);
        if bucket.is_empty() {
            self.inner.remove(name);
        }
        Some(value)
    }

    /// Iterates over all entries.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values().flatten()
    }
}
