//! Legacy id to destination handle maps.

use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Opaque identifier assigned by the destination (usually a UUID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Handle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Result of [`IdentityMap::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// The same mapping already existed.
    Unchanged,
}

/// One-to-one map for a single entity kind. Keys are never remapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityMap {
    entries: BTreeMap<i64, Handle>,
}

impl IdentityMap {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, legacy_id: i64) -> Option<&Handle> {
        self.entries.get(&legacy_id)
    }

    pub fn contains(&self, legacy_id: i64) -> bool {
        self.entries.contains_key(&legacy_id)
    }

    /// Record a mapping. Repeating an identical mapping is a no-op; a
    /// different handle for a mapped key is a [`MigrateError::Remap`].
    pub fn put(&mut self, map: &str, legacy_id: i64, handle: Handle) -> Result<PutOutcome> {
        match self.entries.get(&legacy_id) {
            Some(existing) if *existing == handle => Ok(PutOutcome::Unchanged),
            Some(existing) => Err(MigrateError::Remap {
                map: map.to_string(),
                legacy_id,
                existing: existing.to_string(),
                attempted: handle.to_string(),
            }),
            None => {
                self.entries.insert(legacy_id, handle);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &Handle)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Reverse lookup; linear.
    pub fn legacy_id_of(&self, handle: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(_, v)| v.as_str() == handle)
            .map(|(k, _)| *k)
    }
}

/// One legacy id to several handles (e.g. a group split by role).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiIdentityMap {
    entries: BTreeMap<i64, Vec<Handle>>,
}

impl MultiIdentityMap {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add a handle for `legacy_id` unless already present.
    pub fn put(&mut self, legacy_id: i64, handle: Handle) -> PutOutcome {
        let handles = self.entries.entry(legacy_id).or_default();
        if handles.contains(&handle) {
            PutOutcome::Unchanged
        } else {
            handles.push(handle);
            PutOutcome::Inserted
        }
    }

    pub fn get(&self, legacy_id: i64) -> &[Handle] {
        self.entries
            .get(&legacy_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, legacy_id: i64) -> bool {
        self.entries.contains_key(&legacy_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &[Handle])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}

/// Completed (left, right) links such as group memberships.
pub type LinkSet = BTreeSet<(i64, i64)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_idempotent() {
        let mut map = IdentityMap::new();
        assert_eq!(map.put("item", 1, "a".into()).unwrap(), PutOutcome::Inserted);
        assert_eq!(map.put("item", 1, "a".into()).unwrap(), PutOutcome::Unchanged);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remap_is_rejected() {
        let mut map = IdentityMap::new();
        map.put("item", 1, "a".into()).unwrap();
        let err = map.put("item", 1, "b".into()).unwrap_err();
        assert!(matches!(err, MigrateError::Remap { legacy_id: 1, .. }));
        assert_eq!(map.get(1).map(Handle::as_str), Some("a"));
    }

    #[test]
    fn test_multi_map_keeps_insertion_order() {
        let mut map = MultiIdentityMap::new();
        map.put(7, "bitstream-read".into());
        map.put(7, "item-read".into());
        assert_eq!(map.put(7, "item-read".into()), PutOutcome::Unchanged);
        let handles: Vec<&str> = map.get(7).iter().map(Handle::as_str).collect();
        assert_eq!(handles, vec!["bitstream-read", "item-read"]);
        assert!(map.get(8).is_empty());
    }

    #[test]
    fn test_serialized_form_is_sorted() {
        let mut map = IdentityMap::new();
        map.put("item", 10, "b".into()).unwrap();
        map.put("item", 2, "a".into()).unwrap();
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"2":"a","10":"b"}"#);
    }

    #[test]
    fn test_reverse_lookup() {
        let mut map = IdentityMap::new();
        map.put("item", 3, "u-3".into()).unwrap();
        assert_eq!(map.legacy_id_of("u-3"), Some(3));
        assert_eq!(map.legacy_id_of("u-4"), None);
    }
}
