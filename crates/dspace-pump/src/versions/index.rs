use crate::legacy::{MetadataIndex, ResourceType, SourceRecord};
use std::collections::{BTreeSet, HashMap, HashSet};

pub const REPLACES: &str = "dc.relation.replaces";
pub const REPLACED_BY: &str = "dc.relation.isreplacedby";
pub const IDENTIFIER_URI: &str = "dc.identifier.uri";

/// Pointer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow `dc.relation.replaces`.
    Older,
    /// Follow `dc.relation.isreplacedby`.
    Newer,
}

/// Read-only snapshot of the version relationships of all legacy items.
/// Built once before traversal and never mutated afterwards.
#[derive(Debug, Default)]
pub struct VersionIndex {
    replaces: HashMap<i64, String>,
    replaced_by: HashMap<i64, String>,
    uri: HashMap<i64, String>,
    by_handle: HashMap<String, i64>,
    withdrawn: HashSet<i64>,
    items: BTreeSet<i64>,
}

impl VersionIndex {
    pub fn build(items: &[SourceRecord], metadata: &MetadataIndex) -> Self {
        let mut index = Self::default();
        for item in items {
            let id = item.legacy_id;
            index.items.insert(id);
            if item.flag("withdrawn") {
                index.withdrawn.insert(id);
            }
            if let Some(v) = metadata.first(ResourceType::Item, id, REPLACES) {
                index.replaces.insert(id, v.to_string());
            }
            if let Some(v) = metadata.first(ResourceType::Item, id, REPLACED_BY) {
                index.replaced_by.insert(id, v.to_string());
            }
            let uris = metadata.values(ResourceType::Item, id, IDENTIFIER_URI);
            if let Some(first) = uris.first() {
                index.uri.insert(id, first.value.clone());
            }
            for uri in uris {
                index.by_handle.entry(uri.value.clone()).or_insert(id);
            }
        }
        index
    }

    pub fn items(&self) -> impl Iterator<Item = i64> + '_ {
        self.items.iter().copied()
    }

    pub fn pointer(&self, item: i64, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Older => self.replaces.get(&item),
            Direction::Newer => self.replaced_by.get(&item),
        }
        .map(String::as_str)
    }

    /// The item's own handle URI.
    pub fn uri(&self, item: i64) -> Option<&str> {
        self.uri.get(&item).map(String::as_str)
    }

    pub fn is_withdrawn(&self, item: i64) -> bool {
        self.withdrawn.contains(&item)
    }

    /// Item owning `handle`, also trying the other URL scheme.
    pub fn resolve(&self, handle: &str) -> Option<i64> {
        if let Some(id) = self.by_handle.get(handle) {
            return Some(*id);
        }
        protocol_variant(handle).and_then(|alt| self.by_handle.get(&alt).copied())
    }

    /// Items with any version pointer.
    pub fn versioned_items(&self) -> BTreeSet<i64> {
        self.replaces
            .keys()
            .chain(self.replaced_by.keys())
            .copied()
            .collect()
    }
}

/// `http://x` for `https://x` and vice versa.
pub fn protocol_variant(handle: &str) -> Option<String> {
    if let Some(rest) = handle.strip_prefix("https://") {
        Some(format!("http://{}", rest))
    } else {
        handle
            .strip_prefix("http://")
            .map(|rest| format!("https://{}", rest))
    }
}

/// Scheme-less form used to compare handles.
pub fn canonical(handle: &str) -> &str {
    handle
        .strip_prefix("https://")
        .or_else(|| handle.strip_prefix("http://"))
        .unwrap_or(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_variants() {
        assert_eq!(
            protocol_variant("http://hdl.handle.net/11234/1-1").as_deref(),
            Some("https://hdl.handle.net/11234/1-1")
        );
        assert_eq!(
            protocol_variant("https://hdl.handle.net/11234/1-1").as_deref(),
            Some("http://hdl.handle.net/11234/1-1")
        );
        assert_eq!(protocol_variant("11234/1-1"), None);
        assert_eq!(canonical("https://a/b"), canonical("http://a/b"));
    }
}
