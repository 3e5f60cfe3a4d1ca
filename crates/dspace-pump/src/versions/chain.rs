use super::index::{canonical, Direction, VersionIndex};
use crate::error::{MigrateError, Result};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// One entry of a version chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMember {
    /// Handle URI as written in the pointer metadata.
    pub handle: String,
    /// Legacy item id; `None` for a version stored in another repository.
    pub item: Option<i64>,
}

/// Versions of one lineage, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionChain {
    pub members: Vec<ChainMember>,
    /// Position of the item the chain was built from.
    pub current: usize,
    /// A pointer led back to an already visited handle.
    pub cycle: bool,
    /// Walks that ended in a version outside this repository.
    pub external_segments: usize,
}

impl VersionChain {
    pub fn handles(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.handle.as_str()).collect()
    }

    /// Legacy ids of all members present in this repository.
    pub fn local_items(&self) -> impl Iterator<Item = i64> + '_ {
        self.members.iter().filter_map(|m| m.item)
    }
}

struct Walk {
    members: Vec<ChainMember>,
    cycle: bool,
    external: bool,
}

impl VersionIndex {
    /// Follow one pointer direction from `start` until the list ends,
    /// leaves the repository or revisits a handle.
    fn walk(&self, start: i64, direction: Direction) -> Result<Walk> {
        let mut visited: HashSet<&str> = HashSet::new();
        if let Some(own) = self.uri(start) {
            visited.insert(canonical(own));
        }
        let mut walk = Walk {
            members: Vec::new(),
            cycle: false,
            external: false,
        };

        let mut current = start;
        while let Some(pointer) = self.pointer(current, direction) {
            if !visited.insert(canonical(pointer)) {
                warn!(
                    "Cyclic version reference at {} (item {}), stopping walk",
                    pointer, current
                );
                walk.cycle = true;
                break;
            }
            match self.resolve(pointer) {
                Some(next) => {
                    walk.members.push(ChainMember {
                        handle: pointer.to_string(),
                        item: Some(next),
                    });
                    current = next;
                }
                None if self.is_withdrawn(current) => {
                    debug!(
                        "Version {} of withdrawn item {} is stored elsewhere",
                        pointer, current
                    );
                    walk.members.push(ChainMember {
                        handle: pointer.to_string(),
                        item: None,
                    });
                    walk.external = true;
                    break;
                }
                None => {
                    return Err(MigrateError::record(
                        "item",
                        current,
                        format!("version {} was not imported", pointer),
                    ));
                }
            }
        }
        Ok(walk)
    }

    /// Local items linked to `item` through resolvable pointers in either
    /// direction, `item` included. Used to retire a lineage whose walk failed.
    pub fn reachable(&self, item: i64) -> BTreeSet<i64> {
        let mut seen = BTreeSet::from([item]);
        let mut queue = vec![item];
        while let Some(current) = queue.pop() {
            for direction in [Direction::Older, Direction::Newer] {
                let next = self
                    .pointer(current, direction)
                    .and_then(|pointer| self.resolve(pointer));
                if let Some(next) = next {
                    if seen.insert(next) {
                        queue.push(next);
                    }
                }
            }
        }
        seen
    }

    /// Every version of `item`, oldest first, including `item` itself.
    ///
    /// Returns `None` for items without version pointers.
    pub fn get_all_versions(&self, item: i64) -> Result<Option<VersionChain>> {
        let older = self.walk(item, Direction::Older)?;
        let newer = self.walk(item, Direction::Newer)?;
        if older.members.is_empty() && newer.members.is_empty() {
            return Ok(None);
        }
        let own = self
            .uri(item)
            .ok_or_else(|| MigrateError::record("item", item, "no dc.identifier.uri"))?;

        let current = older.members.len();
        let mut members: Vec<ChainMember> = older.members.into_iter().rev().collect();
        members.push(ChainMember {
            handle: own.to_string(),
            item: Some(item),
        });
        members.extend(newer.members);

        Ok(Some(VersionChain {
            members,
            current,
            cycle: older.cycle || newer.cycle,
            external_segments: older.external as usize + newer.external as usize,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::index::{IDENTIFIER_URI, REPLACED_BY, REPLACES};
    use super::*;
    use crate::legacy::testing::{store, MemoryRecords};
    use crate::legacy::ResourceType;
    use serde_json::json;

    fn hdl(n: &str) -> String {
        format!("http://hdl.handle.net/11234/{}", n)
    }

    /// Items with (id, withdrawn, uri, replaces, isreplacedby).
    async fn index(items: &[(i64, bool, &str, Option<&str>, Option<&str>)]) -> VersionIndex {
        let uris: Vec<String> = items.iter().map(|i| hdl(i.2)).collect();
        let replaces: Vec<Option<String>> = items.iter().map(|i| i.3.map(hdl)).collect();
        let newer: Vec<Option<String>> = items.iter().map(|i| i.4.map(hdl)).collect();
        let mut metadata = Vec::new();
        for (n, item) in items.iter().enumerate() {
            metadata.push((ResourceType::Item, item.0, IDENTIFIER_URI, uris[n].as_str()));
            if let Some(r) = &replaces[n] {
                metadata.push((ResourceType::Item, item.0, REPLACES, r.as_str()));
            }
            if let Some(r) = &newer[n] {
                metadata.push((ResourceType::Item, item.0, REPLACED_BY, r.as_str()));
            }
        }
        let rows = items
            .iter()
            .map(|i| json!({"item_id": i.0, "withdrawn": i.1}))
            .collect();
        let mut legacy = store(MemoryRecords::new().with("item", rows).with_metadata(&metadata));
        let items = legacy.table("item").await.unwrap();
        let meta = legacy.metadata().await.unwrap();
        VersionIndex::build(&items, &meta)
    }

    #[tokio::test]
    async fn test_linear_chain_from_the_middle() {
        let index = index(&[
            (1, false, "a", None, Some("b")),
            (2, false, "b", Some("a"), Some("c")),
            (3, false, "c", Some("b"), None),
        ])
        .await;
        let chain = index.get_all_versions(2).unwrap().unwrap();
        assert_eq!(chain.handles(), vec![hdl("a"), hdl("b"), hdl("c")]);
        assert_eq!(chain.current, 1);
        assert!(!chain.cycle);
        assert_eq!(chain.local_items().collect::<Vec<_>>(), vec![1, 2, 3]);

        // Same lineage from either end.
        assert_eq!(index.get_all_versions(1).unwrap().unwrap().handles(), chain.handles());
        assert_eq!(index.get_all_versions(3).unwrap().unwrap().handles(), chain.handles());
    }

    #[tokio::test]
    async fn test_item_without_pointers_has_no_chain() {
        let index = index(&[(1, false, "a", None, None)]).await;
        assert_eq!(index.get_all_versions(1).unwrap(), None);
    }

    #[tokio::test]
    async fn test_cycle_terminates_with_partial_chain() {
        // a -> b -> a in the newer direction.
        let index = index(&[
            (1, false, "a", None, Some("b")),
            (2, false, "b", None, Some("a")),
        ])
        .await;
        let chain = index.get_all_versions(1).unwrap().unwrap();
        assert!(chain.cycle);
        assert_eq!(chain.handles(), vec![hdl("a"), hdl("b")]);
    }

    #[tokio::test]
    async fn test_pointer_with_other_scheme_resolves() {
        let index = index(&[
            (1, false, "a", None, Some("b")),
            (2, false, "b", Some("a"), None),
        ])
        .await;
        let https_a = hdl("a").replacen("http://", "https://", 1);
        assert_eq!(index.resolve(&https_a), Some(1));
        assert_eq!(index.resolve(&hdl("zzz")), None);
    }

    #[tokio::test]
    async fn test_withdrawn_item_may_point_outside() {
        let index = index(&[(1, true, "a", None, Some("elsewhere"))]).await;
        let chain = index.get_all_versions(1).unwrap().unwrap();
        assert_eq!(chain.external_segments, 1);
        assert_eq!(chain.members[1].item, None);
        assert_eq!(chain.local_items().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_unimported_version_is_a_record_error() {
        let index = index(&[(1, false, "a", Some("missing"), None)]).await;
        assert!(matches!(
            index.get_all_versions(1),
            Err(MigrateError::Record { legacy_id: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_reachable_crosses_broken_links() {
        let index = index(&[
            (1, false, "a", None, Some("b")),
            (2, false, "b", Some("a"), Some("missing")),
            (3, false, "c", Some("b"), None),
            (4, false, "d", None, None),
        ])
        .await;
        assert!(index.get_all_versions(1).is_err());
        assert_eq!(index.reachable(3), BTreeSet::from([1, 2, 3]));
        assert_eq!(index.reachable(4), BTreeSet::from([4]));
    }

    #[tokio::test]
    async fn test_both_directions_external() {
        let index = index(&[(1, true, "a", Some("old"), Some("new"))]).await;
        let chain = index.get_all_versions(1).unwrap().unwrap();
        assert_eq!(chain.external_segments, 2);
        assert_eq!(chain.handles(), vec![hdl("old"), hdl("a"), hdl("new")]);
    }
}
