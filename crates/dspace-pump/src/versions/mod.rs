//! Version history reconstruction.
//!
//! Legacy items link their versions through two metadata pointers,
//! `dc.relation.replaces` and `dc.relation.isreplacedby`. All pointers are
//! loaded into an immutable [`VersionIndex`] first; each lineage is then
//! walked in both directions, ordered oldest first, and written as one
//! `versionhistory` row plus one `versionitem` row per local member.

mod chain;
mod date;
mod index;
mod store;

pub use chain::{ChainMember, VersionChain};
pub use date::{normalize_date, InvalidDate};
pub use index::{canonical, protocol_variant, Direction, VersionIndex};
pub use store::{DateField, PgVersionStore, VersionRow, VersionStore};

use crate::error::{MigrateError, Result};
use crate::identity::{Handle, IdentityMap};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

/// Outcome of one version migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionReport {
    /// Lineages written as a new history.
    pub chains: u64,
    /// `versionitem` rows inserted.
    pub written: u64,
    /// Lineages already present in the destination.
    pub skipped: u64,
    /// Partly written lineages completed into their existing history.
    pub resumed: u64,
    /// Chains or members that could not be written.
    pub failed: u64,
    /// Lineages leaving the repository in both directions.
    pub multi_external: u64,
    /// Destination version rows without a legacy counterpart.
    pub unexpected: u64,
    /// Legacy versioned items missing in the destination.
    pub missing: u64,
    /// Versioned legacy items that were never imported.
    pub unimported: u64,
}

/// What the version pass needs from the item import.
pub struct VersionInputs<'a> {
    pub index: &'a VersionIndex,
    /// Legacy item id to destination uuid.
    pub items: &'a IdentityMap,
    /// Legacy ids of items still in workspace or workflow.
    pub pending: &'a BTreeSet<i64>,
    pub date_fields: &'a [String],
}

/// First configured date field with a value, normalized.
async fn version_date(
    store: &mut dyn VersionStore,
    fields: &[DateField],
    legacy_id: i64,
    uuid: &Handle,
) -> Result<String> {
    for field in fields {
        if let Some(raw) = store.version_date(uuid, field).await? {
            return normalize_date(&raw)
                .map_err(|e| MigrateError::record("item", legacy_id, e.to_string()));
        }
    }
    Err(MigrateError::record(
        "item",
        legacy_id,
        format!("no version date on {}", uuid),
    ))
}

/// Write every lineage not yet present in the destination, then compare
/// legacy and destination version rows.
pub async fn migrate_versions(
    inputs: &VersionInputs<'_>,
    store: &mut dyn VersionStore,
) -> Result<VersionReport> {
    if inputs.date_fields.is_empty() {
        return Err(MigrateError::Config(
            "migration.version_date_fields must not be empty".into(),
        ));
    }
    let fields = inputs
        .date_fields
        .iter()
        .map(|f| DateField::parse(f))
        .collect::<Result<Vec<_>>>()?;

    let mut report = VersionReport::default();
    let mut existing = store.versioned_items().await?;
    let mut processed: HashSet<i64> = HashSet::new();
    info!(
        "Migrating versions of {} items, {} version rows already present",
        inputs.index.items().count(),
        existing.len()
    );

    for item in inputs.index.items() {
        if processed.contains(&item) {
            continue;
        }
        let chain = match inputs.index.get_all_versions(item) {
            Ok(Some(chain)) => chain,
            Ok(None) => continue,
            Err(e) => {
                // One broken pointer fails the whole lineage, counted once.
                error!("{}", e);
                report.failed += 1;
                processed.extend(inputs.index.reachable(item));
                continue;
            }
        };
        processed.extend(chain.local_items());

        if chain.external_segments > 1 {
            warn!(
                "Item {}: version chain leaves the repository {} times",
                item, chain.external_segments
            );
            report.multi_external += 1;
        }

        let members: Vec<(i64, i64, Option<&Handle>)> = chain
            .members
            .iter()
            .enumerate()
            .filter_map(|(n, m)| m.item.map(|id| (n as i64 + 1, id, inputs.items.get(id))))
            .collect();
        let written: Vec<&Handle> = members
            .iter()
            .filter_map(|(_, _, uuid)| *uuid)
            .filter(|u| existing.contains(u.as_str()))
            .collect();
        let imported = members.iter().filter(|(_, _, uuid)| uuid.is_some()).count();
        let history = match written.first() {
            None => None,
            Some(_) if written.len() == imported => {
                debug!("Item {}: versions already migrated", item);
                report.skipped += 1;
                continue;
            }
            Some(first) => match store.history_of(first).await? {
                Some(id) => {
                    info!(
                        "Item {}: {} of {} versions present, completing history {}",
                        item,
                        written.len(),
                        imported,
                        id
                    );
                    Some(id)
                }
                None => {
                    warn!(
                        "Item {}: version row of {} has no history, leaving lineage as is",
                        item, first
                    );
                    report.skipped += 1;
                    continue;
                }
            },
        };

        let mut rows = Vec::new();
        for (number, legacy_id, uuid) in members {
            if uuid.map_or(false, |u| existing.contains(u.as_str())) {
                continue;
            }
            let Some(uuid) = uuid else {
                error!(
                    "CRITICAL item [{}]: version member was not imported, skipping it",
                    legacy_id
                );
                report.failed += 1;
                continue;
            };
            match version_date(store, &fields, legacy_id, uuid).await {
                Ok(date) => rows.push(VersionRow {
                    history_id: 0,
                    version_number: number,
                    date,
                    item: uuid.clone(),
                }),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("{}", e);
                    report.failed += 1;
                }
            }
        }
        for member in chain.members.iter().filter(|m| m.item.is_none()) {
            info!(
                "Version {} is stored in another repository, not migrated",
                member.handle
            );
        }
        if rows.is_empty() {
            continue;
        }

        let history_id = match history {
            Some(id) => {
                report.resumed += 1;
                id
            }
            None => {
                report.chains += 1;
                store.allocate_history().await?
            }
        };
        for mut row in rows {
            row.history_id = history_id;
            store.insert_version(&row).await?;
            existing.insert(row.item.as_str().to_string());
            report.written += 1;
        }
    }

    cross_check(inputs, store, &mut report).await?;
    info!(
        "Migrated versions: {} chains, {} resumed, {} rows, {} skipped, {} failed, \
         {} multi-external, {} unimported",
        report.chains,
        report.resumed,
        report.written,
        report.skipped,
        report.failed,
        report.multi_external,
        report.unimported
    );
    Ok(report)
}

/// Compare items carrying version metadata with rows in `versionitem`.
/// Discrepancies are warnings.
async fn cross_check(
    inputs: &VersionInputs<'_>,
    store: &mut dyn VersionStore,
    report: &mut VersionReport,
) -> Result<()> {
    let pending: BTreeSet<&str> = inputs
        .pending
        .iter()
        .filter_map(|id| inputs.items.get(*id))
        .map(Handle::as_str)
        .collect();
    let versioned: Vec<i64> = inputs
        .index
        .versioned_items()
        .into_iter()
        .filter(|id| !inputs.pending.contains(id) && !inputs.index.is_withdrawn(*id))
        .collect();
    let unimported: Vec<i64> = versioned
        .iter()
        .copied()
        .filter(|id| inputs.items.get(*id).is_none())
        .collect();
    if !unimported.is_empty() {
        warn!(
            "{} versioned legacy items were never imported",
            unimported.len()
        );
        for id in &unimported {
            warn!("  unimported version item [{}]", id);
        }
    }
    let expected: BTreeSet<&str> = versioned
        .iter()
        .filter_map(|id| inputs.items.get(*id))
        .map(Handle::as_str)
        .collect();
    let written = store.versioned_items().await?;

    let unexpected: Vec<&String> = written
        .iter()
        .filter(|uuid| !pending.contains(uuid.as_str()) && !expected.contains(uuid.as_str()))
        .collect();
    if !unexpected.is_empty() {
        warn!(
            "{} rows in versionitem have no legacy version metadata",
            unexpected.len()
        );
        for uuid in &unexpected {
            warn!("  unexpected version item {}", uuid);
        }
    }

    let missing: Vec<&&str> = expected
        .iter()
        .filter(|uuid| !written.contains(**uuid))
        .collect();
    if !missing.is_empty() {
        warn!("{} versioned legacy items are not in versionitem", missing.len());
        for uuid in &missing {
            warn!("  missing version item {}", uuid);
        }
    }

    report.unexpected = unexpected.len() as u64;
    report.missing = missing.len() as u64;
    report.unimported = unimported.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::index::{IDENTIFIER_URI, REPLACED_BY, REPLACES};
    use super::*;
    use crate::legacy::testing::{store, MemoryRecords};
    use crate::legacy::ResourceType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeVersions {
        dates: BTreeMap<(String, String), String>,
        histories: i64,
        rows: Vec<VersionRow>,
        preexisting: BTreeSet<String>,
    }

    impl FakeVersions {
        fn date(mut self, uuid: &str, field: &str, value: &str) -> Self {
            self.dates
                .insert((uuid.to_string(), field.to_string()), value.to_string());
            self
        }
    }

    #[async_trait]
    impl VersionStore for FakeVersions {
        async fn versioned_items(&mut self) -> Result<BTreeSet<String>> {
            let mut all = self.preexisting.clone();
            all.extend(self.rows.iter().map(|r| r.item.as_str().to_string()));
            Ok(all)
        }

        async fn version_date(&mut self, item: &Handle, field: &DateField) -> Result<Option<String>> {
            let name = match &field.qualifier {
                Some(q) => format!("{}.{}.{}", field.schema, field.element, q),
                None => format!("{}.{}", field.schema, field.element),
            };
            Ok(self.dates.get(&(item.as_str().to_string(), name)).cloned())
        }

        async fn history_of(&mut self, item: &Handle) -> Result<Option<i64>> {
            Ok(self
                .rows
                .iter()
                .find(|r| r.item == *item)
                .map(|r| r.history_id))
        }

        async fn allocate_history(&mut self) -> Result<i64> {
            self.histories += 1;
            Ok(self.histories)
        }

        async fn insert_version(&mut self, row: &VersionRow) -> Result<()> {
            self.rows.push(row.clone());
            Ok(())
        }
    }

    fn hdl(n: i64) -> String {
        format!("http://hdl.handle.net/11234/1-{}", n)
    }

    fn uuid(n: i64) -> String {
        format!("u-{}", n)
    }

    struct Fixture {
        index: VersionIndex,
        items: IdentityMap,
        pending: BTreeSet<i64>,
        fields: Vec<String>,
    }

    impl Fixture {
        fn inputs(&self) -> VersionInputs<'_> {
            VersionInputs {
                index: &self.index,
                items: &self.items,
                pending: &self.pending,
                date_fields: &self.fields,
            }
        }
    }

    /// Items 1..=n, each replaced by the next.
    async fn lineage(n: i64, withdrawn: &[i64]) -> Fixture {
        let handles: Vec<String> = (1..=n + 1).map(hdl).collect();
        let mut metadata = Vec::new();
        for id in 1..=n {
            let i = id as usize - 1;
            metadata.push((ResourceType::Item, id, IDENTIFIER_URI, handles[i].as_str()));
            if id > 1 {
                metadata.push((ResourceType::Item, id, REPLACES, handles[i - 1].as_str()));
            }
            if id < n {
                metadata.push((ResourceType::Item, id, REPLACED_BY, handles[i + 1].as_str()));
            }
        }
        let rows = (1..=n)
            .map(|id| json!({"item_id": id, "withdrawn": withdrawn.contains(&id)}))
            .collect();
        let mut legacy = store(MemoryRecords::new().with("item", rows).with_metadata(&metadata));
        let index = VersionIndex::build(
            &legacy.table("item").await.unwrap(),
            &legacy.metadata().await.unwrap(),
        );
        let mut items = IdentityMap::new();
        for id in 1..=n {
            items.put("items", id, Handle::new(uuid(id))).unwrap();
        }
        Fixture {
            index,
            items,
            pending: BTreeSet::new(),
            fields: vec!["dc.date.issued".into(), "dc.date.accessioned".into()],
        }
    }

    #[tokio::test]
    async fn test_lineage_is_written_once_oldest_first() {
        let fixture = lineage(3, &[]).await;
        let mut store = FakeVersions::default()
            .date(&uuid(1), "dc.date.issued", "1999")
            .date(&uuid(2), "dc.date.accessioned", "2001-02")
            .date(&uuid(3), "dc.date.issued", "20 May. 2005");

        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.chains, 1);
        assert_eq!(report.written, 3);
        assert_eq!(report.missing, 0);
        assert_eq!(store.histories, 1);
        let rows: Vec<(i64, &str, &str)> = store
            .rows
            .iter()
            .map(|r| (r.version_number, r.date.as_str(), r.item.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![
                (1, "1999-01-01", "u-1"),
                (2, "2001-02-01", "u-2"),
                (3, "2005-05-20", "u-3"),
            ]
        );
    }

    #[tokio::test]
    async fn test_rerun_skips_written_lineages() {
        let fixture = lineage(2, &[]).await;
        let mut store = FakeVersions::default()
            .date(&uuid(1), "dc.date.issued", "1999")
            .date(&uuid(2), "dc.date.issued", "2000");
        migrate_versions(&fixture.inputs(), &mut store).await.unwrap();

        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_date_skips_only_that_member() {
        let fixture = lineage(2, &[]).await;
        let mut store = FakeVersions::default()
            .date(&uuid(1), "dc.date.issued", "1999-13-40")
            .date(&uuid(2), "dc.date.issued", "2000");

        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 1);
        assert_eq!(store.rows[0].version_number, 2);
        // The skipped member shows up in the cross-check.
        assert_eq!(report.missing, 1);
    }

    #[tokio::test]
    async fn test_empty_date_fields_are_fatal() {
        let mut fixture = lineage(2, &[]).await;
        fixture.fields.clear();
        let mut store = FakeVersions::default();
        assert!(matches!(
            migrate_versions(&fixture.inputs(), &mut store).await,
            Err(MigrateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_check_ignores_pending_and_withdrawn() {
        let mut fixture = lineage(3, &[3]).await;
        fixture.pending.insert(2);
        let mut store = FakeVersions {
            preexisting: BTreeSet::from(["u-99".to_string()]),
            ..FakeVersions::default()
        };
        // No dates anywhere: nothing is written.
        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.failed, 3);
        assert_eq!(report.missing, 1);
        assert_eq!(report.unexpected, 1);
        assert_eq!(report.unimported, 0);
    }

    #[tokio::test]
    async fn test_unimported_member_is_reported() {
        let mut fixture = lineage(3, &[]).await;
        let mut items = IdentityMap::new();
        for id in 1..=2 {
            items.put("items", id, Handle::new(uuid(id))).unwrap();
        }
        fixture.items = items;
        let mut store = FakeVersions::default()
            .date(&uuid(1), "dc.date.issued", "1999")
            .date(&uuid(2), "dc.date.issued", "2000");

        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.missing, 0);
        assert_eq!(report.unimported, 1);
    }

    #[tokio::test]
    async fn test_partly_written_lineage_is_completed_in_place() {
        let fixture = lineage(3, &[]).await;
        let mut store = FakeVersions {
            histories: 5,
            rows: vec![VersionRow {
                history_id: 5,
                version_number: 1,
                date: "1999-01-01".into(),
                item: Handle::new(uuid(1)),
            }],
            ..FakeVersions::default()
        }
        .date(&uuid(2), "dc.date.issued", "2000")
        .date(&uuid(3), "dc.date.issued", "2001");

        let report = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(report.chains, 0);
        assert_eq!(report.written, 2);
        assert_eq!(report.missing, 0);
        assert_eq!(store.histories, 5);
        let rows: Vec<(i64, i64, &str)> = store
            .rows
            .iter()
            .map(|r| (r.history_id, r.version_number, r.item.as_str()))
            .collect();
        assert_eq!(rows, vec![(5, 1, "u-1"), (5, 2, "u-2"), (5, 3, "u-3")]);

        let again = migrate_versions(&fixture.inputs(), &mut store).await.unwrap();
        assert_eq!(again.skipped, 1);
        assert_eq!(again.written, 0);
    }

    #[tokio::test]
    async fn test_broken_lineage_fails_once() {
        let mut fixture = lineage(2, &[]).await;
        let handles = [hdl(1), hdl(2)];
        let metadata = vec![
            (ResourceType::Item, 1, IDENTIFIER_URI, handles[0].as_str()),
            (ResourceType::Item, 1, REPLACED_BY, handles[1].as_str()),
            (ResourceType::Item, 2, IDENTIFIER_URI, handles[1].as_str()),
            (ResourceType::Item, 2, REPLACES, handles[0].as_str()),
            (ResourceType::Item, 2, REPLACED_BY, "http://hdl.handle.net/11234/gone"),
        ];
        let rows = vec![
            json!({"item_id": 1, "withdrawn": false}),
            json!({"item_id": 2, "withdrawn": false}),
        ];
        let mut legacy = store(MemoryRecords::new().with("item", rows).with_metadata(&metadata));
        fixture.index = VersionIndex::build(
            &legacy.table("item").await.unwrap(),
            &legacy.metadata().await.unwrap(),
        );
        let mut versions = FakeVersions::default()
            .date(&uuid(1), "dc.date.issued", "1999")
            .date(&uuid(2), "dc.date.issued", "2000");

        let report = migrate_versions(&fixture.inputs(), &mut versions).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, 0);
        assert_eq!(report.chains, 0);
    }
}
