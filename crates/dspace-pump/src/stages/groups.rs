//! Groups the destination creates on its own (Anonymous, Administrator).

use super::{
    count, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext, StageKind,
    PAGE_SIZE,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::Result;
use crate::identity::Handle;
use crate::legacy::{MetadataIndex, ResourceType, SourceRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

pub(super) struct Groups;

/// Name of a legacy group: the `name` column, else its `dc.title`.
pub(super) fn group_name<'a>(group: &'a SourceRecord, metadata: &'a MetadataIndex) -> Option<&'a str> {
    group
        .str("name")
        .or_else(|| metadata.first(ResourceType::Group, group.legacy_id, "dc.title"))
}

/// `name -> id` of destination objects read from a listing.
pub(super) fn index_by(objects: &[Value], field: &str) -> HashMap<String, Handle> {
    objects
        .iter()
        .filter_map(|o| {
            let key = o.get(field)?.as_str()?;
            let id = o.get("id").or_else(|| o.get("uuid"))?;
            let id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.to_string(), Handle::from(id)))
        })
        .collect()
}

async fn existing(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("epersongroup").await?;
    let metadata = ctx.legacy.metadata().await?;
    let present = ctx
        .client
        .fetch_all_pages("eperson/groups", "groups", PAGE_SIZE)
        .await?;
    let by_name = index_by(&present, "name");

    let key = "existing groups";
    let mut counters = PhaseCounters {
        expected: count(by_name.len()),
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for group in legacy.iter() {
        let Some(name) = group_name(group, &metadata) else {
            continue;
        };
        let Some(handle) = by_name.get(name) else {
            continue;
        };
        debug!("Group {} [{}] already exists as {}", name, group.legacy_id, handle);
        checkpoint
            .multi_map_mut(maps::GROUP)
            .put(group.legacy_id, handle.clone());
        counters.imported += 1;
    }
    if counters.imported < counters.expected {
        warn!(
            "{} destination groups have no legacy counterpart",
            counters.expected - counters.imported
        );
    }
    finish(checkpoint, Phase::Existing, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Groups {
    fn kind(&self) -> StageKind {
        StageKind::Groups
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Existing => existing(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{page, Harness};
    use super::*;
    use crate::legacy::testing::MemoryRecords;
    use crate::transport::testing::FakeBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_legacy_groups_match_destination_by_name() {
        let records = MemoryRecords::new()
            .with(
                "epersongroup",
                vec![
                    json!({"eperson_group_id": 0, "name": "Anonymous"}),
                    json!({"eperson_group_id": 1}),
                    json!({"eperson_group_id": 5, "name": "Editors"}),
                ],
            )
            .with_metadata(&[(ResourceType::Group, 1, "dc.title", "Administrator")]);
        let backend = FakeBackend::scripted(vec![Ok(page(
            "groups",
            vec![
                json!({"id": "anon-uuid", "name": "Anonymous"}),
                json!({"id": "admin-uuid", "name": "Administrator"}),
            ],
        ))]);
        let mut harness = Harness::new(records, backend);

        let checkpoint = harness.run(StageKind::Groups).await.unwrap();

        let groups = checkpoint.multi_map(maps::GROUP).unwrap();
        assert_eq!(groups.get(0), &[Handle::new("anon-uuid")]);
        assert_eq!(groups.get(1), &[Handle::new("admin-uuid")]);
        assert!(!groups.contains(5));
        let counters = &checkpoint.counters["existing"];
        assert_eq!((counters.expected, counters.imported), (2, 2));
        assert!(checkpoint.progress.is_done());
    }

    #[test]
    fn test_listing_index_accepts_numeric_ids() {
        let index = index_by(
            &[json!({"id": 7, "shortDescription": "PDF"}), json!({"name": "x"})],
            "shortDescription",
        );
        assert_eq!(index.get("PDF"), Some(&Handle::new("7")));
        assert_eq!(index.len(), 1);
    }
}
