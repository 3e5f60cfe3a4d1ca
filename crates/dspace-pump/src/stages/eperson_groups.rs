//! Plain legacy groups and the group hierarchy.

use super::groups::group_name;
use super::{
    absorb, create, finish, link, log_before, maps, unknown_phase, Lookup, Phase, Stage,
    StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::ResourceType;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

pub(super) struct EpersonGroups;

/// Groups named after their object are created together with the object.
const ROLE_PREFIXES: [&str; 2] = ["COLLECTION_", "COMMUNITY_"];

/// Destination groups of a legacy group, from earlier stages and this one.
fn all_groups(earlier: &Lookup, checkpoint: &Checkpoint, legacy_id: i64) -> Vec<Handle> {
    let mut found: Vec<Handle> = earlier.groups(legacy_id).into_iter().cloned().collect();
    if let Some(own) = checkpoint.multi_map(maps::GROUP) {
        for handle in own.get(legacy_id) {
            if !found.contains(handle) {
                found.push(handle.clone());
            }
        }
    }
    found
}

async fn groups(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("epersongroup").await?;
    let metadata = ctx.legacy.metadata().await?;

    let key = "eperson groups";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for group in legacy.iter() {
        let id = group.legacy_id;
        if !all_groups(ctx.earlier, checkpoint, id).is_empty() {
            counters.imported += 1;
            continue;
        }
        let Some(name) = group_name(group, &metadata) else {
            absorb(&mut counters, MigrateError::record("epersongroup", id, "group has no name"))?;
            continue;
        };
        if ROLE_PREFIXES.iter().any(|p| name.starts_with(p)) {
            warn!("Group {} [{}] belongs to an object that was not imported", name, id);
            counters.skipped += 1;
            continue;
        }
        let request = ApiRequest::post("eperson/groups").json(json!({
            "name": name,
            "metadata": metadata.to_json(ResourceType::Group, id).unwrap_or(Value::Null),
        }));
        match create(ctx.client, &request, "epersongroup", id).await {
            Ok(handle) => {
                checkpoint.multi_map_mut(maps::GROUP).put(id, handle);
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Groups, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Groups, key, counters);
    Ok(())
}

async fn subgroups(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("group2group").await?;

    let key = "group2group";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for row in legacy.iter() {
        let (parent_id, child_id) = match (row.require_int("parent_id"), row.require_int("child_id")) {
            (Ok(p), Ok(c)) => (p, c),
            (Err(e), _) | (_, Err(e)) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        if checkpoint.has_link(maps::SUBGROUP, parent_id, child_id) {
            counters.imported += 1;
            continue;
        }
        let parents = all_groups(ctx.earlier, checkpoint, parent_id);
        let children = all_groups(ctx.earlier, checkpoint, child_id);
        if parents.is_empty() || children.is_empty() {
            let e = format!("group {} or {} was not imported", parent_id, child_id);
            absorb(&mut counters, MigrateError::record("group2group", row.legacy_id, e))?;
            continue;
        }

        let mut linked = true;
        for parent in &parents {
            let uris = children
                .iter()
                .map(|c| ctx.api_uri(&format!("eperson/groups/{}", c)))
                .collect();
            let request =
                ApiRequest::post(format!("clarin/eperson/groups/{}/subgroups", parent)).uri_list(uris);
            if let Err(e) = link(ctx.client, &request).await {
                absorb(&mut counters, e)?;
                linked = false;
                break;
            }
        }
        if linked {
            checkpoint.links_mut(maps::SUBGROUP).insert((parent_id, child_id));
            counters.imported += 1;
            ctx.tick(checkpoint, Phase::Subgroups, &counters)?;
        }
    }
    finish(checkpoint, Phase::Subgroups, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for EpersonGroups {
    fn kind(&self) -> StageKind {
        StageKind::EpersonGroups
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Groups => groups(ctx, checkpoint).await,
            Phase::Subgroups => subgroups(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{numbering_backend, Harness};
    use super::*;
    use crate::legacy::testing::MemoryRecords;
    use crate::transport::testing::FakeBackend;
    use crate::transport::{ApiMethod, RawResponse, RequestBody};

    fn records() -> MemoryRecords {
        MemoryRecords::new()
            .with(
                "epersongroup",
                vec![
                    json!({"eperson_group_id": 0, "name": "Anonymous"}),
                    json!({"eperson_group_id": 5, "name": "Editors"}),
                    json!({"eperson_group_id": 6, "name": "Reviewers"}),
                    json!({"eperson_group_id": 7, "name": "COLLECTION_9_SUBMIT"}),
                ],
            )
            .with(
                "group2group",
                vec![
                    json!({"id": 1, "parent_id": 5, "child_id": 6}),
                    json!({"id": 2, "parent_id": 5, "child_id": 7}),
                ],
            )
    }

    fn harness(backend: std::sync::Arc<FakeBackend>) -> Harness {
        let mut harness = Harness::new(records(), backend);
        let mut existing = Checkpoint::new(StageKind::Groups, "test");
        existing.multi_map_mut(maps::GROUP).put(0, "anonymous".into());
        harness.finished(existing);
        harness
    }

    #[tokio::test]
    async fn test_only_plain_groups_are_created() {
        let mut harness = harness(numbering_backend());
        let checkpoint = harness.run(StageKind::EpersonGroups).await.unwrap();

        let posts = harness.posts("eperson/groups");
        let names: Vec<&Value> = posts
            .iter()
            .map(|p| &p.json_body().unwrap()["name"])
            .collect();
        assert_eq!(names, vec!["Editors", "Reviewers"]);

        let counters = &checkpoint.counters["groups"];
        assert_eq!((counters.imported, counters.skipped), (3, 1));
        // The role group was never created, so its link fails.
        assert_eq!(checkpoint.counters["subgroups"].failed, 1);
    }

    #[tokio::test]
    async fn test_subgroup_link_uses_absolute_uris() {
        let mut harness = harness(numbering_backend());
        let checkpoint = harness.run(StageKind::EpersonGroups).await.unwrap();

        let groups = checkpoint.multi_map(maps::GROUP).unwrap();
        let parent = &groups.get(5)[0];
        let child = &groups.get(6)[0];
        let posts = harness.posts(&format!("clarin/eperson/groups/{}/subgroups", parent));
        assert_eq!(posts.len(), 1);
        assert_eq!(
            posts[0].body,
            Some(RequestBody::UriList(vec![
                harness.config.api_url(&format!("eperson/groups/{}", child))
            ]))
        );
        assert!(checkpoint.has_link(maps::SUBGROUP, 5, 6));
    }

    #[tokio::test]
    async fn test_existing_subgroup_link_counts_as_done() {
        let backend = FakeBackend::with_handler(|request| {
            Ok(match request.method {
                ApiMethod::Post if request.path.ends_with("/subgroups") => {
                    RawResponse::new(409, "already a member")
                }
                _ => RawResponse::new(201, json!({"id": "g"}).to_string()),
            })
        });
        let mut harness = harness(backend);
        let checkpoint = harness.run(StageKind::EpersonGroups).await.unwrap();
        assert_eq!(checkpoint.counters["subgroups"].imported, 1);
        assert!(checkpoint.has_link(maps::SUBGROUP, 5, 6));
    }
}
