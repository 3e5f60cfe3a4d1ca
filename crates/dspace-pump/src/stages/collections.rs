//! Collections and the groups the destination creates for them.
//!
//! A collection's default read group becomes two destination groups, one
//! for bitstreams and one for items. Both are recorded under the legacy
//! group id in the shared group map and, per role, in a role map that the
//! resource policy import uses to pick one of the two.

use super::communities::object_body;
use super::{
    absorb, create, finish, log_before, maps, unknown_phase, HandleIndex, Phase, Stage,
    StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::legacy::ResourceType;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub(super) struct Collections;

/// Legacy action ids of default read policies.
const DEFAULT_BITSTREAM_READ: i64 = 9;
const DEFAULT_ITEM_READ: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupRole {
    Editor,
    Submitter,
    BitstreamRead,
    ItemRead,
}

impl GroupRole {
    fn endpoint(&self) -> &'static str {
        match self {
            GroupRole::Editor => "workflowGroups/editor",
            GroupRole::Submitter => "submittersGroup",
            GroupRole::BitstreamRead => "bitstreamReadGroup",
            GroupRole::ItemRead => "itemReadGroup",
        }
    }

    fn role_map(&self) -> Option<&'static str> {
        match self {
            GroupRole::BitstreamRead => Some(maps::BITSTREAM_READ_GROUP),
            GroupRole::ItemRead => Some(maps::ITEM_READ_GROUP),
            _ => None,
        }
    }
}

async fn collections(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("collection").await?;
    let links = ctx.legacy.table("community2collection").await?;
    let handles = HandleIndex::build(&ctx.legacy.table("handle").await?);
    let metadata = ctx.legacy.metadata().await?;
    let community_of: BTreeMap<i64, i64> = links
        .iter()
        .filter_map(|l| Some((l.int("collection_id")?, l.int("community_id")?)))
        .collect();
    let communities = ctx.earlier.map(StageKind::Communities, maps::COMMUNITY);

    let key = "collections";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for collection in legacy.iter() {
        let id = collection.legacy_id;
        if checkpoint.is_mapped(maps::COLLECTION, id) {
            counters.imported += 1;
            continue;
        }
        let Some(parent) = community_of.get(&id).and_then(|c| communities.get(*c)) else {
            let e = MigrateError::record("collection", id, "owning community was not imported");
            absorb(&mut counters, e)?;
            continue;
        };
        let request = ApiRequest::post("core/collections")
            .param("parent", parent)
            .json(object_body(
                handles.get(ResourceType::Collection, id),
                metadata.to_json(ResourceType::Collection, id),
            ));
        match create(ctx.client, &request, "collection", id).await {
            Ok(handle) => {
                checkpoint.put(maps::COLLECTION, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Collections, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Collections, key, counters);
    Ok(())
}

/// `(collection, legacy group, role)` for every group to create.
async fn planned_groups(ctx: &mut StageContext<'_>) -> Result<Vec<(i64, i64, GroupRole)>> {
    let legacy = ctx.legacy.table("collection").await?;
    let policies = ctx.legacy.table("resourcepolicy").await?;
    let default_read: BTreeMap<i64, i64> = policies
        .iter()
        .filter(|p| p.int("resource_type_id") == Some(ResourceType::Collection.id()))
        .filter(|p| {
            matches!(
                p.int("action_id"),
                Some(DEFAULT_BITSTREAM_READ) | Some(DEFAULT_ITEM_READ)
            )
        })
        .filter_map(|p| Some((p.int("resource_id")?, p.int("epersongroup_id")?)))
        .collect();

    let mut planned = Vec::new();
    for collection in legacy.iter() {
        let id = collection.legacy_id;
        if let Some(group) = collection.int("workflow_step_2") {
            planned.push((id, group, GroupRole::Editor));
        }
        if let Some(group) = collection.int("submitter") {
            planned.push((id, group, GroupRole::Submitter));
        }
        if let Some(group) = default_read.get(&id) {
            if ctx.earlier.groups(*group).is_empty() {
                planned.push((id, *group, GroupRole::BitstreamRead));
                planned.push((id, *group, GroupRole::ItemRead));
            } else {
                debug!("Collection {} reads through existing group {}", id, group);
            }
        }
    }
    Ok(planned)
}

fn group_done(checkpoint: &Checkpoint, group: i64, role: GroupRole) -> bool {
    match role.role_map() {
        Some(map) => checkpoint.is_mapped(map, group),
        None => checkpoint
            .multi_map(maps::GROUP)
            .map_or(false, |m| m.contains(group)),
    }
}

async fn collection_groups(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let planned = planned_groups(ctx).await?;

    let key = "collection groups";
    let mut counters = PhaseCounters {
        expected: planned.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for (id, group, role) in planned {
        if group_done(checkpoint, group, role) {
            counters.imported += 1;
            continue;
        }
        let Some(collection) = checkpoint
            .map(maps::COLLECTION)
            .and_then(|m| m.get(id))
            .cloned()
        else {
            counters.skipped += 1;
            continue;
        };
        let request = ApiRequest::post(format!("core/collections/{}/{}", collection, role.endpoint()))
            .json(Value::Object(Map::new()));
        match create(ctx.client, &request, "collection group", group).await {
            Ok(handle) => {
                if let Some(map) = role.role_map() {
                    checkpoint.put(map, group, handle.clone())?;
                }
                checkpoint.multi_map_mut(maps::GROUP).put(group, handle);
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::CollectionGroups, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::CollectionGroups, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Collections {
    fn kind(&self) -> StageKind {
        StageKind::Collections
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Collections => collections(ctx, checkpoint).await,
            Phase::CollectionGroups => collection_groups(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
