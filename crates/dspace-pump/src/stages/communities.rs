//! Communities, parents before children, and their administrator groups.

use super::{
    absorb, create, finish, log_before, maps, unknown_phase, HandleIndex, Phase, Stage,
    StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::legacy::{ResourceType, SourceRecord};
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

pub(super) struct Communities;

/// Community ids ordered so that every parent precedes its children.
/// Members of a parent cycle are returned last, in id order.
pub(super) fn parents_first(
    communities: &[SourceRecord],
    links: &[SourceRecord],
) -> (Vec<i64>, BTreeMap<i64, i64>) {
    let parent_of: BTreeMap<i64, i64> = links
        .iter()
        .filter_map(|l| Some((l.int("child_comm_id")?, l.int("parent_comm_id")?)))
        .collect();

    let known: BTreeSet<i64> = communities.iter().map(|c| c.legacy_id).collect();
    let mut pending = known.clone();
    let mut order = Vec::with_capacity(pending.len());
    let mut placed = BTreeSet::new();
    loop {
        let ready: Vec<i64> = pending
            .iter()
            .copied()
            .filter(|id| match parent_of.get(id) {
                Some(parent) if known.contains(parent) => placed.contains(parent),
                _ => true,
            })
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            pending.remove(&id);
            placed.insert(id);
            order.push(id);
        }
    }
    if !pending.is_empty() {
        warn!("Communities {:?} form a parent cycle", pending);
        order.extend(pending);
    }
    (order, parent_of)
}

/// `{handle, metadata}` body shared by communities and collections.
pub(super) fn object_body(handle: Option<&str>, metadata: Option<Value>) -> Value {
    let mut body = Map::new();
    if let Some(handle) = handle {
        body.insert("handle".into(), Value::from(handle));
    }
    if let Some(metadata) = metadata {
        body.insert("metadata".into(), metadata);
    }
    Value::Object(body)
}

async fn communities(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("community").await?;
    let links = ctx.legacy.table("community2community").await?;
    let handles = HandleIndex::build(&ctx.legacy.table("handle").await?);
    let metadata = ctx.legacy.metadata().await?;
    let (order, parent_of) = parents_first(&legacy, &links);

    let key = "communities";
    let mut counters = PhaseCounters {
        expected: order.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for id in order {
        if checkpoint.is_mapped(maps::COMMUNITY, id) {
            counters.imported += 1;
            continue;
        }
        let parent = match parent_of.get(&id) {
            Some(parent_id) => {
                let Some(handle) = checkpoint
                    .map(maps::COMMUNITY)
                    .and_then(|m| m.get(*parent_id))
                    .cloned()
                else {
                    let e = format!("parent {} was not imported", parent_id);
                    absorb(&mut counters, MigrateError::record("community", id, e))?;
                    continue;
                };
                Some(handle)
            }
            None => None,
        };
        let request = ApiRequest::post("core/communities")
            .param_opt("parent", parent)
            .json(object_body(
                handles.get(ResourceType::Community, id),
                metadata.to_json(ResourceType::Community, id),
            ));
        match create(ctx.client, &request, "community", id).await {
            Ok(handle) => {
                checkpoint.put(maps::COMMUNITY, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Communities, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Communities, key, counters);
    Ok(())
}

async fn admin_groups(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("community").await?;
    let with_admin: Vec<(i64, i64)> = legacy
        .iter()
        .filter_map(|c| Some((c.legacy_id, c.int("admin")?)))
        .collect();

    let key = "community admin groups";
    let mut counters = PhaseCounters {
        expected: with_admin.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for (id, group) in with_admin {
        if checkpoint.multi_map(maps::GROUP).map_or(false, |m| m.contains(group)) {
            counters.imported += 1;
            continue;
        }
        let Some(community) = checkpoint
            .map(maps::COMMUNITY)
            .and_then(|m| m.get(id))
            .cloned()
        else {
            counters.skipped += 1;
            continue;
        };
        let request = ApiRequest::post(format!("core/communities/{}/adminGroup", community))
            .json(Value::Object(Map::new()));
        match create(ctx.client, &request, "community admin group", group).await {
            Ok(handle) => {
                checkpoint.multi_map_mut(maps::GROUP).put(group, handle);
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::AdminGroups, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::AdminGroups, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Communities {
    fn kind(&self) -> StageKind {
        StageKind::Communities
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Communities => communities(ctx, checkpoint).await,
            Phase::AdminGroups => admin_groups(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
