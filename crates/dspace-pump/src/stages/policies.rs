//! Resource policies.
//!
//! The destination creates default policies for every imported object, so
//! the table is emptied first and every legacy policy is written again.

use super::{
    absorb, create, critical, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext,
    StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::{ResourceType, SourceRecord};
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

pub(super) struct ResourcePolicies;

/// Legacy action ids, by position.
pub const ACTIONS: [&str; 13] = [
    "READ",
    "WRITE",
    "OBSOLETE_DELETE",
    "ADD",
    "REMOVE",
    "WORKFLOW_STEP_1",
    "WORKFLOW_STEP_2",
    "WORKFLOW_STEP_3",
    "WORKFLOW_ABORT",
    "DEFAULT_BITSTREAM_READ",
    "DEFAULT_ITEM_READ",
    "ADMIN",
    "WITHDRAWN_READ",
];

const DEFAULT_BITSTREAM_READ: &str = "DEFAULT_BITSTREAM_READ";

/// Destination name of a legacy action id.
pub fn action_name(id: i64) -> Option<&'static str> {
    usize::try_from(id).ok().and_then(|i| ACTIONS.get(i).copied())
}

async fn purge(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let deleted = ctx.dbs.dspace7.delete_all_verified("resourcepolicy").await?;
    let mut counters = PhaseCounters {
        expected: deleted,
        imported: deleted,
        ..PhaseCounters::default()
    };
    counters.extra.insert("deleted".to_string(), deleted);
    finish(checkpoint, Phase::Purge, "resourcepolicy purge", counters);
    Ok(())
}

/// The one destination group a group policy applies to.
///
/// A collection's default read group was split into a bitstream and an item
/// read group; the action decides which one the policy belongs to.
fn policy_group<'a>(ctx: &'a StageContext<'_>, group: i64, action: &str) -> Result<Option<&'a Handle>> {
    let groups = ctx.earlier.groups(group);
    match groups.len() {
        0 => Ok(None),
        1 => Ok(groups.first().copied()),
        2 => {
            let role = if action == DEFAULT_BITSTREAM_READ {
                maps::BITSTREAM_READ_GROUP
            } else {
                maps::ITEM_READ_GROUP
            };
            ctx.earlier
                .get(StageKind::Collections, role, group)
                .filter(|h| groups.contains(h))
                .map(Some)
                .ok_or_else(|| {
                    MigrateError::Invariant(format!("group {} has no {} destination group", group, role))
                })
        }
        n => Err(MigrateError::Invariant(format!(
            "group {} maps to {} destination groups",
            group, n
        ))),
    }
}

enum Prepared {
    Request(ApiRequest),
    /// The record was counted already.
    Handled,
}

fn prepare(
    ctx: &StageContext<'_>,
    counters: &mut PhaseCounters,
    policy: &SourceRecord,
) -> Result<Prepared> {
    let id = policy.legacy_id;
    let resource_id = policy.require_int("resource_id")?;
    let type_id = policy.require_int("resource_type_id")?;
    let rtype = ResourceType::from_id(type_id).ok_or_else(|| {
        MigrateError::record("resourcepolicy", id, format!("unknown resource type {}", type_id))
    })?;
    let Some(resource) = ctx.earlier.object(rtype, resource_id) else {
        if matches!(rtype, ResourceType::Item | ResourceType::Bundle) {
            // Policies may outlive their deleted item or bundle.
            info!("Policy [{}] points to deleted {:?} [{}]", id, rtype, resource_id);
            counters.skipped += 1;
            *counters.extra.entry("deleted_resource".to_string()).or_default() += 1;
        } else {
            let message = format!("{:?} [{}] was not imported", rtype, resource_id);
            critical(counters, "resourcepolicy", id, &message);
        }
        return Ok(Prepared::Handled);
    };
    let action_id = policy.int("action_id").unwrap_or(-1);
    let action = action_name(action_id).ok_or_else(|| {
        MigrateError::record("resourcepolicy", id, format!("invalid action id {}", action_id))
    })?;

    let request = ApiRequest::post("authz/resourcepolicies")
        .param("resource", resource)
        .json(json!({
            "action": action,
            "startDate": policy.value("start_date"),
            "endDate": policy.value("end_date"),
            "name": policy.value("rpname"),
            "policyType": policy.value("rptype"),
            "description": policy.value("rpdescription"),
        }));

    if let Some(eperson) = policy.int("eperson_id") {
        let handle = ctx
            .earlier
            .get(StageKind::People, maps::EPERSON, eperson)
            .ok_or_else(|| {
                MigrateError::record("resourcepolicy", id, format!("eperson {} was not imported", eperson))
            })?;
        return Ok(Prepared::Request(request.param("eperson", handle)));
    }
    if let Some(group) = policy.int("epersongroup_id") {
        return match policy_group(ctx, group, action)? {
            Some(handle) => Ok(Prepared::Request(request.param("group", handle))),
            None => {
                warn!("Policy [{}]: group {} was not imported", id, group);
                counters.skipped += 1;
                Ok(Prepared::Handled)
            }
        };
    }
    Err(MigrateError::record("resourcepolicy", id, "neither eperson nor group is set"))
}

async fn import(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("resourcepolicy").await?;

    let key = "resourcepolicies";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for policy in legacy.iter() {
        let id = policy.legacy_id;
        if checkpoint.is_mapped(maps::POLICY, id) {
            counters.imported += 1;
            continue;
        }
        let request = match prepare(ctx, &mut counters, policy) {
            Ok(Prepared::Request(request)) => request,
            Ok(Prepared::Handled) => continue,
            Err(e) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        match create(ctx.client, &request, "resourcepolicy", id).await {
            Ok(handle) => {
                checkpoint.put(maps::POLICY, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Import, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Import, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for ResourcePolicies {
    fn kind(&self) -> StageKind {
        StageKind::ResourcePolicies
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Purge => purge(ctx, checkpoint).await,
            Phase::Import => import(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
