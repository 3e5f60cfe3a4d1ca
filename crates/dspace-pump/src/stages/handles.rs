//! Handles that no imported object will bring along.
//!
//! External handles (no type, no object) point outside the repository.
//! Objectless item handles belong to items that were deleted. Handles of
//! live objects are created with their objects.

use super::{
    absorb, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::{ResourceType, SourceRecord};
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

/// First legacy handle of each object.
#[derive(Debug, Default)]
pub struct HandleIndex {
    by_object: HashMap<(i64, i64), String>,
}

impl HandleIndex {
    pub fn build(handles: &[SourceRecord]) -> Self {
        let mut by_object = HashMap::new();
        for row in handles {
            let (Some(rtype), Some(id), Some(handle)) = (
                row.int("resource_type_id"),
                row.int("resource_id"),
                row.str("handle"),
            ) else {
                continue;
            };
            by_object
                .entry((rtype, id))
                .or_insert_with(|| handle.to_string());
        }
        Self { by_object }
    }

    pub fn get(&self, rtype: ResourceType, id: i64) -> Option<&str> {
        self.by_object.get(&(rtype.id(), id)).map(String::as_str)
    }
}

pub(super) struct Handles;

struct Variant {
    phase: Phase,
    key: &'static str,
    path: &'static str,
    /// Destination rows that count as already imported.
    present: &'static str,
}

const EXTERNAL: Variant = Variant {
    phase: Phase::External,
    key: "external handles",
    path: "core/handles",
    present: "SELECT COUNT(*) FROM handle WHERE resource_type_id IS NULL AND resource_id IS NULL",
};

const OBJECTLESS: Variant = Variant {
    phase: Phase::Objectless,
    key: "handles",
    path: "clarin/import/handle",
    present: "SELECT COUNT(*) FROM handle WHERE resource_type_id = 2 AND resource_id IS NULL",
};

fn body(variant: &Variant, row: &SourceRecord) -> serde_json::Value {
    if variant.phase == Phase::External {
        json!({
            "handle": row.value("handle"),
            "url": row.value("url"),
            "dead": row.value("dead"),
            "deadSince": row.value("dead_since"),
        })
    } else {
        json!({
            "handle": row.value("handle"),
            "resourceTypeID": row.value("resource_type_id"),
            "dead": row.value("dead"),
            "deadSince": row.value("dead_since"),
        })
    }
}

async fn import(
    variant: &Variant,
    ctx: &mut StageContext<'_>,
    checkpoint: &mut Checkpoint,
) -> Result<()> {
    let legacy = ctx.legacy.table("handle").await?;
    let rows: Vec<&SourceRecord> = legacy
        .iter()
        .filter(|h| h.int("resource_id").is_none())
        .filter(|h| match variant.phase {
            Phase::External => h.int("resource_type_id").is_none(),
            _ => h.int("resource_type_id") == Some(ResourceType::Item.id()),
        })
        .collect();

    let mut counters = PhaseCounters {
        expected: rows.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(variant.key, counters.expected);

    let present = ctx
        .dbs
        .dspace7
        .fetch_one(variant.present)
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if present as u64 >= counters.expected {
        info!(
            "Skipping {} POSTs, already present in the destination [{}/{}]",
            variant.key, present, counters.expected
        );
        counters.imported = counters.expected;
        finish(checkpoint, variant.phase, variant.key, counters);
        return Ok(());
    }

    for row in rows {
        if checkpoint.is_mapped(maps::HANDLE, row.legacy_id) {
            counters.imported += 1;
            continue;
        }
        let request = ApiRequest::post(variant.path).json(body(variant, row));
        match ctx.client.call(&request).await {
            Ok(response) => {
                let id = response
                    .id()
                    .or_else(|| row.str("handle").map(str::to_string))
                    .unwrap_or_default();
                checkpoint.put(maps::HANDLE, row.legacy_id, Handle::from(id))?;
                counters.imported += 1;
                ctx.tick(checkpoint, variant.phase, &counters)?;
            }
            Err(e) => absorb(&mut counters, e.into())?,
        }
    }

    let (imported, expected) = (counters.imported, counters.expected);
    finish(checkpoint, variant.phase, variant.key, counters);
    if imported < expected {
        return Err(MigrateError::stage(
            StageKind::Handles.as_str(),
            format!("{} import incomplete [{}/{}]", variant.key, imported, expected),
        ));
    }
    Ok(())
}

#[async_trait]
impl Stage for Handles {
    fn kind(&self) -> StageKind {
        StageKind::Handles
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::External => import(&EXTERNAL, ctx, checkpoint).await,
            Phase::Objectless => import(&OBJECTLESS, ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
