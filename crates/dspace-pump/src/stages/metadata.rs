//! Metadata schema and field registries.

use super::groups::index_by;
use super::{
    absorb, create, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext,
    StageKind, PAGE_SIZE,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::SourceRecord;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

pub(super) struct MetadataSchema;

fn field_name(prefix: &str, element: &str, qualifier: Option<&str>) -> String {
    match qualifier {
        Some(q) if !q.is_empty() => format!("{}.{}.{}", prefix, element, q),
        _ => format!("{}.{}", prefix, element),
    }
}

/// `schema.element[.qualifier] -> id` of destination fields.
fn index_fields(fields: &[Value]) -> HashMap<String, Handle> {
    fields
        .iter()
        .filter_map(|f| {
            let schema = f
                .pointer("/_embedded/schema/prefix")
                .or_else(|| f.pointer("/schema/prefix"))?
                .as_str()?;
            let element = f.get("element")?.as_str()?;
            let qualifier = f.get("qualifier").and_then(Value::as_str);
            let id = match f.get("id")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((field_name(schema, element, qualifier), Handle::from(id)))
        })
        .collect()
}

fn existed(counters: &mut PhaseCounters) {
    counters.imported += 1;
    *counters.extra.entry("existed".to_string()).or_default() += 1;
}

async fn schemas(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("metadataschemaregistry").await?;
    let present = ctx
        .client
        .fetch_all_pages("core/metadataschemas", "metadataschemas", PAGE_SIZE)
        .await?;
    let by_prefix = index_by(&present, "prefix");

    let key = "metadata schemas";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for schema in legacy.iter() {
        let id = schema.legacy_id;
        if checkpoint.is_mapped(maps::SCHEMA, id) {
            counters.imported += 1;
            continue;
        }
        let prefix = schema.str("short_id").unwrap_or_default();
        if let Some(handle) = by_prefix.get(prefix) {
            debug!("Metadata schema {} already exists", prefix);
            checkpoint.put(maps::SCHEMA, id, handle.clone())?;
            existed(&mut counters);
            continue;
        }
        let request = ApiRequest::post("core/metadataschemas").json(json!({
            "prefix": prefix,
            "namespace": schema.value("namespace"),
        }));
        match create(ctx.client, &request, "metadataschemaregistry", id).await {
            Ok(handle) => {
                checkpoint.put(maps::SCHEMA, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Schemas, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Schemas, key, counters);
    Ok(())
}

fn legacy_field_name(field: &SourceRecord, prefixes: &HashMap<i64, &str>) -> Option<String> {
    let prefix = prefixes.get(&field.int("metadata_schema_id")?)?;
    Some(field_name(
        prefix,
        field.str("element")?,
        field.str("qualifier"),
    ))
}

async fn fields(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("metadatafieldregistry").await?;
    let schemas = ctx.legacy.table("metadataschemaregistry").await?;
    let prefixes: HashMap<i64, &str> = schemas
        .iter()
        .filter_map(|s| s.str("short_id").map(|p| (s.legacy_id, p)))
        .collect();
    let present = ctx
        .client
        .fetch_all_pages("core/metadatafields", "metadatafields", PAGE_SIZE)
        .await?;
    let by_name = index_fields(&present);

    let key = "metadata fields";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for field in legacy.iter() {
        let id = field.legacy_id;
        if checkpoint.is_mapped(maps::FIELD, id) {
            counters.imported += 1;
            continue;
        }
        if let Some(handle) = legacy_field_name(field, &prefixes).and_then(|n| by_name.get(&n)) {
            checkpoint.put(maps::FIELD, id, handle.clone())?;
            existed(&mut counters);
            continue;
        }
        let schema = field
            .int("metadata_schema_id")
            .and_then(|s| checkpoint.map(maps::SCHEMA).and_then(|m| m.get(s)))
            .cloned();
        let Some(schema) = schema else {
            absorb(
                &mut counters,
                MigrateError::record(
                    "metadatafieldregistry",
                    id,
                    "schema was not imported",
                ),
            )?;
            continue;
        };
        let request = ApiRequest::post("core/metadatafields")
            .param("schemaId", &schema)
            .json(json!({
                "element": field.value("element"),
                "qualifier": field.value("qualifier"),
                "scopeNote": field.value("scope_note"),
            }));
        match create(ctx.client, &request, "metadatafieldregistry", id).await {
            Ok(handle) => {
                checkpoint.put(maps::FIELD, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Fields, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Fields, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for MetadataSchema {
    fn kind(&self) -> StageKind {
        StageKind::MetadataSchema
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Schemas => schemas(ctx, checkpoint).await,
            Phase::Fields => fields(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
