//! CLARIN license labels and license definitions.

use super::groups::index_by;
use super::{
    absorb, create, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext,
    StageKind, PAGE_SIZE,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::legacy::SourceRecord;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub(super) struct Licenses;

fn label_body(label: &SourceRecord) -> Value {
    json!({
        "label": label.value("label"),
        "title": label.value("title"),
        "extended": label.flag("is_extended"),
        "icon": label.value("icon"),
    })
}

async fn labels(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("license_label").await?;

    let key = "license labels";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for label in legacy.iter() {
        let id = label.legacy_id;
        if checkpoint.is_mapped(maps::LICENSE_LABEL, id) {
            counters.imported += 1;
            continue;
        }
        let request = ApiRequest::post("core/clarinlicenselabels").json(label_body(label));
        match create(ctx.client, &request, "license_label", id).await {
            Ok(handle) => {
                checkpoint.put(maps::LICENSE_LABEL, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Labels, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Labels, key, counters);
    Ok(())
}

/// Label as the license endpoint embeds it: the label body plus its id.
fn embedded_label(checkpoint: &Checkpoint, labels: &BTreeMap<i64, &SourceRecord>, id: i64) -> Option<Value> {
    let handle = checkpoint.map(maps::LICENSE_LABEL)?.get(id)?;
    let mut body = label_body(labels.get(&id)?);
    body["id"] = match handle.as_str().parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(handle.as_str()),
    };
    Some(body)
}

async fn licenses(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("license_definition").await?;
    let label_rows = ctx.legacy.table("license_label").await?;
    let extended = ctx.legacy.table("license_label_extended_mapping").await?;
    let labels: BTreeMap<i64, &SourceRecord> = label_rows.iter().map(|l| (l.legacy_id, l)).collect();
    let mut extended_of: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for mapping in extended.iter() {
        if let (Some(license), Some(label)) = (mapping.int("license_id"), mapping.int("label_id")) {
            extended_of.entry(license).or_default().push(label);
        }
    }
    let present = ctx
        .client
        .fetch_all_pages("core/clarinlicenses", "clarinlicenses", PAGE_SIZE)
        .await?;
    let by_name = index_by(&present, "name");

    let key = "licenses";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for license in legacy.iter() {
        let id = license.legacy_id;
        if checkpoint.is_mapped(maps::LICENSE, id) {
            counters.imported += 1;
            continue;
        }
        let name = license.str("name").unwrap_or_default();
        if let Some(handle) = by_name.get(name) {
            debug!("License {} already exists", name);
            checkpoint.put(maps::LICENSE, id, handle.clone())?;
            counters.imported += 1;
            *counters.extra.entry("existed".to_string()).or_default() += 1;
            continue;
        }
        let Some(label) = license
            .int("label_id")
            .and_then(|l| embedded_label(checkpoint, &labels, l))
        else {
            let e = MigrateError::record("license_definition", id, "label was not imported");
            absorb(&mut counters, e)?;
            continue;
        };
        let extended_labels: Vec<Value> = extended_of
            .get(&id)
            .map(|ids| ids.iter().filter_map(|l| embedded_label(checkpoint, &labels, *l)).collect())
            .unwrap_or_default();
        let owner = license
            .int("eperson_id")
            .and_then(|e| ctx.earlier.get(StageKind::People, maps::EPERSON, e));
        let request = ApiRequest::post("clarin/import/license")
            .param_opt("eperson", owner)
            .json(json!({
                "name": name,
                "definition": license.value("definition"),
                "confirmation": license.value("confirmation"),
                "requiredInfo": license.value("required_info"),
                "clarinLicenseLabel": label,
                "extendedClarinLicenseLabels": extended_labels,
            }));
        match create(ctx.client, &request, "license_definition", id).await {
            Ok(handle) => {
                checkpoint.put(maps::LICENSE, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Licenses, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Licenses, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Licenses {
    fn kind(&self) -> StageKind {
        StageKind::Licenses
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Labels => labels(ctx, checkpoint).await,
            Phase::Licenses => licenses(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
