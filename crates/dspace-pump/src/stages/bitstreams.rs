//! Bitstream formats, bitstreams, community and collection logos, and the
//! final checksum pass.
//!
//! Bitstreams reference their files by `internal_id` in the shared asset
//! store; only the database records move. A bitstream outside any bundle is
//! still imported so that logos can point at it.

use super::groups::index_by;
use super::{
    absorb, create, critical, finish, link, log_before, maps, unknown_phase, Phase, Stage,
    StageContext, StageKind, PAGE_SIZE,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::{ResourceType, SourceRecord};
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub(super) struct Bitstreams;

/// Holds the destination's "unknown" format under key 0.
const UNKNOWN_FORMAT: &str = "unknown_format";

fn support_level(level: i64) -> Option<&'static str> {
    match level {
        0 => Some("UNKNOWN"),
        1 => Some("KNOWN"),
        2 => Some("SUPPORTED"),
        _ => None,
    }
}

fn is_unknown_format(short_description: Option<&str>, description: Option<&str>) -> bool {
    [short_description, description].into_iter().flatten().any(|d| {
        let d = d.trim().to_lowercase();
        d == "unknown" || d == "unknown data format"
    })
}

/// The first unknown format seen wins.
fn remember_unknown(checkpoint: &mut Checkpoint, handle: &Handle) -> Result<()> {
    if !checkpoint.is_mapped(UNKNOWN_FORMAT, 0) {
        checkpoint.put(UNKNOWN_FORMAT, 0, handle.clone())?;
    }
    Ok(())
}

fn existing_extensions(format: &Value) -> BTreeSet<String> {
    format["extensions"]
        .as_array()
        .map(|a| a.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

async fn formats(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("bitstreamformatregistry").await?;
    let extensions = ctx.legacy.table("fileextension").await?;
    let mut extensions_of: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for ext in extensions.iter() {
        if let (Some(format), Some(name)) = (ext.int("bitstream_format_id"), ext.str("extension")) {
            extensions_of.entry(format).or_default().push(name.to_string());
        }
    }
    let present = ctx
        .client
        .fetch_all_pages("core/bitstreamformats", "bitstreamformats", PAGE_SIZE)
        .await?;
    let by_name = index_by(&present, "shortDescription");
    for format in &present {
        let short = format["shortDescription"].as_str();
        if is_unknown_format(short, format["description"].as_str()) {
            if let Some(handle) = short.and_then(|s| by_name.get(s)) {
                remember_unknown(checkpoint, handle)?;
            }
        }
    }

    let key = "bitstreamformatregistry";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for format in legacy.iter() {
        let id = format.legacy_id;
        if checkpoint.is_mapped(maps::FORMAT, id) {
            counters.imported += 1;
            continue;
        }
        let short = format.str("short_description").unwrap_or_default();
        let unknown = is_unknown_format(Some(short), format.str("description"));
        let old_extensions = extensions_of.get(&id).cloned().unwrap_or_default();

        let handle = if let Some(handle) = by_name.get(short) {
            debug!("Bitstream format {} already exists", short);
            let existing = present
                .iter()
                .find(|f| f["shortDescription"].as_str() == Some(short))
                .map(existing_extensions)
                .unwrap_or_default();
            if existing != old_extensions.iter().cloned().collect::<BTreeSet<_>>() {
                warn!(
                    "File extensions of format {} differ: legacy {:?}, destination {:?}",
                    short, old_extensions, existing
                );
            }
            *counters.extra.entry("existed".to_string()).or_default() += 1;
            handle.clone()
        } else {
            let level = format.int("support_level").unwrap_or(-1);
            let Some(level) = support_level(level) else {
                let e = format!("unsupported support level {}", level);
                absorb(&mut counters, MigrateError::record("bitstreamformatregistry", id, e))?;
                continue;
            };
            let request = ApiRequest::post("core/bitstreamformats").json(json!({
                "mimetype": format.value("mimetype"),
                "description": format.value("description"),
                "shortDescription": short,
                "supportLevel": level,
                "internal": format.value("internal"),
                "extensions": old_extensions,
            }));
            match create(ctx.client, &request, "bitstreamformatregistry", id).await {
                Ok(handle) => handle,
                Err(e) => {
                    absorb(&mut counters, e)?;
                    continue;
                }
            }
        };
        if unknown {
            remember_unknown(checkpoint, &handle)?;
        }
        checkpoint.put(maps::FORMAT, id, handle)?;
        counters.imported += 1;
        ctx.tick(checkpoint, Phase::Formats, &counters)?;
    }
    finish(checkpoint, Phase::Formats, key, counters);
    Ok(())
}

fn bitstream_body(bitstream: &SourceRecord, metadata: Option<Value>) -> Value {
    json!({
        "sizeBytes": bitstream.value("size_bytes"),
        "checkSum": {
            "checkSumAlgorithm": bitstream.value("checksum_algorithm"),
            "value": bitstream.value("checksum"),
        },
        "metadata": metadata.unwrap_or_else(|| json!({})),
    })
}

async fn import(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("bitstream").await?;
    let bundle_links = ctx.legacy.table("bundle2bitstream").await?;
    let bundles = ctx.legacy.table("bundle").await?;
    let metadata = ctx.legacy.metadata().await?;

    let bundle_of: BTreeMap<i64, i64> = bundle_links
        .iter()
        .filter_map(|l| Some((l.int("bitstream_id")?, l.int("bundle_id")?)))
        .collect();
    let primary_of: BTreeMap<i64, i64> = bundles
        .iter()
        .filter_map(|b| Some((b.int("primary_bitstream_id")?, b.legacy_id)))
        .collect();
    let unknown_format = checkpoint.map(UNKNOWN_FORMAT).and_then(|m| m.get(0)).cloned();

    let key = "bitstreams";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for bitstream in legacy.iter() {
        let id = bitstream.legacy_id;
        if checkpoint.is_mapped(maps::BITSTREAM, id) {
            counters.imported += 1;
            continue;
        }
        if bitstream.flag("deleted") {
            counters.skipped += 1;
            *counters.extra.entry("deleted".to_string()).or_default() += 1;
            continue;
        }
        let bundle = match bundle_of.get(&id) {
            Some(b) => match ctx.earlier.get(StageKind::Bundles, maps::BUNDLE, *b) {
                Some(handle) => Some(handle),
                None => {
                    critical(&mut counters, "bitstream", id, &format!("bundle {} was not imported", b));
                    continue;
                }
            },
            None => None,
        };
        let primary = primary_of
            .get(&id)
            .and_then(|b| ctx.earlier.get(StageKind::Bundles, maps::BUNDLE, *b));
        let format = bitstream
            .int("bitstream_format_id")
            .and_then(|f| checkpoint.map(maps::FORMAT).and_then(|m| m.get(f)))
            .or(unknown_format.as_ref());
        let Some(format) = format else {
            absorb(&mut counters, MigrateError::record("bitstream", id, "no bitstream format"))?;
            continue;
        };

        let request = ApiRequest::post("clarin/import/core/bitstream")
            .param_opt("internal_id", bitstream.str("internal_id"))
            .param_opt("storeNumber", bitstream.int("store_number"))
            .param("bitstreamFormat", format)
            .param("deleted", bitstream.flag("deleted"))
            .param_opt("sequenceId", bitstream.int("sequence_id"))
            .param_opt("bundle_id", bundle)
            .param_opt("primaryBundle_id", primary)
            .json(bitstream_body(bitstream, metadata.to_json(ResourceType::Bitstream, id)));
        match create(ctx.client, &request, "bitstream", id).await {
            Ok(handle) => {
                checkpoint.put(maps::BITSTREAM, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Import, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Import, key, counters);
    Ok(())
}

/// Logo owners: legacy table, owning stage and map, endpoint, id param.
const LOGO_OWNERS: [(&str, StageKind, &str, &str, &str); 2] = [
    ("community", StageKind::Communities, maps::COMMUNITY, "clarin/import/logo/community", "community_id"),
    ("collection", StageKind::Collections, maps::COLLECTION, "clarin/import/logo/collection", "collection_id"),
];

async fn logos(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let mut owners: Vec<(usize, SourceRecord, i64)> = Vec::new();
    for (at, (table, ..)) in LOGO_OWNERS.iter().enumerate() {
        for owner in ctx.legacy.table(table).await?.iter() {
            if let Some(logo) = owner.int("logo_bitstream_id") {
                owners.push((at, owner.clone(), logo));
            }
        }
    }

    let key = "logos";
    let mut counters = PhaseCounters {
        expected: owners.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for (at, owner, logo) in owners {
        let (table, stage, map, endpoint, param) = LOGO_OWNERS[at];
        let id = owner.legacy_id;
        if checkpoint.has_link(maps::LOGO, id, logo) {
            counters.imported += 1;
            continue;
        }
        let Some(object) = ctx.earlier.get(stage, map, id) else {
            critical(&mut counters, table, id, "logo owner was not imported");
            continue;
        };
        let Some(bitstream) = checkpoint.map(maps::BITSTREAM).and_then(|m| m.get(logo)) else {
            critical(&mut counters, table, id, &format!("logo bitstream {} was not imported", logo));
            continue;
        };
        let request = ApiRequest::post(endpoint)
            .param(param, object)
            .param("bitstream_id", bitstream);
        match link(ctx.client, &request).await {
            Ok(()) => {
                checkpoint.links_mut(maps::LOGO).insert((id, logo));
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Logos, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Logos, key, counters);
    Ok(())
}

/// Ask the destination to verify the checksums of all imported files.
async fn checksums(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let key = "checksums";
    log_before(key, 1);
    let mut counters = PhaseCounters {
        expected: 1,
        ..PhaseCounters::default()
    };
    let request = ApiRequest::post("clarin/import/core/bitstream/checksum");
    match ctx.client.call(&request).await {
        Ok(_) => counters.imported = 1,
        Err(e) => absorb(&mut counters, e.into())?,
    }
    finish(checkpoint, Phase::Checksums, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Bitstreams {
    fn kind(&self) -> StageKind {
        StageKind::Bitstreams
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Formats => formats(ctx, checkpoint).await,
            Phase::Import => import(ctx, checkpoint).await,
            Phase::Logos => logos(ctx, checkpoint).await,
            Phase::Checksums => checksums(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
