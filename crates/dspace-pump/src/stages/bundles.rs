//! Item bundles, created in parallel.

use super::{
    absorb, create_all, critical, finish, log_before, maps, unknown_phase, Phase, Stage,
    StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::Result;
use crate::legacy::ResourceType;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};

pub(super) struct Bundles;

fn bundle_body(metadata: Option<Value>) -> Value {
    let Some(metadata) = metadata else {
        return json!({});
    };
    let name = metadata["dc.title"][0]["value"].clone();
    json!({ "name": name, "metadata": metadata })
}

async fn import(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("item2bundle").await?;
    let metadata = ctx.legacy.metadata().await?;

    let key = "bundles";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    let mut tasks: Vec<(i64, ApiRequest)> = Vec::new();
    for row in legacy.iter() {
        let (item_id, bundle_id) = match (row.require_int("item_id"), row.require_int("bundle_id")) {
            (Ok(i), Ok(b)) => (i, b),
            (Err(e), _) | (_, Err(e)) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        if checkpoint.is_mapped(maps::BUNDLE, bundle_id) {
            counters.imported += 1;
            continue;
        }
        let Some(item) = ctx.earlier.get(StageKind::Items, maps::ITEM, item_id) else {
            critical(&mut counters, "bundle", bundle_id, &format!("item {} was not imported", item_id));
            continue;
        };
        let body = bundle_body(metadata.to_json(ResourceType::Bundle, bundle_id));
        tasks.push((bundle_id, ApiRequest::post(format!("core/items/{}/bundles", item)).json(body)));
    }

    create_all(ctx, checkpoint, Phase::Import, maps::BUNDLE, "bundle", tasks, &mut counters).await?;
    finish(checkpoint, Phase::Import, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Bundles {
    fn kind(&self) -> StageKind {
        StageKind::Bundles
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Import => import(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
