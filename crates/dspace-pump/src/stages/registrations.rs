//! Pending self-registrations.

use super::{absorb, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext, StageKind};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::Result;
use crate::identity::Handle;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::json;

pub(super) struct Registrations;

async fn import(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("registrationdata").await?;

    let key = "registration data";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for registration in legacy.iter() {
        let id = registration.legacy_id;
        if checkpoint.is_mapped(maps::REGISTRATION, id) {
            counters.imported += 1;
            continue;
        }
        let email = registration.str("email").unwrap_or_default().to_string();
        let request = ApiRequest::post("eperson/registrations").json(json!({ "email": email }));
        match ctx.client.call(&request).await {
            Ok(response) => {
                // The endpoint answers without a body; the email identifies the entry.
                let handle = response.id().unwrap_or(email);
                checkpoint.put(maps::REGISTRATION, id, Handle::from(handle))?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Import, &counters)?;
            }
            Err(e) => absorb(&mut counters, e.into())?,
        }
    }
    finish(checkpoint, Phase::Import, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Registrations {
    fn kind(&self) -> StageKind {
        StageKind::Registrations
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
