//! Metadata users filled in when accepting a license, one request per
//! acceptance transaction.

use super::{absorb, create, finish, log_before, maps, unknown_phase, Phase, Stage, StageContext, StageKind};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::legacy::SourceRecord;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

pub(super) struct UserMetadata;

/// Everything one transaction's request needs, or the reason it cannot be sent.
fn transaction_request(
    ctx: &StageContext<'_>,
    transaction: i64,
    entries: &[&SourceRecord],
    allowances: &HashMap<i64, &SourceRecord>,
    mappings: &HashMap<i64, &SourceRecord>,
) -> Result<ApiRequest> {
    let missing = |what: String| MigrateError::record("user_metadata", transaction, what);
    let allowance = allowances
        .get(&transaction)
        .ok_or_else(|| missing("no license allowance".to_string()))?;
    let mapping_id = allowance.require_int("mapping_id")?;
    let mapping = mappings
        .get(&mapping_id)
        .ok_or_else(|| missing(format!("license mapping {} not found", mapping_id)))?;
    let bitstream_id = mapping.require_int("bitstream_id")?;
    let bitstream = ctx
        .earlier
        .get(StageKind::Bitstreams, maps::BITSTREAM, bitstream_id)
        .ok_or_else(|| missing(format!("bitstream {} was not imported", bitstream_id)))?;
    let registration_id = allowance.require_int("user_registration_id")?;
    let registration = ctx
        .earlier
        .get(StageKind::People, maps::USER_REGISTRATION, registration_id)
        .ok_or_else(|| missing(format!("user registration {} was not imported", registration_id)))?;

    let body: Vec<Value> = entries
        .iter()
        .map(|e| json!({"metadataKey": e.value("metadata_key"), "metadataValue": e.value("metadata_value")}))
        .collect();
    Ok(ApiRequest::post("clarin/import/usermetadata")
        .param("userRegistrationId", registration)
        .param("bitstreamUUID", bitstream)
        .param_opt("createdOn", allowance.str("created_on"))
        .param_opt("token", allowance.str("token"))
        .json(Value::Array(body)))
}

async fn import(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("user_metadata").await?;
    let allowance_rows = ctx.legacy.table("license_resource_user_allowance").await?;
    let mapping_rows = ctx.legacy.table("license_resource_mapping").await?;
    let allowances: HashMap<i64, &SourceRecord> =
        allowance_rows.iter().map(|a| (a.legacy_id, a)).collect();
    let mappings: HashMap<i64, &SourceRecord> = mapping_rows.iter().map(|m| (m.legacy_id, m)).collect();

    let mut by_transaction: BTreeMap<i64, Vec<&SourceRecord>> = BTreeMap::new();
    for entry in legacy.iter() {
        match entry.require_int("transaction_id") {
            Ok(t) => by_transaction.entry(t).or_default().push(entry),
            Err(e) => warn!("{}", e),
        }
    }

    let key = "user_metadata";
    let mut counters = PhaseCounters {
        expected: by_transaction.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for (transaction, entries) in &by_transaction {
        let transaction = *transaction;
        if checkpoint.is_mapped(maps::USER_METADATA, transaction) {
            counters.imported += 1;
            continue;
        }
        let request = match transaction_request(ctx, transaction, entries, &allowances, &mappings) {
            Ok(request) => request,
            Err(e) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        match create(ctx.client, &request, "user_metadata", transaction).await {
            Ok(handle) => {
                checkpoint.put(maps::USER_METADATA, transaction, handle)?;
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
impl Stage for UserMetadata {
    fn kind(&self) -> StageKind {
        StageKind::UserMetadata
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

#[cfg(test)]
mod tests {
    use super::super::testing::{mapped, numbering_backend, Harness};
    use super::*;
    use crate::legacy::testing::MemoryRecords;

    #[tokio::test]
    async fn test_entries_are_grouped_by_transaction() {
        let records = MemoryRecords::new()
            .with(
                "user_metadata",
                vec![
                    json!({"user_metadata_id": 1, "transaction_id": 7, "metadata_key": "NAME", "metadata_value": "Ann"}),
                    json!({"user_metadata_id": 2, "transaction_id": 7, "metadata_key": "ORG", "metadata_value": "Lab"}),
                    json!({"user_metadata_id": 3, "transaction_id": 8, "metadata_key": "NAME", "metadata_value": "Bob"}),
                ],
            )
            .with(
                "license_resource_user_allowance",
                vec![
                    json!({"transaction_id": 7, "user_registration_id": 3, "mapping_id": 1, "created_on": "2021-05-01", "token": "tok"}),
                    json!({"transaction_id": 8, "user_registration_id": 4, "mapping_id": 1}),
                ],
            )
            .with(
                "license_resource_mapping",
                vec![json!({"mapping_id": 1, "license_id": 10, "bitstream_id": 100})],
            );
        let mut harness = Harness::new(records, numbering_backend());
        harness.finished(mapped(StageKind::Bitstreams, maps::BITSTREAM, &[(100, "bit-100")]));
        harness.finished(mapped(StageKind::People, maps::USER_REGISTRATION, &[(3, "reg-3")]));

        let checkpoint = harness.run(StageKind::UserMetadata).await.unwrap();

        let posts = harness.posts("clarin/import/usermetadata");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].param_value("userRegistrationId"), Some("reg-3"));
        assert_eq!(posts[0].param_value("bitstreamUUID"), Some("bit-100"));
        assert_eq!(posts[0].param_value("token"), Some("tok"));
        let body = posts[0].json_body().unwrap();
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[1]["metadataKey"], "ORG");

        let counters = &checkpoint.counters["import"];
        assert_eq!((counters.expected, counters.imported, counters.failed), (2, 1, 1));
        assert!(checkpoint.is_mapped(maps::USER_METADATA, 7));
    }
}
