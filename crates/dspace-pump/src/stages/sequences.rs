//! Sequence counters.
//!
//! Rows written directly (version histories) and ids the legacy system
//! already handed out must never be reissued, so every destination sequence
//! that also exists in a legacy database is moved forward to the legacy
//! value.

use super::{finish, log_before, unknown_phase, Phase, Stage, StageContext, StageKind};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::Result;
use crate::relational::{is_identifier, quote_ident, RelationalSource};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub(super) struct Sequences;

const SEQUENCES_SQL: &str = "SELECT sequence_name FROM information_schema.sequences";

async fn sequence_names(db: &mut RelationalSource) -> Result<BTreeSet<String>> {
    let rows = db.query(SEQUENCES_SQL, &[]).await?;
    Ok(rows
        .rows
        .iter()
        .filter_map(|r| r.first().and_then(|v| v.as_text()))
        .collect())
}

async fn last_value(db: &mut RelationalSource, sequence: &str) -> Result<i64> {
    let sql = format!("SELECT last_value FROM {}", quote_ident(sequence));
    Ok(db.fetch_one(&sql).await?.and_then(|v| v.as_i64()).unwrap_or(0))
}

async fn sync(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let dbs = &mut *ctx.dbs;
    let destination = sequence_names(&mut dbs.dspace7).await?;
    let dspace5 = sequence_names(&mut dbs.dspace5).await?;
    let utilities5 = sequence_names(&mut dbs.utilities5).await?;

    let key = "sequences";
    let mut counters = PhaseCounters {
        expected: destination.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for sequence in &destination {
        if !is_identifier(sequence) {
            warn!("Skipping sequence with unexpected name {:?}", sequence);
            counters.skipped += 1;
            continue;
        }
        let mut legacy = None;
        if dspace5.contains(sequence) {
            legacy = Some(last_value(&mut dbs.dspace5, sequence).await?);
        }
        if utilities5.contains(sequence) {
            let value = last_value(&mut dbs.utilities5, sequence).await?;
            legacy = Some(legacy.map_or(value, |v: i64| v.max(value)));
        }
        let Some(legacy) = legacy else {
            debug!("Sequence {} has no legacy counterpart", sequence);
            counters.skipped += 1;
            continue;
        };
        let current = last_value(&mut dbs.dspace7, sequence).await?;
        if legacy > current {
            dbs.dspace7.set_sequence(sequence, legacy).await?;
            info!("Sequence {}: {} -> {}", sequence, current, legacy);
            *counters.extra.entry("advanced".to_string()).or_default() += 1;
        }
        counters.imported += 1;
    }
    finish(checkpoint, Phase::Sync, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Sequences {
    fn kind(&self) -> StageKind {
        StageKind::Sequences
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Sync => sync(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{numbering_backend, Harness};
    use super::*;
    use crate::legacy::testing::MemoryRecords;
    use crate::relational::testing::FakeDb;
    use crate::relational::{RowSet, SqlValue};

    fn names(names: &[&str]) -> RowSet {
        RowSet {
            columns: vec!["sequence_name".to_string()],
            rows: names.iter().map(|n| vec![SqlValue::String(n.to_string())]).collect(),
        }
    }

    fn value(v: i64) -> RowSet {
        RowSet {
            columns: vec!["last_value".to_string()],
            rows: vec![vec![SqlValue::I64(v)]],
        }
    }

    fn canned(db: &FakeDb, sequence: &str, v: i64) {
        db.respond(&format!("from \"{}\"", sequence), value(v));
    }

    #[tokio::test]
    async fn test_destination_is_advanced_to_legacy_value() {
        let mut harness = Harness::new(MemoryRecords::new(), numbering_backend());
        harness
            .dest
            .respond("information_schema", names(&["handle_seq", "item_seq", "license_seq", "new_seq", "odd-seq"]));
        harness.dspace5.respond("information_schema", names(&["handle_seq", "item_seq"]));
        harness.utilities5.respond("information_schema", names(&["license_seq"]));
        canned(&harness.dspace5, "handle_seq", 500);
        canned(&harness.dest, "handle_seq", 20);
        canned(&harness.dspace5, "item_seq", 5);
        canned(&harness.dest, "item_seq", 90);
        canned(&harness.utilities5, "license_seq", 12);
        canned(&harness.dest, "license_seq", 1);

        let checkpoint = harness.run(StageKind::Sequences).await.unwrap();

        let setvals: Vec<Vec<SqlValue>> = harness
            .dest
            .bound_queries()
            .into_iter()
            .filter(|(sql, _)| sql.contains("setval"))
            .map(|(_, params)| params)
            .collect();
        assert_eq!(
            setvals,
            vec![
                vec![SqlValue::String("handle_seq".into()), SqlValue::I64(500)],
                vec![SqlValue::String("license_seq".into()), SqlValue::I64(12)],
            ]
        );
        let counters = &checkpoint.counters["sync"];
        assert_eq!((counters.imported, counters.skipped), (3, 2));
        assert_eq!(counters.extra["advanced"], 2);
    }
}
