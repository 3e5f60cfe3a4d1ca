//! Migration orchestrator - runs the stages in dependency order.

use crate::checkpoint::{Checkpoint, CheckpointStore, PhaseCounters};
use crate::config::{Config, DatabaseConfig, SqlRetryPolicy};
use crate::error::{MigrateError, Result};
use crate::legacy::{export_table, LegacyStore, LegacyTable, LiveRecords, SnapshotRecords, LEGACY_TABLES};
use crate::pool::ClientFactory;
use crate::relational::{PgConnector, RelationalSource};
use crate::stages::{run_stage, stage_for, Databases, Lookup, StageContext, StageKind};
use crate::transport::{RequestCounters, RequestTally, TransportClient, TransportFactory};
use crate::verify::{self, ConsistencyReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    store: CheckpointStore,
    resume: bool,
}

/// How a stage ended in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Finished by an earlier run.
    AlreadyDone,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Counters per sub-phase.
    pub counters: BTreeMap<String, PhaseCounters>,
    pub totals: PhaseCounters,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Final status: `completed` or `failed`.
    pub status: String,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// One report per stage reached, in dependency order.
    pub stages: Vec<StageReport>,

    /// API calls made by every client of the run.
    pub requests: RequestTally,

    /// Stages that stopped the run.
    pub failed_stages: Vec<String>,

    /// Legacy against destination comparison, taken when every stage succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<ConsistencyReport>,
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Outcome of `health-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub checks: Vec<HealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub target: String,
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn database(name: &str, config: &DatabaseConfig, policy: &SqlRetryPolicy) -> RelationalSource {
    RelationalSource::new(name, Box::new(PgConnector::new(config)), policy.clone())
}

fn report(checkpoint: &Checkpoint, status: StageStatus, error: Option<String>) -> StageReport {
    StageReport {
        stage: checkpoint.stage,
        status,
        error,
        counters: checkpoint.counters.clone(),
        totals: checkpoint.totals(),
    }
}

/// Run every stage not yet done, in [`StageKind::ALL`] order.
///
/// Finished stages are loaded from `store` so later stages can read their
/// identity maps. A stage that fails ends the run: its checkpoint is saved
/// and its report carries the error. Fatal errors propagate after the save.
pub async fn run_stages(
    config: &Config,
    store: &CheckpointStore,
    client: &TransportClient,
    factory: &dyn ClientFactory<Client = TransportClient>,
    legacy: &mut LegacyStore,
    dbs: &mut Databases,
    cancel: &CancellationToken,
) -> Result<Vec<StageReport>> {
    let mut earlier = Lookup::new();
    let mut reports = Vec::new();

    for kind in StageKind::ALL {
        if cancel.is_cancelled() {
            warn!("Cancellation requested, stopping before stage {}", kind);
            return Err(MigrateError::Cancelled);
        }
        let mut checkpoint = store.open(kind)?;
        if checkpoint.progress.is_done() {
            info!("Stage {} already done, skipping", kind);
            reports.push(report(&checkpoint, StageStatus::AlreadyDone, None));
            earlier.insert(checkpoint);
            continue;
        }

        info!("Stage {}: starting", kind);
        let stage = stage_for(kind);
        let outcome = {
            let mut ctx = StageContext::new(config, client, factory, legacy, dbs, &earlier, Some(store));
            run_stage(stage.as_ref(), &mut ctx, &mut checkpoint).await
        };
        store.save(&mut checkpoint)?;

        match outcome {
            Ok(()) => {
                let totals = checkpoint.totals();
                info!(
                    "Stage {} done: imported {} of {} (critical {})",
                    kind, totals.imported, totals.expected, totals.critical
                );
                reports.push(report(&checkpoint, StageStatus::Completed, None));
                earlier.insert(checkpoint);
            }
            Err(e) if e.is_fatal() => {
                error!("Stage {} aborted the run: {}", kind, e);
                return Err(e);
            }
            Err(e) => {
                error!("Stage {} failed: {}", kind, e);
                reports.push(report(&checkpoint, StageStatus::Failed, Some(e.to_string())));
                break;
            }
        }
    }
    Ok(reports)
}

/// Compare both stores once the run is through. Skipped after a failed
/// stage; a report that cannot be taken is logged, not fatal.
pub async fn final_consistency(
    stages: &[StageReport],
    dbs: &mut Databases,
) -> Option<ConsistencyReport> {
    if stages.iter().any(|r| r.status == StageStatus::Failed) {
        info!("Skipping consistency report after a failed stage");
        return None;
    }
    info!("Comparing legacy and destination stores");
    match verify::verify(&mut dbs.dspace5, &mut dbs.dspace7).await {
        Ok(report) => {
            if report.is_consistent() {
                info!("Consistency report: all {} tables match", report.tables.len());
            } else {
                warn!(
                    "Consistency report: {} count mismatch(es), {} key diff(s)",
                    report.mismatches().count(),
                    report.divergent().count()
                );
            }
            Some(report)
        }
        Err(e) => {
            warn!("Consistency report failed: {}", e);
            None
        }
    }
}

impl Orchestrator {
    /// Create a new orchestrator. Checkpoints live under `migration.resume_dir`.
    pub fn new(config: Config) -> Self {
        let store = CheckpointStore::new(&config.migration.resume_dir, config.hash());
        Self {
            config,
            store,
            resume: false,
        }
    }

    /// Continue from existing checkpoints instead of clearing them.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn databases(&self) -> Databases {
        let dbs = &self.config.databases;
        Databases {
            dspace7: database("dspace7", &dbs.dspace7, &self.config.sql),
            dspace5: database("dspace5", &dbs.dspace5, &self.config.sql),
            utilities5: database("utilities5", &dbs.utilities5, &self.config.sql),
        }
    }

    fn snapshot_dir(&self) -> Result<PathBuf> {
        self.config
            .migration
            .snapshot_dir
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| MigrateError::Config("migration.snapshot_dir is not set".into()))
    }

    fn live_records(&self) -> LiveRecords {
        let dbs = &self.config.databases;
        LiveRecords::new(
            database("dspace5", &dbs.dspace5, &self.config.sql),
            database("utilities5", &dbs.utilities5, &self.config.sql),
        )
    }

    fn legacy_store(&self) -> Result<LegacyStore> {
        let store = if self.config.migration.use_snapshots {
            LegacyStore::new(Box::new(SnapshotRecords::new(self.snapshot_dir()?)), &self.config.migration)
        } else {
            LegacyStore::new(Box::new(self.live_records()), &self.config.migration)
        };
        Ok(store)
    }

    /// Run the migration.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MigrationResult> {
        let started_at = Utc::now();

        if self.resume {
            info!("Resuming from checkpoints in {}", self.store.dir().display());
        } else {
            self.store.clear()?;
        }

        let counters = Arc::new(RequestCounters::new());
        let factory = TransportFactory::new(
            self.config.backend.clone(),
            self.config.http.clone(),
            Arc::clone(&counters),
        );
        let client = factory.connect().await?;
        let mut dbs = self.databases();
        let mut legacy = self.legacy_store()?;
        info!("Reading legacy records from {}", legacy.describe());

        let outcome = run_stages(
            &self.config,
            &self.store,
            &client,
            &factory,
            &mut legacy,
            &mut dbs,
            &cancel,
        )
        .await;

        let requests = counters.tally();
        info!("Requests: {} GET, {} write", requests.gets, requests.writes);
        let stages = outcome?;
        let consistency = final_consistency(&stages, &mut dbs).await;

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let failed_stages: Vec<String> = stages
            .iter()
            .filter(|r| r.status == StageStatus::Failed)
            .map(|r| r.stage.to_string())
            .collect();
        let status = if failed_stages.is_empty() {
            "completed"
        } else {
            "failed"
        };

        let result = MigrationResult {
            status: status.to_string(),
            started_at,
            completed_at,
            duration_seconds,
            stages,
            requests,
            failed_stages,
            consistency,
        };
        info!(
            "Migration {}: {} stages in {:.1}s",
            result.status,
            result.stages.len(),
            result.duration_seconds
        );
        Ok(result)
    }

    /// Dump legacy tables to `migration.snapshot_dir`. An empty `tables`
    /// exports every table the stages read.
    pub async fn export(&self, tables: &[String]) -> Result<BTreeMap<String, u64>> {
        let dir = self.snapshot_dir()?;
        let selected: Vec<&LegacyTable> = if tables.is_empty() {
            LEGACY_TABLES.iter().collect()
        } else {
            tables
                .iter()
                .map(|name| LegacyTable::lookup(name))
                .collect::<Result<_>>()?
        };
        std::fs::create_dir_all(&dir)?;

        let mut live = self.live_records();
        let mut exported = BTreeMap::new();
        for table in selected {
            let rows = export_table(live.source_for(table.db), table, &dir).await?;
            exported.insert(table.name.to_string(), rows);
        }
        info!("Exported {} table(s) to {}", exported.len(), dir.display());
        Ok(exported)
    }

    /// Row counts of every public table, per database.
    pub async fn status(&self) -> Result<BTreeMap<String, BTreeMap<String, i64>>> {
        let mut dbs = self.databases();
        let mut counts = BTreeMap::new();
        for db in [&mut dbs.dspace7, &mut dbs.dspace5, &mut dbs.utilities5] {
            counts.insert(db.name().to_string(), db.table_counts().await?);
        }
        Ok(counts)
    }

    /// Compare legacy and destination row counts.
    pub async fn verify(&self) -> Result<ConsistencyReport> {
        let mut dbs = self.databases();
        verify::verify(&mut dbs.dspace5, &mut dbs.dspace7).await
    }

    /// Log in to the backend and check each database.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let mut checks = Vec::new();

        let started = std::time::Instant::now();
        let factory = TransportFactory::new(
            self.config.backend.clone(),
            self.config.http.clone(),
            Arc::new(RequestCounters::new()),
        );
        let backend = factory.connect().await;
        checks.push(HealthCheck {
            target: "backend".to_string(),
            ok: backend.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            error: backend.err().map(|e| e.to_string()),
        });

        let mut dbs = self.databases();
        for db in [&mut dbs.dspace7, &mut dbs.dspace5, &mut dbs.utilities5] {
            let started = std::time::Instant::now();
            let check = db.fetch_one("SELECT 1").await;
            checks.push(HealthCheck {
                target: db.name().to_string(),
                ok: check.is_ok(),
                latency_ms: started.elapsed().as_millis() as u64,
                error: check.err().map(|e| e.to_string()),
            });
        }

        for check in &checks {
            match &check.error {
                None => info!("{}: ok ({} ms)", check.target, check.latency_ms),
                Some(e) => warn!("{}: {}", check.target, e),
            }
        }
        Ok(HealthCheckResult {
            healthy: checks.iter().all(|c| c.ok),
            checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::valid_config;
    use crate::legacy::testing::{store as memory_store, MemoryRecords};
    use crate::relational::testing::{FakeConnector, FakeDb};
    use crate::relational::{RowSet, SqlValue};
    use crate::transport::testing::{client_for, FakeBackend, FakeFactory};
    use crate::transport::{BackendError, BackendErrorKind, RawResponse};
    use tempfile::TempDir;

    struct Fixture {
        config: Config,
        store: CheckpointStore,
        backend: Arc<FakeBackend>,
        dest: Arc<FakeDb>,
        _dir: TempDir,
    }

    impl Fixture {
        fn new(backend: Arc<FakeBackend>) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = valid_config();
            config.migration.workers = Some(1);
            let store = CheckpointStore::new(dir.path(), config.hash());
            Self {
                config,
                store,
                backend,
                dest: FakeDb::new(),
                _dir: dir,
            }
        }

        /// Mark every stage before `until` as finished.
        fn done_before(&self, until: StageKind) {
            for kind in StageKind::ALL.into_iter().take_while(|k| *k != until) {
                let mut checkpoint = Checkpoint::new(kind, self.store.config_hash());
                for phase in kind.phases() {
                    checkpoint.complete_phase(*phase).unwrap();
                }
                self.store.save(&mut checkpoint).unwrap();
            }
        }

        async fn run(&self, cancel: &CancellationToken) -> Result<Vec<StageReport>> {
            let counters = Arc::new(RequestCounters::new());
            let client = client_for(&self.backend, &counters);
            let factory = FakeFactory {
                backend: Arc::clone(&self.backend),
                counters,
            };
            let source = |name: &str, db: &Arc<FakeDb>| {
                RelationalSource::new(
                    name,
                    Box::new(FakeConnector::new(Arc::clone(db))),
                    SqlRetryPolicy::default(),
                )
            };
            let mut dbs = Databases {
                dspace7: source("dspace7", &self.dest),
                dspace5: source("dspace5", &FakeDb::new()),
                utilities5: source("utilities5", &FakeDb::new()),
            };
            let mut legacy = memory_store(MemoryRecords::new());
            run_stages(
                &self.config,
                &self.store,
                &client,
                &factory,
                &mut legacy,
                &mut dbs,
                cancel,
            )
            .await
        }
    }

    fn refusing_backend() -> Arc<FakeBackend> {
        FakeBackend::with_handler(|_| Ok(RawResponse::new(400, "{\"message\":\"bad request\"}")))
    }

    #[tokio::test]
    async fn test_finished_stages_are_skipped() {
        let fixture = Fixture::new(refusing_backend());
        fixture.done_before(StageKind::Sequences);

        let reports = fixture.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(reports.len(), StageKind::ALL.len());
        assert!(reports[..14].iter().all(|r| r.status == StageStatus::AlreadyDone));
        assert_eq!(reports[14].stage, StageKind::Sequences);
        assert_eq!(reports[14].status, StageStatus::Completed);
        assert_eq!(fixture.backend.calls(), 0);
        assert!(fixture.store.load(StageKind::Sequences).unwrap().unwrap().progress.is_done());
    }

    #[tokio::test]
    async fn test_failed_stage_stops_the_run() {
        let fixture = Fixture::new(refusing_backend());

        let reports = fixture.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].stage, StageKind::Groups);
        assert_eq!(reports[0].status, StageStatus::Failed);
        assert!(reports[0].error.is_some());
        let saved = fixture.store.load(StageKind::Groups).unwrap().unwrap();
        assert!(!saved.progress.is_done());
        assert!(fixture.store.load(StageKind::Handles).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_propagates_after_save() {
        let fixture = Fixture::new(refusing_backend());
        fixture.done_before(StageKind::ResourcePolicies);
        fixture.dest.respond(
            "resourcepolicy",
            RowSet {
                columns: vec!["id".to_string()],
                rows: vec![vec![SqlValue::I64(1)], vec![SqlValue::I64(2)]],
            },
        );

        let err = fixture.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, MigrateError::Invariant(_)));
        assert!(fixture.store.load(StageKind::ResourcePolicies).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_stage() {
        let backend = FakeBackend::scripted(vec![Err(BackendError::new(
            BackendErrorKind::Connect,
            "unreachable",
        ))]);
        let fixture = Fixture::new(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fixture.run(&cancel).await.unwrap_err();

        assert!(matches!(err, MigrateError::Cancelled));
        assert_eq!(fixture.backend.calls(), 0);
        assert!(fixture.store.load(StageKind::Groups).unwrap().is_none());
    }

    #[test]
    fn test_result_serializes_stage_reports() {
        let now = Utc::now();
        let result = MigrationResult {
            status: "failed".to_string(),
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            stages: vec![StageReport {
                stage: StageKind::Items,
                status: StageStatus::Failed,
                error: Some("boom".to_string()),
                counters: BTreeMap::new(),
                totals: PhaseCounters::default(),
            }],
            requests: RequestTally { gets: 3, writes: 4 },
            failed_stages: vec!["items".to_string()],
            consistency: None,
        };

        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["stages"][0]["status"], "failed");
        assert_eq!(json["stages"][0]["stage"], "items");
        assert_eq!(json["requests"]["writes"], 4);
        assert!(json.get("consistency").is_none());
    }

    fn databases(legacy: &Arc<FakeDb>, dest: &Arc<FakeDb>) -> Databases {
        let source = |name: &str, db: &Arc<FakeDb>| {
            RelationalSource::new(
                name,
                Box::new(FakeConnector::new(Arc::clone(db))),
                SqlRetryPolicy::default(),
            )
        };
        Databases {
            dspace7: source("dspace7", dest),
            dspace5: source("dspace5", legacy),
            utilities5: source("utilities5", &FakeDb::new()),
        }
    }

    fn stage_report(status: StageStatus) -> StageReport {
        StageReport {
            stage: StageKind::Sequences,
            status,
            error: None,
            counters: BTreeMap::new(),
            totals: PhaseCounters::default(),
        }
    }

    #[tokio::test]
    async fn test_successful_run_ends_with_consistency_report() {
        let legacy = FakeDb::with_synthetic_rows(3);
        let dest = FakeDb::with_synthetic_rows(4);
        let mut dbs = databases(&legacy, &dest);

        let report = final_consistency(&[stage_report(StageStatus::Completed)], &mut dbs)
            .await
            .unwrap();

        assert_eq!(report.tables.len(), verify::VERIFIED_TABLES.len());
        assert!(report.tables.iter().all(|t| t.legacy == 3 && t.destination == 4));
        assert!(!report.is_consistent());
        let eperson = report.diffs.iter().find(|d| d.table == "eperson").unwrap();
        assert_eq!(eperson.only_destination, 1);
    }

    #[tokio::test]
    async fn test_failed_run_has_no_consistency_report() {
        let legacy = FakeDb::with_synthetic_rows(3);
        let dest = FakeDb::with_synthetic_rows(3);
        let mut dbs = databases(&legacy, &dest);

        let stages = [
            stage_report(StageStatus::AlreadyDone),
            stage_report(StageStatus::Failed),
        ];
        assert!(final_consistency(&stages, &mut dbs).await.is_none());
        assert_eq!(legacy.count_queries(), 0);
    }
}
