//! Stage fixture: in-memory legacy tables, a fake API and fake databases.

use super::{run_stage, stage_for, Databases, Lookup, StageContext, StageKind};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{valid_config, Config, SqlRetryPolicy};
use crate::error::Result;
use crate::legacy::testing::{store, MemoryRecords};
use crate::legacy::LegacyStore;
use crate::relational::testing::{FakeConnector, FakeDb};
use crate::relational::RelationalSource;
use crate::transport::testing::{client_for, FakeBackend, FakeFactory};
use crate::transport::{ApiMethod, ApiRequest, RawResponse, RequestCounters, TransportClient};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct Harness {
    pub(crate) config: Config,
    pub(crate) backend: Arc<FakeBackend>,
    client: TransportClient,
    factory: FakeFactory,
    pub(crate) legacy: LegacyStore,
    pub(crate) dbs: Databases,
    pub(crate) dest: Arc<FakeDb>,
    pub(crate) dspace5: Arc<FakeDb>,
    pub(crate) utilities5: Arc<FakeDb>,
    pub(crate) earlier: Lookup,
    /// Checkpoint files written by `tick`/`flush`; none by default.
    pub(crate) store: Option<CheckpointStore>,
}

fn source(name: &str, db: &Arc<FakeDb>) -> RelationalSource {
    RelationalSource::new(
        name,
        Box::new(FakeConnector::new(Arc::clone(db))),
        SqlRetryPolicy::default(),
    )
}

impl Harness {
    pub(crate) fn new(records: MemoryRecords, backend: Arc<FakeBackend>) -> Self {
        let mut config = valid_config();
        config.migration.workers = Some(1);
        let counters = Arc::new(RequestCounters::new());
        let client = client_for(&backend, &counters);
        let factory = FakeFactory {
            backend: Arc::clone(&backend),
            counters,
        };
        let (dest, dspace5, utilities5) = (FakeDb::new(), FakeDb::new(), FakeDb::new());
        let dbs = Databases {
            dspace7: source("dspace7", &dest),
            dspace5: source("dspace5", &dspace5),
            utilities5: source("utilities5", &utilities5),
        };
        Self {
            config,
            backend,
            client,
            factory,
            legacy: store(records),
            dbs,
            dest,
            dspace5,
            utilities5,
            earlier: Lookup::new(),
            store: None,
        }
    }

    pub(crate) fn ctx(&mut self) -> StageContext<'_> {
        StageContext::new(
            &self.config,
            &self.client,
            &self.factory,
            &mut self.legacy,
            &mut self.dbs,
            &self.earlier,
            self.store.as_ref(),
        )
    }

    /// Run the remaining sub-phases of `checkpoint`.
    pub(crate) async fn resume(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        let stage = stage_for(checkpoint.stage);
        let mut ctx = self.ctx();
        run_stage(stage.as_ref(), &mut ctx, checkpoint).await
    }

    /// Run a whole stage from scratch.
    pub(crate) async fn run(&mut self, kind: StageKind) -> Result<Checkpoint> {
        let mut checkpoint = Checkpoint::new(kind, "test");
        self.resume(&mut checkpoint).await?;
        Ok(checkpoint)
    }

    /// Make a finished stage visible to later ones.
    pub(crate) fn finished(&mut self, checkpoint: Checkpoint) {
        self.earlier.insert(checkpoint);
    }

    pub(crate) fn posts(&self, path: &str) -> Vec<ApiRequest> {
        self.backend
            .requests()
            .into_iter()
            .filter(|r| r.method == ApiMethod::Post && r.path == path)
            .collect()
    }
}

/// API that creates everything: writes get `obj-<n>` ids, GETs return an
/// empty single page that also carries an id.
pub(crate) fn numbering_backend() -> Arc<FakeBackend> {
    let next = AtomicUsize::new(0);
    FakeBackend::with_handler(move |request| {
        let n = next.fetch_add(1, Ordering::SeqCst) + 1;
        if request.method == ApiMethod::Get {
            return Ok(RawResponse::new(
                200,
                json!({"id": format!("obj-{}", n), "_embedded": {}, "page": {"totalPages": 1}})
                    .to_string(),
            ));
        }
        Ok(RawResponse::new(201, json!({"id": format!("obj-{}", n)}).to_string())
            .with_header("workflowitem_id", n.to_string()))
    })
}

/// One page of an embedded collection resource.
pub(crate) fn page(key: &str, objects: Vec<Value>) -> RawResponse {
    RawResponse::new(
        200,
        json!({"_embedded": {key: objects}, "page": {"totalPages": 1}}).to_string(),
    )
}

/// Checkpoint of `kind` holding one map.
pub(crate) fn mapped(kind: StageKind, map: &str, entries: &[(i64, &str)]) -> Checkpoint {
    let mut checkpoint = Checkpoint::new(kind, "test");
    for (id, handle) in entries {
        checkpoint
            .put(map, *id, (*handle).into())
            .expect("fresh map");
    }
    checkpoint
}
