//! Entity-kind imports.
//!
//! Each [`Stage`] runs its sub-phases in order against a [`StageContext`].
//! A stage writes only its own [`Checkpoint`]; identity maps of stages that
//! finished earlier are read through [`Lookup`] and never modified.
//!
//! Every sub-phase may be replayed after a crash, so each one skips records
//! already present in its identity map and treats "already exists" replies
//! of link endpoints as success.

mod bitstreams;
mod bundles;
mod collections;
mod communities;
mod eperson_groups;
mod groups;
mod handles;
mod items;
mod kind;
mod licenses;
mod metadata;
mod people;
mod policies;
mod registrations;
mod sequences;
mod user_metadata;

#[cfg(test)]
pub(crate) mod testing;

pub use handles::HandleIndex;
pub use kind::{Phase, StageKind};
pub use policies::{action_name, ACTIONS};

use crate::checkpoint::{Checkpoint, CheckpointStore, PhaseCounters};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::identity::{Handle, IdentityMap, MultiIdentityMap};
use crate::legacy::{LegacyStore, ResourceType};
use crate::pool::{ClientFactory, TaskOutcome, WorkerPool};
use crate::relational::RelationalSource;
use crate::transport::{ApiRequest, Response, TransportClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identity map and link set names.
pub mod maps {
    pub const GROUP: &str = "group";
    pub const HANDLE: &str = "handle";
    pub const SCHEMA: &str = "schema";
    pub const FIELD: &str = "field";
    pub const COMMUNITY: &str = "community";
    pub const COLLECTION: &str = "collection";
    pub const BITSTREAM_READ_GROUP: &str = "bitstream_read_group";
    pub const ITEM_READ_GROUP: &str = "item_read_group";
    pub const REGISTRATION: &str = "registration";
    pub const EPERSON: &str = "eperson";
    pub const USER_REGISTRATION: &str = "user_registration";
    pub const LICENSE_LABEL: &str = "license_label";
    pub const LICENSE: &str = "license";
    pub const WORKSPACE: &str = "workspace";
    pub const WORKFLOW: &str = "workflow";
    pub const ITEM: &str = "item";
    pub const MAPPED: &str = "mapped_collections";
    pub const BUNDLE: &str = "bundle";
    pub const FORMAT: &str = "format";
    pub const BITSTREAM: &str = "bitstream";
    pub const USER_METADATA: &str = "user_metadata";
    pub const POLICY: &str = "policy";

    pub const SUBGROUP: &str = "subgroup";
    pub const MEMBERSHIP: &str = "membership";
    pub const LOGO: &str = "logo";
}

/// One importable entity kind.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Run one sub-phase. Counters go into `checkpoint` under the phase name.
    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()>;
}

/// The stage implementation for `kind`.
pub fn stage_for(kind: StageKind) -> Box<dyn Stage> {
    match kind {
        StageKind::Groups => Box::new(groups::Groups),
        StageKind::Handles => Box::new(handles::Handles),
        StageKind::MetadataSchema => Box::new(metadata::MetadataSchema),
        StageKind::Communities => Box::new(communities::Communities),
        StageKind::Collections => Box::new(collections::Collections),
        StageKind::Registrations => Box::new(registrations::Registrations),
        StageKind::EpersonGroups => Box::new(eperson_groups::EpersonGroups),
        StageKind::People => Box::new(people::People),
        StageKind::Licenses => Box::new(licenses::Licenses),
        StageKind::Items => Box::new(items::Items),
        StageKind::Bundles => Box::new(bundles::Bundles),
        StageKind::Bitstreams => Box::new(bitstreams::Bitstreams),
        StageKind::UserMetadata => Box::new(user_metadata::UserMetadata),
        StageKind::ResourcePolicies => Box::new(policies::ResourcePolicies),
        StageKind::Sequences => Box::new(sequences::Sequences),
    }
}

/// Run every remaining sub-phase of `checkpoint`, flushing after each one.
pub async fn run_stage(
    stage: &dyn Stage,
    ctx: &mut StageContext<'_>,
    checkpoint: &mut Checkpoint,
) -> Result<()> {
    while let Some(phase) = checkpoint.next_phase()? {
        info!("Stage {}: sub-phase {}", stage.kind(), phase);
        stage.run_phase(phase, ctx, checkpoint).await?;
        checkpoint.complete_phase(phase)?;
        ctx.flush(checkpoint)?;
    }
    Ok(())
}

/// The destination store and the two legacy stores.
pub struct Databases {
    pub dspace7: RelationalSource,
    pub dspace5: RelationalSource,
    pub utilities5: RelationalSource,
}

static EMPTY_MAP: IdentityMap = IdentityMap::new();
static EMPTY_MULTI_MAP: MultiIdentityMap = MultiIdentityMap::new();

/// Stages that assign destination groups, in lookup order.
const GROUP_STAGES: [StageKind; 4] = [
    StageKind::Groups,
    StageKind::Communities,
    StageKind::Collections,
    StageKind::EpersonGroups,
];

/// Read-only view of finished stages.
#[derive(Debug, Default)]
pub struct Lookup {
    checkpoints: BTreeMap<StageKind, Checkpoint>,
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.insert(checkpoint.stage, checkpoint);
    }

    pub fn checkpoint(&self, stage: StageKind) -> Option<&Checkpoint> {
        self.checkpoints.get(&stage)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    /// Map `name` of `stage`; empty when the stage has not run.
    pub fn map(&self, stage: StageKind, name: &str) -> &IdentityMap {
        self.checkpoints
            .get(&stage)
            .and_then(|cp| cp.map(name))
            .unwrap_or(&EMPTY_MAP)
    }

    pub fn multi_map(&self, stage: StageKind, name: &str) -> &MultiIdentityMap {
        self.checkpoints
            .get(&stage)
            .and_then(|cp| cp.multi_map(name))
            .unwrap_or(&EMPTY_MULTI_MAP)
    }

    pub fn get(&self, stage: StageKind, name: &str, legacy_id: i64) -> Option<&Handle> {
        self.map(stage, name).get(legacy_id)
    }

    /// Every destination group created for a legacy group.
    pub fn groups(&self, legacy_id: i64) -> Vec<&Handle> {
        let mut found: Vec<&Handle> = Vec::new();
        for stage in GROUP_STAGES {
            for handle in self.multi_map(stage, maps::GROUP).get(legacy_id) {
                if !found.contains(&handle) {
                    found.push(handle);
                }
            }
        }
        found
    }

    /// Destination handle of any legacy object.
    pub fn object(&self, rtype: ResourceType, legacy_id: i64) -> Option<&Handle> {
        match rtype {
            ResourceType::Bitstream => self.get(StageKind::Bitstreams, maps::BITSTREAM, legacy_id),
            ResourceType::Bundle => self.get(StageKind::Bundles, maps::BUNDLE, legacy_id),
            ResourceType::Item => self.get(StageKind::Items, maps::ITEM, legacy_id),
            ResourceType::Collection => {
                self.get(StageKind::Collections, maps::COLLECTION, legacy_id)
            }
            ResourceType::Community => {
                self.get(StageKind::Communities, maps::COMMUNITY, legacy_id)
            }
            ResourceType::Group => self.groups(legacy_id).into_iter().next(),
            ResourceType::Eperson => self.get(StageKind::People, maps::EPERSON, legacy_id),
        }
    }
}

/// Everything a stage may touch while it runs.
pub struct StageContext<'a> {
    pub config: &'a Config,
    /// Client for sequential calls.
    pub client: &'a TransportClient,
    /// Builds one client per pool worker.
    pub factory: &'a dyn ClientFactory<Client = TransportClient>,
    pub legacy: &'a mut LegacyStore,
    pub dbs: &'a mut Databases,
    pub earlier: &'a Lookup,
    store: Option<&'a CheckpointStore>,
    since_flush: usize,
}

impl<'a> StageContext<'a> {
    pub fn new(
        config: &'a Config,
        client: &'a TransportClient,
        factory: &'a dyn ClientFactory<Client = TransportClient>,
        legacy: &'a mut LegacyStore,
        dbs: &'a mut Databases,
        earlier: &'a Lookup,
        store: Option<&'a CheckpointStore>,
    ) -> Self {
        Self {
            config,
            client,
            factory,
            legacy,
            dbs,
            earlier,
            store,
            since_flush: 0,
        }
    }

    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.config.migration.get_workers())
    }

    /// Absolute API URL, as used in `text/uri-list` bodies.
    pub fn api_uri(&self, path: &str) -> String {
        self.config.api_url(path)
    }

    /// Count one applied record and flush every `checkpoint_every` records.
    pub fn tick(
        &mut self,
        checkpoint: &mut Checkpoint,
        phase: Phase,
        counters: &PhaseCounters,
    ) -> Result<()> {
        self.since_flush += 1;
        if self.since_flush >= self.config.migration.checkpoint_every.max(1) {
            *checkpoint.counters_mut(phase) = counters.clone();
            self.flush(checkpoint)?;
        }
        Ok(())
    }

    /// Persist `checkpoint` now.
    pub fn flush(&mut self, checkpoint: &mut Checkpoint) -> Result<()> {
        self.since_flush = 0;
        if let Some(store) = self.store {
            store.save(checkpoint)?;
            debug!("Flushed checkpoint {}", checkpoint.stage);
        }
        Ok(())
    }
}

/// Page size for reading existing destination objects.
pub(crate) const PAGE_SIZE: usize = 100;

pub(crate) fn unknown_phase(kind: StageKind, phase: Phase) -> MigrateError {
    MigrateError::State(format!("{} has no sub-phase {}", kind, phase))
}

pub(crate) fn log_before(key: &str, expected: u64) {
    info!("{}: expected {}", key, expected);
}

pub(crate) fn log_after(key: &str, counters: &PhaseCounters) {
    if counters.imported == counters.expected {
        info!("{}: imported {} of {}", key, counters.imported, counters.expected);
    } else {
        warn!(
            "{}: imported {} of {} (skipped {}, failed {}, critical {})",
            key,
            counters.imported,
            counters.expected,
            counters.skipped,
            counters.failed,
            counters.critical
        );
    }
}

/// Log the after-line and store the final counters of `phase`.
pub(crate) fn finish(checkpoint: &mut Checkpoint, phase: Phase, key: &str, counters: PhaseCounters) {
    log_after(key, &counters);
    *checkpoint.counters_mut(phase) = counters;
}

/// Count a per-record failure. Fatal errors propagate.
pub(crate) fn absorb(counters: &mut PhaseCounters, err: MigrateError) -> Result<()> {
    if err.is_fatal() {
        return Err(err);
    }
    error!("{}", err);
    counters.failed += 1;
    Ok(())
}

/// Skip a record a later stage depends on.
pub(crate) fn critical(counters: &mut PhaseCounters, kind: &str, legacy_id: i64, message: &str) {
    error!("CRITICAL {} [{}]: {}", kind, legacy_id, message);
    counters.skipped += 1;
    counters.critical += 1;
}

/// Destination id of a created object.
pub(crate) fn created(response: &Response, kind: &str, legacy_id: i64) -> Result<Handle> {
    response
        .id()
        .map(Handle::from)
        .ok_or_else(|| MigrateError::record(kind, legacy_id, "response carried no id"))
}

/// Send a create request and return the new object's id.
pub(crate) async fn create(
    client: &TransportClient,
    request: &ApiRequest,
    kind: &str,
    legacy_id: i64,
) -> Result<Handle> {
    let response = client.call(request).await?;
    created(&response, kind, legacy_id)
}

/// Record pool outcomes under `map`, then persist the checkpoint.
fn apply_created(
    ctx: &mut StageContext<'_>,
    checkpoint: &mut Checkpoint,
    phase: Phase,
    map: &str,
    counters: &mut PhaseCounters,
    outcomes: Vec<TaskOutcome<(i64, ApiRequest), Handle>>,
) -> Result<()> {
    for outcome in outcomes {
        let (id, _) = outcome.task;
        match outcome.result {
            Ok(handle) => {
                checkpoint.put(map, id, handle)?;
                counters.imported += 1;
            }
            Err(e) => absorb(counters, e)?,
        }
    }
    *checkpoint.counters_mut(phase) = counters.clone();
    ctx.flush(checkpoint)
}

/// Create `(legacy id, request)` tasks on the worker pool. Results land in
/// `map` and the checkpoint is flushed after every `checkpoint_every` tasks,
/// so a crash loses at most one batch of mappings.
pub(crate) async fn create_all(
    ctx: &mut StageContext<'_>,
    checkpoint: &mut Checkpoint,
    phase: Phase,
    map: &str,
    kind: &'static str,
    tasks: Vec<(i64, ApiRequest)>,
    counters: &mut PhaseCounters,
) -> Result<()> {
    let pool = ctx.pool();
    let factory = ctx.factory;
    let batch_size = ctx.config.migration.checkpoint_every;
    pool.run_batched(
        tasks,
        batch_size,
        factory,
        move |client: Arc<TransportClient>, (id, request): (i64, ApiRequest)| async move {
            create(&client, &request, kind, id).await
        },
        |outcomes| apply_created(ctx, checkpoint, phase, map, counters, outcomes),
    )
    .await
}

/// Call a link endpoint; an existing link counts as done.
pub(crate) async fn link(client: &TransportClient, request: &ApiRequest) -> Result<()> {
    match client.call(request).await {
        Ok(_) => Ok(()),
        Err(failure) if failure.is_conflict() => {
            debug!("{} {}: already linked", request.method, request.path);
            Ok(())
        }
        Err(failure) => Err(failure.into()),
    }
}

/// Counter value as `u64`.
pub(crate) fn count(n: usize) -> u64 {
    n as u64
}
