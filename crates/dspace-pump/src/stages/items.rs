//! Items: workspace and workflow submissions, installed items, extra
//! collection mappings and version histories.
//!
//! Workspace and workflow items are created through the workspace import
//! endpoint; a workflow item is then started from its workspace item. Every
//! created item lands in the `item` map, keyed by legacy item id. The
//! `workspace` map records the workspace item of both kinds, so a workflow
//! start that failed can be retried without creating the item twice.
//!
//! Installed items are the bulk of a repository and go through the
//! [`WorkerPool`](crate::pool::WorkerPool).

use super::{
    absorb, create, create_all, created, critical, finish, link, log_before, maps, unknown_phase,
    HandleIndex, Phase, Stage, StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::{MigrateError, Result};
use crate::identity::Handle;
use crate::legacy::{MetadataIndex, ResourceType, SourceRecord};
use crate::transport::{ApiRequest, TransportClient};
use crate::versions::{migrate_versions, PgVersionStore, VersionIndex, VersionInputs};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub(super) struct Items;

/// Attribute value unless absent or null.
fn present<'a>(record: &'a SourceRecord, column: &str) -> Option<&'a Value> {
    record.attrs.get(column).filter(|v| !v.is_null())
}

fn item_body(item: &SourceRecord, handle: Option<&str>, metadata: &MetadataIndex) -> Value {
    let mut body = json!({
        "discoverable": item.value("discoverable"),
        "inArchive": item.value("in_archive"),
        "lastModified": item.value("last_modified"),
        "withdrawn": item.value("withdrawn"),
    });
    if let Some(values) = metadata.to_json(ResourceType::Item, item.legacy_id) {
        body["metadata"] = values;
    }
    if let Some(handle) = handle {
        body["handle"] = Value::from(handle);
    }
    body
}

fn submitter<'a>(ctx: &'a StageContext<'_>, item: &SourceRecord) -> Option<&'a Handle> {
    item.int("submitter_id")
        .and_then(|e| ctx.earlier.get(StageKind::People, maps::EPERSON, e))
}

/// Legacy inputs shared by the submission phases.
struct Submissions {
    items: HashMap<i64, SourceRecord>,
    handles: HandleIndex,
    metadata: Arc<MetadataIndex>,
}

impl Submissions {
    async fn load(ctx: &mut StageContext<'_>) -> Result<Self> {
        let items = ctx.legacy.table("item").await?;
        Ok(Self {
            items: items.iter().map(|i| (i.legacy_id, i.clone())).collect(),
            handles: HandleIndex::build(&ctx.legacy.table("handle").await?),
            metadata: ctx.legacy.metadata().await?,
        })
    }
}

/// Create the workspace item for `submission`, returning the workspace
/// item id and the item uuid.
async fn import_workspace_item(
    ctx: &StageContext<'_>,
    inputs: &Submissions,
    submission: &SourceRecord,
    item: &SourceRecord,
) -> Result<(Handle, Handle)> {
    let id = item.legacy_id;
    let handle = inputs.handles.get(ResourceType::Item, id);
    if handle.is_none() {
        debug!("Submission item [{}] has no handle", id);
    }
    let collection = submission
        .int("collection_id")
        .and_then(|c| ctx.earlier.get(StageKind::Collections, maps::COLLECTION, c));
    let request = ApiRequest::post("clarin/import/workspaceitem")
        .param_opt("owningCollection", collection)
        .param_opt("multipleTitles", present(submission, "multiple_titles"))
        .param_opt("publishedBefore", present(submission, "published_before"))
        .param_opt("multipleFiles", present(submission, "multiple_files"))
        .param("stageReached", submission.int("stage_reached").unwrap_or(-1))
        .param("pageReached", submission.int("page_reached").unwrap_or(-1))
        .param_opt("epersonUUID", submitter(ctx, item))
        .json(item_body(item, handle, &inputs.metadata));
    let workspace = create(ctx.client, &request, "workspaceitem", submission.legacy_id).await?;
    let uuid = fetch_item(ctx.client, &workspace, id).await?;
    Ok((workspace, uuid))
}

async fn fetch_item(client: &TransportClient, workspace: &Handle, legacy_id: i64) -> Result<Handle> {
    let response = client.get(&format!("clarin/import/{}/item", workspace)).await?;
    created(&response, "item", legacy_id)
}

fn submission_item<'a>(inputs: &'a Submissions, submission: &SourceRecord) -> Result<&'a SourceRecord> {
    let item_id = submission.require_int("item_id")?;
    inputs.items.get(&item_id).ok_or_else(|| {
        MigrateError::record(submission.kind, submission.legacy_id, format!("item {} not found", item_id))
    })
}

async fn workspace(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("workspaceitem").await?;
    let inputs = Submissions::load(ctx).await?;

    let key = "workspaceitems";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for submission in legacy.iter() {
        let item = match submission_item(&inputs, submission) {
            Ok(item) => item,
            Err(e) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        if checkpoint.is_mapped(maps::WORKSPACE, item.legacy_id) {
            counters.imported += 1;
            continue;
        }
        match import_workspace_item(ctx, &inputs, submission, item).await {
            Ok((workspace, uuid)) => {
                checkpoint.put(maps::WORKSPACE, item.legacy_id, workspace)?;
                checkpoint.put(maps::ITEM, item.legacy_id, uuid)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Workspace, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Workspace, key, counters);
    Ok(())
}

async fn workflow(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("workflowitem").await?;
    let inputs = Submissions::load(ctx).await?;

    let key = "workflowitems";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for submission in legacy.iter() {
        let item = match submission_item(&inputs, submission) {
            Ok(item) => item,
            Err(e) => {
                absorb(&mut counters, e)?;
                continue;
            }
        };
        let id = item.legacy_id;
        if checkpoint.is_mapped(maps::WORKFLOW, id) {
            counters.imported += 1;
            continue;
        }
        let existing = checkpoint.map(maps::WORKSPACE).and_then(|m| m.get(id)).cloned();
        let workspace = match existing {
            Some(workspace) => workspace,
            None => match import_workspace_item(ctx, &inputs, submission, item).await {
                Ok((workspace, uuid)) => {
                    checkpoint.put(maps::WORKSPACE, id, workspace.clone())?;
                    checkpoint.put(maps::ITEM, id, uuid)?;
                    workspace
                }
                Err(e) => {
                    absorb(&mut counters, e)?;
                    continue;
                }
            },
        };

        let request = ApiRequest::post("clarin/import/workflowitem").param("id", &workspace);
        let started = match ctx.client.call(&request).await {
            Ok(response) => response.header("workflowitem_id").map(Handle::from).ok_or_else(|| {
                MigrateError::record("workflowitem", submission.legacy_id, "no workflowitem_id header")
            }),
            Err(e) => Err(e.into()),
        };
        match started {
            Ok(workflow) => {
                checkpoint.put(maps::WORKFLOW, id, workflow)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::Workflow, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::Workflow, key, counters);
    Ok(())
}

fn bump(counters: &mut PhaseCounters, name: &str) {
    *counters.extra.entry(name.to_string()).or_default() += 1;
}

async fn install(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let inputs = Submissions::load(ctx).await?;
    let legacy = ctx.legacy.table("item").await?;

    let key = "items";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    let mut tasks: Vec<(i64, ApiRequest)> = Vec::new();
    for item in legacy.iter() {
        let id = item.legacy_id;
        if checkpoint.is_mapped(maps::WORKFLOW, id) {
            counters.imported += 1;
            bump(&mut counters, "workflow");
            continue;
        }
        if checkpoint.is_mapped(maps::WORKSPACE, id) {
            counters.imported += 1;
            bump(&mut counters, "workspace");
            continue;
        }
        if checkpoint.is_mapped(maps::ITEM, id) {
            counters.imported += 1;
            continue;
        }
        let Some(handle) = inputs.handles.get(ResourceType::Item, id) else {
            critical(&mut counters, "item", id, "no handle");
            continue;
        };
        let Some(owner) = item.int("owning_collection") else {
            critical(&mut counters, "item", id, "no owning collection");
            bump(&mut counters, "no_collection");
            continue;
        };
        let Some(collection) = ctx.earlier.get(StageKind::Collections, maps::COLLECTION, owner) else {
            critical(&mut counters, "item", id, "owning collection was not imported");
            bump(&mut counters, "no_collection");
            continue;
        };
        let request = ApiRequest::post("clarin/import/item")
            .param("owningCollection", collection)
            .param_opt("epersonUUID", submitter(ctx, item))
            .json(item_body(item, Some(handle), &inputs.metadata));
        tasks.push((id, request));
    }

    create_all(ctx, checkpoint, Phase::Install, maps::ITEM, "item", tasks, &mut counters).await?;
    finish(checkpoint, Phase::Install, key, counters);
    Ok(())
}

async fn collection_mapping(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("collection2item").await?;
    let mut collections_of: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for row in legacy.iter() {
        if let (Some(item), Some(collection)) = (row.int("item_id"), row.int("collection_id")) {
            let collections = collections_of.entry(item).or_default();
            if !collections.contains(&collection) {
                collections.push(collection);
            }
        }
    }
    collections_of.retain(|_, c| c.len() > 1);

    let key = "items coll";
    let mut counters = PhaseCounters {
        expected: collections_of.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for (item, collections) in collections_of {
        if checkpoint.is_mapped(maps::MAPPED, item) {
            counters.imported += 1;
            continue;
        }
        let Some(uuid) = checkpoint.map(maps::ITEM).and_then(|m| m.get(item)).cloned() else {
            critical(&mut counters, "item", item, "mapped item was not imported");
            continue;
        };
        let resolved: Option<Vec<String>> = collections
            .iter()
            .map(|c| {
                ctx.earlier
                    .get(StageKind::Collections, maps::COLLECTION, *c)
                    .map(|h| ctx.api_uri(&format!("core/collections/{}", h)))
            })
            .collect();
        let Some(uris) = resolved else {
            critical(&mut counters, "item", item, "a mapped collection was not imported");
            continue;
        };
        let request = ApiRequest::post(format!("clarin/import/item/{}/mappedCollections", uuid))
            .uri_list(uris);
        match link(ctx.client, &request).await {
            Ok(()) => {
                checkpoint.put(maps::MAPPED, item, uuid)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::CollectionMapping, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::CollectionMapping, key, counters);
    Ok(())
}

async fn versions(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let items = ctx.legacy.table("item").await?;
    let metadata = ctx.legacy.metadata().await?;
    let index = VersionIndex::build(&items, &metadata);
    let admin = ctx.dbs.dspace7.admin_uuid(&ctx.config.backend.user).await?;
    if admin.is_none() {
        info!("Admin {} not found, version rows get no eperson", ctx.config.backend.user);
    }

    let imported = checkpoint.map(maps::ITEM).cloned().unwrap_or_default();
    let pending: BTreeSet<i64> = [maps::WORKSPACE, maps::WORKFLOW]
        .iter()
        .filter_map(|m| checkpoint.map(m))
        .flat_map(|m| m.iter().map(|(id, _)| id))
        .collect();

    let key = "versions";
    log_before(key, index.versioned_items().len() as u64);
    let report = {
        let inputs = VersionInputs {
            index: &index,
            items: &imported,
            pending: &pending,
            date_fields: &ctx.config.migration.version_date_fields,
        };
        let mut store = PgVersionStore::new(&mut ctx.dbs.dspace7, admin);
        migrate_versions(&inputs, &mut store).await?
    };

    let mut counters = PhaseCounters {
        expected: report.written + report.failed,
        imported: report.written,
        failed: report.failed,
        ..PhaseCounters::default()
    };
    for (name, value) in [
        ("chains", report.chains),
        ("skipped_chains", report.skipped),
        ("resumed_chains", report.resumed),
        ("multi_external", report.multi_external),
        ("unexpected", report.unexpected),
        ("missing", report.missing),
        ("unimported", report.unimported),
    ] {
        counters.extra.insert(name.to_string(), value);
    }
    finish(checkpoint, Phase::Versions, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for Items {
    fn kind(&self) -> StageKind {
        StageKind::Items
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::Workspace => workspace(ctx, checkpoint).await,
            Phase::Workflow => workflow(ctx, checkpoint).await,
            Phase::Install => install(ctx, checkpoint).await,
            Phase::CollectionMapping => collection_mapping(ctx, checkpoint).await,
            Phase::Versions => versions(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}
