//! Epersons, their CLARIN user registrations and group memberships.
//!
//! Epersons already present in the destination (for example the admin
//! account created during provisioning) are matched by email or netid
//! before anything is posted.

use super::{
    absorb, create, critical, finish, link, log_before, maps, unknown_phase, Phase, Stage,
    StageContext, StageKind,
};
use crate::checkpoint::{Checkpoint, PhaseCounters};
use crate::error::Result;
use crate::identity::Handle;
use crate::legacy::{ResourceType, SourceRecord};
use crate::relational::SqlValue;
use crate::transport::ApiRequest;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

pub(super) struct People;

/// Every address of a legacy `email` column; several are joined by `;`.
fn emails(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(';')
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Legacy eperson ids by normalized email and by netid.
struct PersonIndex {
    by_email: HashMap<String, i64>,
    by_netid: HashMap<String, i64>,
}

impl PersonIndex {
    fn build(people: &[SourceRecord]) -> Self {
        let mut by_email = HashMap::new();
        let mut by_netid = HashMap::new();
        for person in people {
            for email in person.str("email").map(emails).into_iter().flatten() {
                by_email.insert(email, person.legacy_id);
            }
            if let Some(netid) = person.str("netid").map(str::trim).filter(|n| !n.is_empty()) {
                by_netid.insert(netid.to_string(), person.legacy_id);
            }
        }
        Self { by_email, by_netid }
    }

    /// Legacy ids matching a destination eperson.
    fn matches(&self, email: Option<&str>, netid: Option<&str>) -> Vec<i64> {
        let mut ids: Vec<i64> = email
            .map(emails)
            .into_iter()
            .flatten()
            .filter_map(|e| self.by_email.get(&e).copied())
            .collect();
        if let Some(id) = netid.and_then(|n| self.by_netid.get(n.trim())) {
            ids.push(*id);
        }
        ids
    }
}

fn text(row: &[SqlValue], col: Option<usize>) -> Option<String> {
    col.and_then(|c| row.get(c)).and_then(SqlValue::as_text)
}

/// Map legacy epersons that already exist in the destination.
async fn hydrate(
    ctx: &mut StageContext<'_>,
    checkpoint: &mut Checkpoint,
    index: &PersonIndex,
) -> Result<usize> {
    let rows = ctx
        .dbs
        .dspace7
        .fetch_all("SELECT uuid, email, netid FROM eperson ORDER BY uuid")
        .await?;
    let (Some(uuid_col), email_col, netid_col) = (
        rows.column_index("uuid"),
        rows.column_index("email"),
        rows.column_index("netid"),
    ) else {
        return Ok(0);
    };
    let mut mapped = 0;
    for row in &rows.rows {
        let Some(uuid) = text(row, Some(uuid_col)) else {
            continue;
        };
        let (email, netid) = (text(row, email_col), text(row, netid_col));
        for legacy_id in index.matches(email.as_deref(), netid.as_deref()) {
            if checkpoint.is_mapped(maps::EPERSON, legacy_id) {
                continue;
            }
            checkpoint.put(maps::EPERSON, legacy_id, Handle::from(uuid.clone()))?;
            mapped += 1;
        }
    }
    Ok(mapped)
}

async fn people(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("eperson").await?;
    let metadata = ctx.legacy.metadata().await?;
    let index = PersonIndex::build(&legacy);
    let hydrated = hydrate(ctx, checkpoint, &index).await?;
    if hydrated > 0 {
        info!("{} epersons already exist in the destination", hydrated);
    }

    let key = "eperson";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for person in legacy.iter() {
        let id = person.legacy_id;
        if checkpoint.is_mapped(maps::EPERSON, id) {
            counters.imported += 1;
            continue;
        }
        if ctx.config.migration.ignored_epersons.contains(&id) {
            debug!("Skipping eperson [{}]", id);
            counters.skipped += 1;
            *counters.extra.entry("ignored".to_string()).or_default() += 1;
            continue;
        }
        let mut body = json!({
            "requireCertificate": person.value("require_certificate"),
            "netid": person.value("netid"),
            "canLogIn": person.value("can_log_in"),
            "email": person.value("email"),
            "password": Value::Null,
            "welcomeInfo": person.value("welcome_info"),
            "canEditSubmissionMetadata": person.value("can_edit_submission_metadata"),
        });
        if let Some(values) = metadata.to_json(ResourceType::Eperson, id) {
            body["metadata"] = values;
        }
        let request = ApiRequest::post("clarin/import/eperson")
            .param_opt("selfRegistered", person.attrs.get("self_registered").filter(|v| !v.is_null()))
            .param_opt("lastActive", person.str("last_active"))
            .param_opt("passwordHashStr", person.str("password"))
            .param_opt("salt", person.str("salt"))
            .param_opt("digestAlgorithm", person.str("digest_algorithm"))
            .json(body);
        match create(ctx.client, &request, "eperson", id).await {
            Ok(handle) => {
                checkpoint.put(maps::EPERSON, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::People, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::People, key, counters);
    Ok(())
}

async fn user_registrations(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("user_registration").await?;

    let key = "user registrations";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for registration in legacy.iter() {
        let id = registration.legacy_id;
        if checkpoint.is_mapped(maps::USER_REGISTRATION, id) {
            counters.imported += 1;
            continue;
        }
        // Registrations of people who never got an account have no eperson.
        let eperson = checkpoint
            .map(maps::EPERSON)
            .and_then(|m| m.get(id))
            .map(|h| Value::from(h.as_str()))
            .unwrap_or(Value::Null);
        let request = ApiRequest::post("clarin/import/userregistration").json(json!({
            "email": registration.value("email"),
            "organization": registration.value("organization"),
            "confirmation": registration.value("confirmation"),
            "ePersonID": eperson,
        }));
        match create(ctx.client, &request, "user_registration", id).await {
            Ok(handle) => {
                checkpoint.put(maps::USER_REGISTRATION, id, handle)?;
                counters.imported += 1;
                ctx.tick(checkpoint, Phase::UserRegistrations, &counters)?;
            }
            Err(e) => absorb(&mut counters, e)?,
        }
    }
    finish(checkpoint, Phase::UserRegistrations, key, counters);
    Ok(())
}

async fn memberships(ctx: &mut StageContext<'_>, checkpoint: &mut Checkpoint) -> Result<()> {
    let legacy = ctx.legacy.table("epersongroup2eperson").await?;

    let key = "epersongroup2eperson";
    let mut counters = PhaseCounters {
        expected: legacy.len() as u64,
        ..PhaseCounters::default()
    };
    log_before(key, counters.expected);

    for row in legacy.iter() {
        let (Some(group_id), Some(person_id)) = (row.int("eperson_group_id"), row.int("eperson_id"))
        else {
            critical(&mut counters, "epersongroup2eperson", row.legacy_id, "incomplete row");
            continue;
        };
        if checkpoint.has_link(maps::MEMBERSHIP, group_id, person_id) {
            counters.imported += 1;
            continue;
        }
        let groups: Vec<Handle> = ctx.earlier.groups(group_id).into_iter().cloned().collect();
        if groups.is_empty() {
            critical(&mut counters, "epersongroup", group_id, "group was not imported");
            continue;
        }
        let Some(person) = checkpoint.map(maps::EPERSON).and_then(|m| m.get(person_id)).cloned()
        else {
            critical(&mut counters, "eperson", person_id, "eperson was not imported");
            continue;
        };

        let uri = ctx.api_uri(&format!("eperson/epersons/{}", person));
        let mut linked = true;
        for group in &groups {
            let request = ApiRequest::post(format!("clarin/eperson/groups/{}/epersons", group))
                .uri_list(vec![uri.clone()]);
            if let Err(e) = link(ctx.client, &request).await {
                absorb(&mut counters, e)?;
                linked = false;
                break;
            }
        }
        if linked {
            checkpoint.links_mut(maps::MEMBERSHIP).insert((group_id, person_id));
            counters.imported += 1;
            ctx.tick(checkpoint, Phase::Memberships, &counters)?;
        }
    }
    finish(checkpoint, Phase::Memberships, key, counters);
    Ok(())
}

#[async_trait]
impl Stage for People {
    fn kind(&self) -> StageKind {
        StageKind::People
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &mut StageContext<'_>,
        checkpoint: &mut Checkpoint,
    ) -> Result<()> {
        match phase {
            Phase::People => people(ctx, checkpoint).await,
            Phase::UserRegistrations => user_registrations(ctx, checkpoint).await,
            Phase::Memberships => memberships(ctx, checkpoint).await,
            other => Err(unknown_phase(self.kind(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{numbering_backend, Harness};
    use super::*;
    use crate::legacy::testing::MemoryRecords;
    use crate::relational::RowSet;

    fn records() -> MemoryRecords {
        MemoryRecords::new()
            .with(
                "eperson",
                vec![
                    json!({"eperson_id": 1, "email": "Admin@Example.org", "can_log_in": true}),
                    json!({"eperson_id": 2, "email": "a@x.org;b@x.org", "password": "hash",
                           "salt": "s", "digest_algorithm": "SHA-512", "self_registered": true}),
                    json!({"eperson_id": 3, "email": "c@x.org", "netid": "c-net"}),
                    json!({"eperson_id": 4, "email": "ignored@x.org"}),
                ],
            )
            .with(
                "user_registration",
                vec![
                    json!({"eperson_id": 2, "email": "a@x.org", "organization": "UFAL", "confirmation": true}),
                    json!({"eperson_id": 9, "email": "anon@x.org", "confirmation": false}),
                ],
            )
            .with(
                "epersongroup2eperson",
                vec![
                    json!({"id": 1, "eperson_group_id": 5, "eperson_id": 2}),
                    json!({"id": 2, "eperson_group_id": 6, "eperson_id": 2}),
                    json!({"id": 3, "eperson_group_id": 5, "eperson_id": 4}),
                ],
            )
            .with_metadata(&[(ResourceType::Eperson, 2, "eperson.firstname", "Ann")])
    }

    fn harness() -> Harness {
        let mut harness = Harness::new(records(), numbering_backend());
        harness.config.migration.ignored_epersons = vec![4];
        harness.dest.respond(
            "from eperson",
            RowSet {
                columns: vec!["uuid".into(), "email".into(), "netid".into()],
                rows: vec![
                    vec![
                        SqlValue::String("admin-uuid".into()),
                        SqlValue::String("admin@example.org".into()),
                        SqlValue::Null(crate::relational::SqlNullType::String),
                    ],
                    vec![
                        SqlValue::String("net-uuid".into()),
                        SqlValue::String("other@x.org".into()),
                        SqlValue::String("c-net".into()),
                    ],
                ],
            },
        );
        let mut groups = Checkpoint::new(StageKind::EpersonGroups, "test");
        groups.multi_map_mut(maps::GROUP).put(5, "group-5".into());
        harness.finished(groups);
        harness
    }

    #[test]
    fn test_multi_address_emails_are_normalized() {
        let all: Vec<String> = emails(" A@x.org ;b@X.org;").collect();
        assert_eq!(all, vec!["a@x.org", "b@x.org"]);
    }

    #[tokio::test]
    async fn test_existing_people_are_matched_not_posted() {
        let mut harness = harness();
        let checkpoint = harness.run(StageKind::People).await.unwrap();

        let posts = harness.posts("clarin/import/eperson");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].param_value("passwordHashStr"), Some("hash"));
        assert_eq!(posts[0].param_value("selfRegistered"), Some("true"));
        assert_eq!(posts[0].json_body().unwrap()["password"], Value::Null);
        assert_eq!(
            posts[0].json_body().unwrap()["metadata"]["eperson.firstname"][0]["value"],
            "Ann"
        );

        let map = checkpoint.map(maps::EPERSON).unwrap();
        assert_eq!(map.get(1), Some(&Handle::new("admin-uuid")));
        assert_eq!(map.get(3), Some(&Handle::new("net-uuid")));
        assert!(map.get(4).is_none());
        let counters = &checkpoint.counters["people"];
        assert_eq!((counters.imported, counters.skipped), (3, 1));
    }

    #[tokio::test]
    async fn test_registration_without_account_has_no_eperson() {
        let mut harness = harness();
        let checkpoint = harness.run(StageKind::People).await.unwrap();

        let posts = harness.posts("clarin/import/userregistration");
        assert_eq!(posts.len(), 2);
        let person = checkpoint.map(maps::EPERSON).unwrap().get(2).unwrap();
        assert_eq!(posts[0].json_body().unwrap()["ePersonID"], person.as_str());
        assert_eq!(posts[1].json_body().unwrap()["ePersonID"], Value::Null);
    }

    #[tokio::test]
    async fn test_missing_group_or_person_is_critical() {
        let mut harness = harness();
        let checkpoint = harness.run(StageKind::People).await.unwrap();

        assert_eq!(harness.posts("clarin/eperson/groups/group-5/epersons").len(), 1);
        assert!(checkpoint.has_link(maps::MEMBERSHIP, 5, 2));
        let counters = &checkpoint.counters["memberships"];
        assert_eq!((counters.imported, counters.critical), (1, 2));
    }
}
