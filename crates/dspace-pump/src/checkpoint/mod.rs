//! Durable per-stage progress for resume.
//!
//! A [`Checkpoint`] holds one stage's identity maps, counters and the last
//! completed sub-phase. Files are pretty JSON with sorted maps and no
//! wall-clock fields, so loading and re-saving an unchanged checkpoint
//! reproduces the same bytes.

mod store;

pub use store::CheckpointStore;

use crate::error::{MigrateError, Result};
use crate::identity::{Handle, IdentityMap, LinkSet, MultiIdentityMap, PutOutcome};
use crate::stages::{Phase, StageKind};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Current checkpoint file format.
pub const FORMAT_VERSION: u32 = 1;

/// Where a stage stands in its sub-phase sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageProgress {
    Pending,
    /// `completed` is the last sub-phase whose writes were flushed.
    InProgress { completed: Phase },
    Done,
}

impl StageProgress {
    /// The first sub-phase still to run, or `None` when the stage is done.
    pub fn next_phase(&self, phases: &[Phase]) -> Result<Option<Phase>> {
        match self {
            StageProgress::Pending => Ok(phases.first().copied()),
            StageProgress::Done => Ok(None),
            StageProgress::InProgress { completed } => {
                let at = phases.iter().position(|p| p == completed).ok_or_else(|| {
                    MigrateError::State(format!(
                        "checkpoint names sub-phase '{}' which this stage does not have",
                        completed
                    ))
                })?;
                Ok(phases.get(at + 1).copied())
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StageProgress::Done)
    }
}

/// Counters for one sub-phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounters {
    pub expected: u64,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Failed records that a later stage needs.
    pub critical: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, u64>,
}

impl PhaseCounters {
    pub fn absorb(&mut self, other: &PhaseCounters) {
        self.expected += other.expected;
        self.imported += other.imported;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.critical += other.critical;
        for (k, v) in &other.extra {
            *self.extra.entry(k.clone()).or_default() += v;
        }
    }
}

/// Snapshot of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub stage: StageKind,
    /// Fingerprint of the configuration the run was started with.
    pub config_hash: String,
    pub progress: StageProgress,
    #[serde(default)]
    pub counters: BTreeMap<String, PhaseCounters>,
    #[serde(default)]
    pub maps: BTreeMap<String, IdentityMap>,
    #[serde(default)]
    pub multi_maps: BTreeMap<String, MultiIdentityMap>,
    #[serde(default)]
    pub links: BTreeMap<String, LinkSet>,
    /// HMAC-SHA256 over the rest of the file, keyed by `config_hash`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl Checkpoint {
    pub fn new(stage: StageKind, config_hash: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            stage,
            config_hash: config_hash.into(),
            progress: StageProgress::Pending,
            counters: BTreeMap::new(),
            maps: BTreeMap::new(),
            multi_maps: BTreeMap::new(),
            links: BTreeMap::new(),
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Load and integrity-check a checkpoint file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&content)
            .map_err(|e| MigrateError::State(format!("{}: {}", path.display(), e)))?;

        if checkpoint.format_version != FORMAT_VERSION {
            return Err(MigrateError::State(format!(
                "{}: unsupported format version {}",
                path.display(),
                checkpoint.format_version
            )));
        }

        match &checkpoint.hmac {
            Some(stored) => {
                if *stored != checkpoint.compute_hmac()? {
                    return Err(MigrateError::State(format!(
                        "{}: integrity check failed (HMAC mismatch)",
                        path.display()
                    )));
                }
            }
            None => warn!(
                "{}: checkpoint has no HMAC, integrity cannot be verified",
                path.display()
            ),
        }

        Ok(checkpoint)
    }

    /// Sign and write atomically.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Mark `phase` complete; the stage is done after its last sub-phase.
    pub fn complete_phase(&mut self, phase: Phase) -> Result<()> {
        let phases = self.stage.phases();
        let at = phases.iter().position(|p| *p == phase).ok_or_else(|| {
            MigrateError::State(format!("{} has no sub-phase {}", self.stage, phase))
        })?;
        self.progress = if at + 1 == phases.len() {
            StageProgress::Done
        } else {
            StageProgress::InProgress { completed: phase }
        };
        Ok(())
    }

    pub fn next_phase(&self) -> Result<Option<Phase>> {
        self.progress.next_phase(self.stage.phases())
    }

    pub fn map(&self, name: &str) -> Option<&IdentityMap> {
        self.maps.get(name)
    }

    /// True when `legacy_id` already has a handle in map `name`.
    pub fn is_mapped(&self, name: &str, legacy_id: i64) -> bool {
        self.maps.get(name).map_or(false, |m| m.contains(legacy_id))
    }

    pub fn map_mut(&mut self, name: &str) -> &mut IdentityMap {
        self.maps.entry(name.to_string()).or_default()
    }

    /// Record `legacy_id -> handle` in map `name`.
    pub fn put(&mut self, name: &str, legacy_id: i64, handle: Handle) -> Result<PutOutcome> {
        self.map_mut(name).put(name, legacy_id, handle)
    }

    pub fn multi_map(&self, name: &str) -> Option<&MultiIdentityMap> {
        self.multi_maps.get(name)
    }

    pub fn multi_map_mut(&mut self, name: &str) -> &mut MultiIdentityMap {
        self.multi_maps.entry(name.to_string()).or_default()
    }

    pub fn links_mut(&mut self, name: &str) -> &mut LinkSet {
        self.links.entry(name.to_string()).or_default()
    }

    pub fn has_link(&self, name: &str, left: i64, right: i64) -> bool {
        self.links
            .get(name)
            .map(|set| set.contains(&(left, right)))
            .unwrap_or(false)
    }

    pub fn counters_mut(&mut self, phase: Phase) -> &mut PhaseCounters {
        self.counters.entry(phase.as_str().to_string()).or_default()
    }

    /// Sum of all sub-phase counters.
    pub fn totals(&self) -> PhaseCounters {
        let mut total = PhaseCounters::default();
        for counters in self.counters.values() {
            total.absorb(counters);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        let mut cp = Checkpoint::new(StageKind::Items, "hash-a");
        cp.put("workspace", 3, "ws-3".into()).unwrap();
        cp.put("item", 10, "uuid-10".into()).unwrap();
        cp.put("item", 2, "uuid-2".into()).unwrap();
        cp.multi_map_mut("group").put(5, "g-a".into());
        cp.links_mut("member").insert((1, 2));
        let counters = cp.counters_mut(Phase::Workspace);
        counters.expected = 1;
        counters.imported = 1;
        cp.complete_phase(Phase::Workspace).unwrap();
        cp
    }

    #[test]
    fn test_load_then_save_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        sample().save(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let mut loaded = Checkpoint::load(&path).unwrap();
        loaded.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
        assert_eq!(loaded.map("item").unwrap().len(), 2);
        assert!(loaded.has_link("member", 1, 2));
    }

    #[test]
    fn test_tampered_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        sample().save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("uuid-10", "uuid-99")).unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(MigrateError::State(_))
        ));
    }

    #[test]
    fn test_unsigned_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("items.json");
        let cp = sample();
        std::fs::write(&path, serde_json::to_string(&cp).unwrap()).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap().maps, cp.maps);
    }

    #[test]
    fn test_config_change_is_detected() {
        let cp = sample();
        assert!(cp.validate_config("hash-a").is_ok());
        assert!(matches!(
            cp.validate_config("hash-b"),
            Err(MigrateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_resume_starts_at_first_incomplete_phase() {
        let mut cp = Checkpoint::new(StageKind::Items, "h");
        assert_eq!(cp.next_phase().unwrap(), Some(Phase::Workspace));
        cp.complete_phase(Phase::Workspace).unwrap();
        assert_eq!(cp.next_phase().unwrap(), Some(Phase::Workflow));
        cp.complete_phase(Phase::Workflow).unwrap();
        cp.complete_phase(Phase::Install).unwrap();
        cp.complete_phase(Phase::CollectionMapping).unwrap();
        cp.complete_phase(Phase::Versions).unwrap();
        assert!(cp.progress.is_done());
        assert_eq!(cp.next_phase().unwrap(), None);
    }

    #[test]
    fn test_foreign_phase_is_a_state_error() {
        let mut cp = Checkpoint::new(StageKind::Groups, "h");
        assert!(cp.complete_phase(Phase::Install).is_err());
        cp.progress = StageProgress::InProgress {
            completed: Phase::Install,
        };
        assert!(matches!(cp.next_phase(), Err(MigrateError::State(_))));
    }

    #[test]
    fn test_progress_serialization() {
        let json = serde_json::to_string(&StageProgress::InProgress {
            completed: Phase::CollectionMapping,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"in_progress","completed":"collection_mapping"}"#);
    }

    #[test]
    fn test_totals_sum_phases() {
        let mut cp = sample();
        cp.counters_mut(Phase::Install).failed = 2;
        cp.counters_mut(Phase::Install).critical = 1;
        let total = cp.totals();
        assert_eq!(total.imported, 1);
        assert_eq!(total.failed, 2);
        assert_eq!(total.critical, 1);
    }
}
