use super::Checkpoint;
use crate::error::{MigrateError, Result};
use crate::stages::StageKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory holding one checkpoint file per stage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    config_hash: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, config_hash: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            config_hash: config_hash.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn path_for(&self, stage: StageKind) -> PathBuf {
        self.dir.join(format!("{}.json", stage.as_str()))
    }

    /// Load the checkpoint for `stage`; a missing file means a fresh start.
    pub fn load(&self, stage: StageKind) -> Result<Option<Checkpoint>> {
        let path = self.path_for(stage);
        if !path.exists() {
            return Ok(None);
        }
        let checkpoint = Checkpoint::load(&path)?;
        if checkpoint.stage != stage {
            return Err(MigrateError::State(format!(
                "{} holds stage {}, expected {}",
                path.display(),
                checkpoint.stage,
                stage
            )));
        }
        checkpoint.validate_config(&self.config_hash)?;
        debug!("Loaded checkpoint {}", path.display());
        Ok(Some(checkpoint))
    }

    /// Existing checkpoint or a new pending one.
    pub fn open(&self, stage: StageKind) -> Result<Checkpoint> {
        Ok(self
            .load(stage)?
            .unwrap_or_else(|| Checkpoint::new(stage, self.config_hash.clone())))
    }

    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        checkpoint.save(self.path_for(checkpoint.stage))
    }

    /// Remove all stage checkpoints.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for stage in StageKind::ALL {
            let path = self.path_for(stage);
            if path.exists() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} checkpoint(s) from {}", removed, self.dir.display());
        }
        Ok(removed)
    }
}
