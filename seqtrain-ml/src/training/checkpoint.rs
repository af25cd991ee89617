//! Checkpoint and model-artifact persistence.
//!
//! Every artifact is a self-describing JSON envelope carrying a format
//! version, a creation timestamp and a SHA-256 digest of its payload. Writes
//! go through an atomic replace, so a crash leaves either the previous file or
//! the new one. Loads verify the digest and fail with [`MlError::Load`] on a
//! missing, unparsable or tampered file.

use crate::error::{MlError, Result};
use crate::model::ModelState;
use crate::training::optimizer::OptimizerState;
use crate::training::scheduler::PlateauState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "checkpoint.pt";
pub const BEST_MODEL_FILE: &str = "best-model.pt";
pub const FINAL_MODEL_FILE: &str = "final-model.pt";

const FORMAT_VERSION: u32 = 1;

/// Everything needed to resume a training session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub model: ModelState,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: PlateauState,
    /// Index of the next epoch to run.
    pub epoch: usize,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ArtifactKind {
    Checkpoint,
    Model,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    kind: ArtifactKind,
    created_at: DateTime<Utc>,
    sha256: String,
    payload: T,
}

fn digest<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn write_envelope<T: Serialize>(path: &Path, kind: ArtifactKind, payload: &T) -> Result<()> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        kind,
        created_at: Utc::now(),
        sha256: digest(payload)?,
        payload,
    };
    seqtrain_core::atomic_write_json(path, &envelope)?;
    Ok(())
}

fn read_envelope<T: Serialize + DeserializeOwned>(path: &Path, kind: ArtifactKind) -> Result<T> {
    let envelope: Envelope<T> = match seqtrain_core::load_json(path) {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Err(MlError::load(path, "file does not exist")),
        Err(e) => return Err(MlError::load(path, e.to_string())),
    };
    if envelope.format_version != FORMAT_VERSION {
        return Err(MlError::load(
            path,
            format!("unsupported format version {}", envelope.format_version),
        ));
    }
    if envelope.kind != kind {
        return Err(MlError::load(
            path,
            format!("expected a {kind:?} artifact, found {:?}", envelope.kind),
        ));
    }
    if digest(&envelope.payload)? != envelope.sha256 {
        return Err(MlError::load(path, "payload digest mismatch"));
    }
    Ok(envelope.payload)
}

/// Atomically write a resumable checkpoint.
pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    write_envelope(path, ArtifactKind::Checkpoint, checkpoint)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    read_envelope(path, ArtifactKind::Checkpoint)
}

/// Atomically write model weights (`best-model.pt`, `final-model.pt`).
pub fn save_model(path: &Path, state: &ModelState) -> Result<()> {
    write_envelope(path, ArtifactKind::Model, state)
}

pub fn load_model(path: &Path) -> Result<ModelState> {
    read_envelope(path, ArtifactKind::Model)
}

/// Artifact locations for one training run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.base_dir.join(CHECKPOINT_FILE)
    }

    pub fn best_model_path(&self) -> PathBuf {
        self.base_dir.join(BEST_MODEL_FILE)
    }

    pub fn final_model_path(&self) -> PathBuf {
        self.base_dir.join(FINAL_MODEL_FILE)
    }

    pub fn has_best_model(&self) -> bool {
        self.best_model_path().exists()
    }

    pub fn save(
        &self,
        model: ModelState,
        optimizer_state: OptimizerState,
        scheduler_state: PlateauState,
        epoch: usize,
        loss: f64,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path();
        let checkpoint = Checkpoint {
            model,
            optimizer_state,
            scheduler_state,
            epoch,
            loss,
        };
        save_checkpoint(&path, &checkpoint)?;
        tracing::debug!(path = %path.display(), epoch, loss, "Saved checkpoint");
        Ok(path)
    }

    pub fn save_best_model(&self, state: &ModelState) -> Result<PathBuf> {
        let path = self.best_model_path();
        save_model(&path, state)?;
        Ok(path)
    }

    pub fn save_final_model(&self, state: &ModelState) -> Result<PathBuf> {
        let path = self.final_model_path();
        save_model(&path, state)?;
        Ok(path)
    }

    pub fn load_best_model(&self) -> Result<ModelState> {
        load_model(&self.best_model_path())
    }
}
