//! On-disk checkpoints: `checkpoint.json` plus a `weights.mpk` record.
//!
//! A checkpoint is the only source of truth for a trained model. Graphs and
//! engines derived from it are keyed by its content hash.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::{ModelConfig, MonitoredMetric, PreprocessConfig},
    error::{StrokeSegError, StrokeSegResult},
    export::CheckpointLease,
    models::StrokeUNet,
};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_METADATA_FILE: &str = "checkpoint.json";
/// Weight record stem; the recorder appends `.mpk`.
pub const CHECKPOINT_WEIGHTS_STEM: &str = "weights";

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    /// Epoch (1-based) the weights were taken from.
    pub epoch: usize,
    pub monitored_metric: MonitoredMetric,
    pub metric_value: f64,
    /// Hex SHA-256 over the weight record and both configurations.
    pub content_hash: String,
}

/// A validated checkpoint directory.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Writes `model` and its metadata into `dir`, replacing any previous
    /// checkpoint there.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactBusy)` while an export holds the
    /// directory's lease, or an I/O or record error if writing fails.
    pub fn save<B: Backend>(
        dir: &Path,
        model: &StrokeUNet<B>,
        model_config: &ModelConfig,
        preprocess: &PreprocessConfig,
        epoch: usize,
        monitored_metric: MonitoredMetric,
        metric_value: f64,
    ) -> StrokeSegResult<Self> {
        fs::create_dir_all(dir).map_err(|e| StrokeSegError::io(dir, e))?;
        let _lease = CheckpointLease::acquire(dir)?;

        model.clone().save(&dir.join(CHECKPOINT_WEIGHTS_STEM))?;
        let content_hash = content_hash(&weights_path(dir), model_config, preprocess)?;

        let metadata = CheckpointMetadata {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model: model_config.clone(),
            preprocess: preprocess.clone(),
            epoch,
            monitored_metric,
            metric_value,
            content_hash,
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| StrokeSegError::serialization("checkpoint metadata", e))?;

        let tmp = dir.join(format!("{CHECKPOINT_METADATA_FILE}.tmp"));
        let target = dir.join(CHECKPOINT_METADATA_FILE);
        fs::write(&tmp, json).map_err(|e| StrokeSegError::io(&tmp, e))?;
        fs::rename(&tmp, &target).map_err(|e| StrokeSegError::io(&target, e))?;

        tracing::info!(
            dir = %dir.display(),
            epoch,
            metric = %monitored_metric,
            value = metric_value,
            hash = %&metadata.content_hash[..12],
            "checkpoint saved"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    /// Opens a checkpoint directory and verifies its content hash.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::ArtifactFormat)` for an unsupported format
    /// version or a hash that no longer matches the files, and I/O or
    /// serialization errors for unreadable files.
    pub fn open(dir: &Path) -> StrokeSegResult<Self> {
        let meta_path = dir.join(CHECKPOINT_METADATA_FILE);
        let json = fs::read_to_string(&meta_path).map_err(|e| StrokeSegError::io(&meta_path, e))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&json)
            .map_err(|e| StrokeSegError::serialization(format!("{}", meta_path.display()), e))?;

        if metadata.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(StrokeSegError::ArtifactFormat {
                path: meta_path,
                reason: format!(
                    "checkpoint format {} is not supported (expected {CHECKPOINT_FORMAT_VERSION})",
                    metadata.format_version
                ),
            });
        }

        let actual = content_hash(&weights_path(dir), &metadata.model, &metadata.preprocess)?;
        if actual != metadata.content_hash {
            return Err(StrokeSegError::ArtifactFormat {
                path: dir.to_path_buf(),
                reason: format!(
                    "content hash {actual} does not match recorded {}",
                    metadata.content_hash
                ),
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    pub fn content_hash(&self) -> &str {
        &self.metadata.content_hash
    }

    pub fn weights_path(&self) -> PathBuf {
        weights_path(&self.dir)
    }

    /// Rebuilds the model from the recorded configuration and weights.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::Record)` if the weights cannot be loaded.
    pub fn load_model<B: Backend>(&self, device: &B::Device) -> StrokeSegResult<StrokeUNet<B>> {
        self.metadata
            .model
            .load(&self.dir.join(CHECKPOINT_WEIGHTS_STEM), device)
    }
}

fn weights_path(dir: &Path) -> PathBuf {
    dir.join(format!("{CHECKPOINT_WEIGHTS_STEM}.mpk"))
}

fn content_hash(
    weights: &Path,
    model: &ModelConfig,
    preprocess: &PreprocessConfig,
) -> StrokeSegResult<String> {
    let bytes = fs::read(weights).map_err(|e| StrokeSegError::io(weights, e))?;
    let model_json =
        serde_json::to_vec(model).map_err(|e| StrokeSegError::serialization("model config", e))?;
    let preprocess_json = serde_json::to_vec(preprocess)
        .map_err(|e| StrokeSegError::serialization("preprocess config", e))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.update(&model_json);
    hasher.update(&preprocess_json);
    Ok(format!("{:x}", hasher.finalize()))
}
