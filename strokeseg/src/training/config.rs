//! Training configuration.
//!
//! Configurations are JSON files produced by Burn's `Config` derive. A run is
//! named by a directory and a config name (`<dir>/<name>.json`) and may be
//! patched from the command line with dotted `key=value` overrides, for
//! example `--set model.encoder=Resnet18 --set num_epochs=5`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::prelude::*;
use serde_json::Value;

use super::scheduler::PlateauSchedulerConfig;
use crate::{
    config::{ModelConfig, MonitoredMetric, PreprocessConfig},
    data::AugmentationConfig,
    error::{StrokeSegError, StrokeSegResult},
    losses::CompositeLossConfig,
};

/// Everything needed to reproduce a training run.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Model configuration.
    pub model: ModelConfig,

    #[config(default = "PreprocessConfig::new()")]
    pub preprocess: PreprocessConfig,

    #[config(default = "AugmentationConfig::new()")]
    pub augmentation: AugmentationConfig,

    #[config(default = "CompositeLossConfig::new()")]
    pub loss: CompositeLossConfig,

    #[config(default = "PlateauSchedulerConfig::new()")]
    pub scheduler: PlateauSchedulerConfig,

    /// Dataset root scanned by [`scan_dataset`](crate::data::scan_dataset).
    #[config(default = "None")]
    pub dataset_root: Option<PathBuf>,

    /// Fraction of samples held out for validation.
    #[config(default = 0.15)]
    pub test_size: f64,

    /// Seed of the train/validation split.
    #[config(default = 42)]
    pub random_state: u64,

    #[config(default = 1e-4)]
    pub learning_rate: f64,

    #[config(default = 50)]
    pub num_epochs: usize,

    /// Consecutive non-improving validations before stopping early.
    #[config(default = 15)]
    pub patience: usize,

    #[config(default = 8)]
    pub batch_size: usize,

    /// Loader threads. Batch order is only reproducible with at most one.
    #[config(default = 1)]
    pub num_workers: usize,

    /// Seeds the backend, the loader shuffle and the augmentation.
    #[config(default = 42)]
    pub seed: u64,

    #[config(default = "MonitoredMetric::Dice")]
    pub monitored_metric: MonitoredMetric,

    /// Consecutive non-finite training losses tolerated before aborting.
    #[config(default = 5)]
    pub max_consecutive_nonfinite: usize,

    /// Probability threshold used for validation metrics.
    #[config(default = 0.5)]
    pub threshold: f32,

    /// Run directory; receives `config.json`, `history.json` and `best/`.
    #[config(default = "PathBuf::from(\"artifacts\")")]
    pub output_dir: PathBuf,

    /// Export the best checkpoint to a graph once training finishes.
    #[config(default = false)]
    pub export_graph_on_finish: bool,

    /// Artifact store used by `export_graph_on_finish`. Defaults to the user cache.
    #[config(default = "None")]
    pub artifact_store: Option<PathBuf>,
}

impl TrainingConfig {
    /// Loads a training configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> StrokeSegResult<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|e| StrokeSegError::io(path, e))?;
        serde_json::from_str(&config_str)
            .map_err(|e| StrokeSegError::serialization(format!("{}", path.display()), e))
    }

    /// Saves this configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> StrokeSegResult<()> {
        let path = path.as_ref();
        let config_str = serde_json::to_string_pretty(self)
            .map_err(|e| StrokeSegError::serialization("training config", e))?;
        fs::write(path, config_str).map_err(|e| StrokeSegError::io(path, e))
    }

    /// Loads `<config_dir>/<config_name>.json` and applies dotted overrides.
    ///
    /// Override values are parsed as JSON when possible (`5`, `true`,
    /// `[1, 2]`, `"Resnet18"`) and fall back to plain strings, so
    /// `model.encoder=Resnet18` works without quoting.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, an override is malformed
    /// or names a path through a non-object value, or the patched tree no
    /// longer deserializes.
    pub fn load_with_overrides<S: AsRef<str>>(
        config_dir: &Path,
        config_name: &str,
        overrides: &[S],
    ) -> StrokeSegResult<Self> {
        let file_name = if config_name.ends_with(".json") {
            config_name.to_owned()
        } else {
            format!("{config_name}.json")
        };
        let path = config_dir.join(file_name);

        let raw = fs::read_to_string(&path).map_err(|e| StrokeSegError::io(&path, e))?;
        let mut tree: Value = serde_json::from_str(&raw)
            .map_err(|e| StrokeSegError::serialization(format!("{}", path.display()), e))?;

        for item in overrides {
            apply_override(&mut tree, item.as_ref())?;
        }

        serde_json::from_value(tree)
            .map_err(|e| StrokeSegError::serialization("training config with overrides", e))
    }

    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> StrokeSegResult<()> {
        self.model.validate()?;
        self.preprocess.normalization.validate()?;
        self.augmentation.validate()?;
        self.loss.validate()?;
        self.scheduler.validate()?;

        let invalid = |reason: String| Err(StrokeSegError::InvalidConfiguration { reason });

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            ));
        }
        if self.num_epochs == 0 {
            return invalid("num_epochs must be at least 1".to_owned());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".to_owned());
        }
        if self.max_consecutive_nonfinite == 0 {
            return invalid("max_consecutive_nonfinite must be at least 1".to_owned());
        }
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return invalid(format!("test_size must lie in (0, 1), got {}", self.test_size));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid(format!("threshold must lie in [0, 1], got {}", self.threshold));
        }
        if self.num_workers > 1 {
            tracing::warn!(
                num_workers = self.num_workers,
                "batch order is not reproducible with more than one loader worker"
            );
        }

        Ok(())
    }

    /// Directory that holds the best checkpoint of this run.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join("best")
    }
}

fn apply_override(tree: &mut Value, item: &str) -> StrokeSegResult<()> {
    let Some((key, raw_value)) = item.split_once('=') else {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: format!("override '{item}' is not of the form key=value"),
        });
    };
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: format!("override '{item}' has an empty key segment"),
        });
    }

    let value = serde_json::from_str(raw_value.trim())
        .unwrap_or_else(|_| Value::String(raw_value.trim().to_owned()));

    let mut node = tree;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = node else {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: format!("override '{key}' descends into a non-object value"),
            });
        };
        if segments.peek().is_none() {
            map.insert(segment.to_owned(), value);
            return Ok(());
        }
        node = map
            .entry(segment.to_owned())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reference_recipe() {
        let config = TrainingConfig::new(ModelConfig::new());
        assert_eq!(config.learning_rate, 1e-4);
        assert_eq!(config.num_epochs, 50);
        assert_eq!(config.patience, 15);
        assert_eq!(config.test_size, 0.15);
        assert_eq!(config.random_state, 42);
        assert_eq!(config.monitored_metric, MonitoredMetric::Dice);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_patch_nested_values() {
        let dir = tempfile::tempdir().unwrap();
        TrainingConfig::new(ModelConfig::new())
            .save(dir.path().join("base.json"))
            .unwrap();

        let config = TrainingConfig::load_with_overrides(
            dir.path(),
            "base",
            &[
                "num_epochs=3",
                "model.encoder=Resnet18",
                "model.image_height=128",
                "monitored_metric=ValLoss",
                "dataset_root=/data/strokes",
            ],
        )
        .unwrap();

        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.model.encoder, crate::config::ResNetDepth::Resnet18);
        assert_eq!(config.model.image_height, 128);
        assert_eq!(config.monitored_metric, MonitoredMetric::ValLoss);
        assert_eq!(config.dataset_root, Some(PathBuf::from("/data/strokes")));
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        TrainingConfig::new(ModelConfig::new())
            .save(dir.path().join("base.json"))
            .unwrap();

        for bad in ["num_epochs", "=3", "num_epochs.inner=3", "model..encoder=x"] {
            assert!(
                TrainingConfig::load_with_overrides(dir.path(), "base", &[bad]).is_err(),
                "{bad} should fail"
            );
        }
        assert!(matches!(
            TrainingConfig::load_with_overrides(dir.path(), "base", &["num_epochs=many"]),
            Err(StrokeSegError::Serialization { .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let base = TrainingConfig::new(ModelConfig::new());
        assert!(base.clone().with_batch_size(0).validate().is_err());
        assert!(base.clone().with_learning_rate(0.0).validate().is_err());
        assert!(base.clone().with_threshold(1.5).validate().is_err());
        assert!(base
            .clone()
            .with_max_consecutive_nonfinite(0)
            .validate()
            .is_err());
        assert!(base.with_test_size(1.0).validate().is_err());
    }
}
