//! Checkpoint → Graph → Engine conversions.
//!
//! Graphs are ONNX models executed through ONNX Runtime. Engines are
//! platform-bound compiled plans executed on the Burn backend.
//!
//! Every conversion runs a seeded probe batch through the source and the
//! converted artifact and only persists the result when both agree within the
//! configured tolerance. Conversions hold the source checkpoint's
//! [`CheckpointLease`] while they run, and re-read the checkpoint under it.

pub mod container;
pub mod engine;
pub mod graph;
pub mod lock;
pub mod onnx;
pub mod parity;
pub mod runtime;
pub mod session;
pub mod store;
pub mod trace;

use std::path::PathBuf;

use burn::prelude::*;

pub use engine::{Engine, EngineBuildConfig, EngineRuntime, PlatformFingerprint};
pub use graph::{Graph, Op, GRAPH_OPSET};
pub use lock::CheckpointLease;
pub use parity::ParityReport;
pub use session::OnnxRuntime;
pub use store::ArtifactStore;
pub use trace::trace_model;

use crate::{
    config::Precision,
    error::{StrokeSegError, StrokeSegResult},
    training::Checkpoint,
};

/// Parity tolerances and probe settings shared by both conversions.
#[derive(Config, Debug)]
pub struct ExportConfig {
    /// Max |Δprobability| between checkpoint and graph.
    #[config(default = "1e-3")]
    pub graph_epsilon: f32,
    /// Max |Δprobability| between graph and an fp32 engine.
    #[config(default = "1e-3")]
    pub engine_fp32_epsilon: f32,
    /// Max |Δprobability| between graph and an fp16 engine.
    #[config(default = "1e-2")]
    pub engine_fp16_epsilon: f32,
    /// Max fraction of mask pixels allowed to differ.
    #[config(default = "0.01")]
    pub max_mask_disagreement: f32,
    #[config(default = "2")]
    pub probe_batch_size: usize,
    #[config(default = "0")]
    pub probe_seed: u64,
    #[config(default = "0.5")]
    pub threshold: f32,
}

impl ExportConfig {
    pub const fn engine_epsilon(&self, precision: Precision) -> f32 {
        match precision {
            Precision::Fp32 => self.engine_fp32_epsilon,
            Precision::Fp16 => self.engine_fp16_epsilon,
        }
    }

    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` for negative
    /// tolerances, an empty probe or a threshold outside `[0, 1]`.
    pub fn validate(&self) -> StrokeSegResult<()> {
        let tolerances = [
            self.graph_epsilon,
            self.engine_fp32_epsilon,
            self.engine_fp16_epsilon,
            self.max_mask_disagreement,
        ];
        if tolerances.iter().any(|t| t.is_nan() || *t < 0.0) {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: "export tolerances must be non-negative".into(),
            });
        }
        if self.probe_batch_size == 0 {
            return Err(StrokeSegError::InvalidConfiguration {
                reason: "probe_batch_size must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(StrokeSegError::InvalidThreshold {
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

/// Re-opens `checkpoint` from disk and checks it is still the same save.
fn reopen_unchanged(checkpoint: &Checkpoint) -> StrokeSegResult<Checkpoint> {
    let current = Checkpoint::open(checkpoint.dir())?;
    if current.content_hash() != checkpoint.content_hash() {
        return Err(StrokeSegError::ArtifactFormat {
            path: checkpoint.dir().to_path_buf(),
            reason: format!(
                "checkpoint was replaced since it was opened (hash {} is now {})",
                checkpoint.content_hash(),
                current.content_hash()
            ),
        });
    }
    Ok(current)
}

/// Converts `checkpoint` to an ONNX graph, or returns the stored one.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::ArtifactBusy)` if the checkpoint is leased,
/// `Err(StrokeSegError::ArtifactFormat)` if the checkpoint directory was
/// overwritten since `checkpoint` was opened,
/// `Err(StrokeSegError::ConversionMismatch)` if the graph does not reproduce
/// the model under ONNX Runtime, and I/O or record errors.
pub fn export_graph<B: Backend>(
    checkpoint: &Checkpoint,
    store: &ArtifactStore,
    config: &ExportConfig,
    device: &B::Device,
) -> StrokeSegResult<PathBuf> {
    config.validate()?;
    let hash = checkpoint.content_hash();
    if let Some(path) = store.find_graph(hash) {
        tracing::info!(path = %path.display(), "graph already exported");
        return Ok(path);
    }

    let _lease = CheckpointLease::acquire(checkpoint.dir())?;
    let checkpoint = reopen_unchanged(checkpoint)?;
    let model = checkpoint.load_model::<B>(device)?;
    let metadata = checkpoint.metadata();
    let target = store.graph_path(hash);

    let graph = trace_model(&model, &metadata.model, &metadata.preprocess, hash);
    graph.validate(&target)?;
    let bytes = graph.to_bytes()?;
    Graph::from_bytes(&bytes, &target)?;

    let runtime = OnnxRuntime::from_bytes(&bytes, graph.item_shape(), &target)?;
    let probe = parity::probe_batch::<B>(
        config.probe_batch_size,
        runtime.input_shape(),
        config.probe_seed,
        device,
    );
    let reference = parity::host_logits(model.forward(probe.clone()));
    let candidate = parity::host_logits(runtime.forward(probe)?);

    ParityReport::compare(&reference, &candidate, config.threshold).check(
        config.graph_epsilon,
        config.max_mask_disagreement,
        hash,
        "graph",
        Precision::Fp32,
    )?;

    store.persist(&target, &bytes)
}

/// Compiles the checkpoint's graph into an engine, exporting the graph first
/// if needed, or returns the stored engine.
///
/// A stored engine built on another platform is replaced.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::EngineBuildFailure)` when the plan does not
/// fit, `Err(StrokeSegError::ConversionMismatch)` when the engine deviates
/// from the graph, plus every error of [`export_graph`].
pub fn build_engine<B: Backend>(
    checkpoint: &Checkpoint,
    store: &ArtifactStore,
    build: &EngineBuildConfig,
    config: &ExportConfig,
    device: &B::Device,
) -> StrokeSegResult<PathBuf> {
    config.validate()?;
    let hash = checkpoint.content_hash();
    let target = store.engine_path(hash, build.precision);

    if let Some(path) = store.find_engine(hash, build.precision) {
        match Engine::read(&path) {
            Ok(_) => {
                tracing::info!(path = %path.display(), "engine already built");
                return Ok(path);
            }
            Err(StrokeSegError::IncompatibleEngine {
                built_for,
                running_on,
                ..
            }) => {
                tracing::warn!(%built_for, %running_on, "replacing incompatible engine");
                std::fs::remove_file(&path).map_err(|e| StrokeSegError::io(&path, e))?;
            }
            Err(e) => return Err(e),
        }
    }

    let graph_path = export_graph::<B>(checkpoint, store, config, device)?;
    let bytes = std::fs::read(&graph_path).map_err(|e| StrokeSegError::io(&graph_path, e))?;
    let graph = Graph::from_bytes(&bytes, &graph_path)?;

    let _lease = CheckpointLease::acquire(checkpoint.dir())?;
    reopen_unchanged(checkpoint)?;
    let engine = Engine::build(&graph, build)?;

    let reference = OnnxRuntime::from_bytes(&bytes, graph.item_shape(), &graph_path)?;
    let candidate = EngineRuntime::<B>::new(&engine, target.clone(), device)?;
    let probe = parity::probe_batch::<B>(
        config.probe_batch_size,
        reference.input_shape(),
        config.probe_seed,
        device,
    );

    let chunk = candidate.max_batch_size();
    let mut report: Option<ParityReport> = None;
    for start in (0..config.probe_batch_size).step_by(chunk) {
        let end = (start + chunk).min(config.probe_batch_size);
        let items = probe.clone().narrow(0, start, end - start);
        let expected = parity::host_logits(reference.forward(items.clone())?);
        let actual = parity::host_logits(candidate.forward(items)?);
        let part = ParityReport::compare(&expected, &actual, config.threshold);
        report = Some(report.map_or(part, |r| r.merge(part)));
    }

    if let Some(report) = report {
        report.check(
            config.engine_epsilon(build.precision),
            config.max_mask_disagreement,
            hash,
            "engine",
            build.precision,
        )?;
    }

    store.persist(&target, &engine.to_bytes()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tolerances() {
        let config = ExportConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine_epsilon(Precision::Fp32), 1e-3);
        assert_eq!(config.engine_epsilon(Precision::Fp16), 1e-2);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(ExportConfig::new().with_graph_epsilon(-1.0).validate().is_err());
        assert!(ExportConfig::new().with_graph_epsilon(f32::NAN).validate().is_err());
        assert!(ExportConfig::new().with_probe_batch_size(0).validate().is_err());
        assert!(matches!(
            ExportConfig::new().with_threshold(1.5).validate(),
            Err(StrokeSegError::InvalidThreshold { .. })
        ));
    }
}
