use std::path::PathBuf;

use thiserror::Error;

use crate::config::Precision;

/// The error type for strokeseg operations.
///
/// Covers everything from malformed samples through training divergence to
/// export and serving failures. Each variant carries the values a caller needs
/// to decide what to do next.
#[derive(Error, Debug)]
pub enum StrokeSegError {
    /// Image and mask of a sample have different spatial dimensions.
    #[error("sample {id}: image is {image:?} (w, h) but mask is {mask:?}")]
    DataShapeMismatch {
        /// Identifier of the offending sample.
        id: String,
        /// Image dimensions as (width, height).
        image: (u32, u32),
        /// Mask dimensions as (width, height).
        mask: (u32, u32),
    },

    /// Too many consecutive training batches produced a non-finite loss.
    #[error(
        "training diverged at epoch {epoch}, batch {batch}: {consecutive} consecutive non-finite losses"
    )]
    NumericDivergence {
        /// Epoch in which the limit was reached.
        epoch: usize,
        /// Batch index within the epoch.
        batch: usize,
        /// Number of consecutive non-finite batches observed.
        consecutive: usize,
    },

    /// A converted artifact does not reproduce its source within tolerance.
    #[error(
        "{target} ({precision}) derived from {source_hash} deviates from its source: max |dp| = {max_abs_diff:.3e} (eps {epsilon:.1e}), mask disagreement {mask_disagreement:.4}"
    )]
    ConversionMismatch {
        /// Content hash of the source checkpoint.
        source_hash: String,
        /// Artifact kind that failed validation.
        target: String,
        /// Precision of the artifact.
        precision: Precision,
        /// Largest absolute probability difference observed.
        max_abs_diff: f32,
        /// Tolerance that was exceeded.
        epsilon: f32,
        /// Fraction of mask pixels that disagree.
        mask_disagreement: f32,
    },

    /// The engine could not be compiled within the requested constraints.
    #[error(
        "engine build failed ({precision}): requires {required_workspace_bytes} workspace bytes, {requested_workspace_bytes} requested: {reason}"
    )]
    EngineBuildFailure {
        /// Workspace budget given to the builder.
        requested_workspace_bytes: u64,
        /// Peak activation memory the plan needs.
        required_workspace_bytes: u64,
        /// Precision that was requested.
        precision: Precision,
        /// Human-readable detail.
        reason: String,
    },

    /// The backend cannot run the requested operation as asked.
    #[error(
        "{backend} backend cannot run {operation} with batch {requested_batch} (max {max_batch})"
    )]
    UnsupportedBackendOperation {
        /// Backend name.
        backend: String,
        /// Operation name.
        operation: String,
        /// Requested batch size.
        requested_batch: usize,
        /// Largest batch the backend accepts.
        max_batch: usize,
    },

    /// An engine was built for a different platform or crate version.
    #[error("engine at {path} was built for {built_for}, running on {running_on}; rebuild it")]
    IncompatibleEngine {
        /// Engine file.
        path: PathBuf,
        /// Fingerprint recorded in the engine.
        built_for: String,
        /// Fingerprint of the current process.
        running_on: String,
    },

    /// Another process holds the checkpoint lease.
    #[error("artifact {path} is busy: another export or checkpoint write holds its lease")]
    ArtifactBusy {
        /// Checkpoint directory that is locked.
        path: PathBuf,
    },

    /// An artifact file is malformed or of an unsupported version.
    #[error("malformed artifact {path}: {reason}")]
    ArtifactFormat {
        /// Artifact file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// ONNX Runtime rejected a graph or failed while running it.
    #[error("ONNX Runtime failed on {path}: {reason}")]
    GraphRuntime {
        /// Graph file.
        path: PathBuf,
        /// Message from the runtime.
        reason: String,
    },

    /// Error for when an invalid configuration is provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Threshold outside `[0, 1]`.
    #[error("threshold must lie in [0, 1], got {threshold}")]
    InvalidThreshold {
        /// The rejected threshold.
        threshold: f32,
    },

    /// Error raised by a Burn recorder while saving or loading weights.
    #[error("failed to {action} record at {path}: {reason}")]
    Record {
        /// "save" or "load".
        action: &'static str,
        /// Record file.
        path: PathBuf,
        /// Recorder message.
        reason: String,
    },

    /// Error when reading or decoding an image fails.
    #[error("Failed to open image: {path}")]
    Image {
        /// The image file path.
        path: PathBuf,
        /// The underlying image processing error.
        #[source]
        source: image::ImageError,
    },

    /// Error when encoding an in-memory image fails.
    #[error("Failed to encode image: {source}")]
    ImageEncode {
        /// The underlying image processing error.
        #[source]
        source: image::ImageError,
    },

    /// Filesystem error.
    #[error("I/O error at {path}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization error.
    #[error("failed to (de)serialize {what}")]
    Serialization {
        /// What was being processed.
        what: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl StrokeSegError {
    /// Wraps an I/O error together with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a serde error together with a description of the payload.
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            what: what.into(),
            source,
        }
    }
}

/// A specialized `Result` type for strokeseg operations.
pub type StrokeSegResult<T> = Result<T, StrokeSegError>;
