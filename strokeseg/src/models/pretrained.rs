//! Loading torchvision ResNet weights into the encoder.

use std::path::Path;

use burn::prelude::*;
use resnet::ResNetEncoder;

use crate::error::{StrokeSegError, StrokeSegResult};

/// Loads a torchvision `resnet18`/`resnet34` state dict (`.pth`).
///
/// The classifier (`fc.*`) entries are ignored.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::Record)` if the file cannot be read or does not
/// match the encoder layout.
#[cfg(feature = "pretrained")]
pub fn load_torchvision_encoder<B: Backend>(
    encoder: ResNetEncoder<B>,
    path: &Path,
    device: &B::Device,
) -> StrokeSegResult<ResNetEncoder<B>> {
    use burn::record::{FullPrecisionSettings, Recorder};
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    let load_args = LoadArgs::new(path.to_path_buf())
        .with_key_remap("layer([1-4])\\.([0-9]+)\\.(.+)", "layer$1.blocks.$2.$3")
        .with_key_remap("(.+)\\.downsample\\.0\\.(.+)", "$1.downsample.conv.$2")
        .with_key_remap("(.+)\\.downsample\\.1\\.(.+)", "$1.downsample.bn.$2");

    let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .map_err(|e| StrokeSegError::Record {
            action: "load",
            path: path.to_path_buf(),
            reason: format!("PyTorch encoder loading failed: {e}"),
        })?;

    tracing::info!(path = %path.display(), "loaded pretrained encoder weights");
    Ok(encoder.load_record(record))
}

/// Without the `pretrained` feature no `.pth` reader is compiled in.
///
/// # Errors
///
/// Always returns `Err(StrokeSegError::InvalidConfiguration)`.
#[cfg(not(feature = "pretrained"))]
pub fn load_torchvision_encoder<B: Backend>(
    _encoder: ResNetEncoder<B>,
    path: &Path,
    _device: &B::Device,
) -> StrokeSegResult<ResNetEncoder<B>> {
    Err(StrokeSegError::InvalidConfiguration {
        reason: format!(
            "pretrained_weights {} requires building with the `pretrained` feature",
            path.display()
        ),
    })
}
