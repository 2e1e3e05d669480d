use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use burn::{
    prelude::*,
    tensor::{activation::sigmoid, TensorData},
};
use image::{DynamicImage, RgbImage};

use super::{
    artifact::ModelArtifact,
    backend::{BackendKind, SegmentationBackend},
    result::PredictionResult,
};
use crate::{
    data::Augmentor,
    error::{StrokeSegError, StrokeSegResult},
};

/// Serves predictions from any [`SegmentationBackend`].
///
/// The engine is `Sync`: concurrent `predict` calls preprocess and
/// postprocess in parallel while backend forwards take turns.
pub struct InferenceEngine<B: Backend> {
    backend: Mutex<Box<dyn SegmentationBackend<B>>>,
    kind: BackendKind,
    max_batch_size: Option<usize>,
    augmentor: Augmentor,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    pub fn new(backend: Box<dyn SegmentationBackend<B>>, device: B::Device) -> Self {
        let augmentor = Augmentor::for_eval_at(backend.input_size(), backend.preprocess().clone());
        Self {
            kind: backend.kind(),
            max_batch_size: backend.max_batch_size(),
            backend: Mutex::new(backend),
            augmentor,
            device,
        }
    }

    /// Loads `artifact` and wraps it.
    ///
    /// # Errors
    ///
    /// See [`ModelArtifact::load`].
    pub fn load(artifact: &ModelArtifact, device: B::Device) -> StrokeSegResult<Self> {
        let backend = artifact.load::<B>(&device)?;
        Ok(Self::new(backend, device))
    }

    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    pub const fn input_size(&self) -> [usize; 2] {
        self.augmentor.output_size()
    }

    /// The image resized as the backend sees it.
    pub fn resized_input(&self, image: &DynamicImage) -> RgbImage {
        self.augmentor.resized_rgb(image)
    }

    /// Segments one image.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidThreshold)` for a threshold outside
    /// `[0, 1]`, or the backend's error.
    pub fn predict(&self, image: &DynamicImage, threshold: f32) -> StrokeSegResult<PredictionResult> {
        check_threshold(threshold)?;
        let mut results = self.forward(std::slice::from_ref(image), threshold)?;
        results.pop().ok_or_else(|| StrokeSegError::InvalidConfiguration {
            reason: "backend returned no prediction".into(),
        })
    }

    /// Reads and segments one image file.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::Image)` for unreadable files, plus the
    /// errors of [`InferenceEngine::predict`].
    pub fn predict_path(&self, path: &Path, threshold: f32) -> StrokeSegResult<PredictionResult> {
        let image = image::open(path).map_err(|source| StrokeSegError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        self.predict(&image, threshold)
    }

    /// Segments several images, in one forward pass when the backend accepts
    /// the batch and one image at a time otherwise.
    ///
    /// # Errors
    ///
    /// As [`InferenceEngine::predict`].
    pub fn predict_batch(
        &self,
        images: &[DynamicImage],
        threshold: f32,
    ) -> StrokeSegResult<Vec<PredictionResult>> {
        check_threshold(threshold)?;
        if images.is_empty() {
            return Ok(Vec::new());
        }

        match self.max_batch_size {
            Some(max) if images.len() > max => {
                let refusal = StrokeSegError::UnsupportedBackendOperation {
                    backend: self.kind.to_string(),
                    operation: "predict_batch".into(),
                    requested_batch: images.len(),
                    max_batch: max,
                };
                tracing::warn!(error = %refusal, "falling back to sequential prediction");

                images
                    .iter()
                    .map(|image| self.predict(image, threshold))
                    .collect()
            }
            _ => self.forward(images, threshold),
        }
    }

    fn forward(
        &self,
        images: &[DynamicImage],
        threshold: f32,
    ) -> StrokeSegResult<Vec<PredictionResult>> {
        let [height, width] = self.augmentor.output_size();
        let data: Vec<f32> = images
            .iter()
            .flat_map(|image| self.augmentor.preprocess_image(image))
            .collect();
        let input = Tensor::<B, 4>::from_data(
            TensorData::new(data, [images.len(), 3, height, width]),
            &self.device,
        );

        let logits = {
            let backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
            backend.logits(input)?
        };
        let probabilities: Vec<f32> = sigmoid(logits).into_data().iter::<f32>().collect();

        Ok(probabilities
            .chunks_exact(height * width)
            .map(|p| PredictionResult::from_probabilities(p.to_vec(), height, width, threshold, self.kind))
            .collect())
    }
}

fn check_threshold(threshold: f32) -> StrokeSegResult<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(StrokeSegError::InvalidThreshold { threshold })
    }
}
