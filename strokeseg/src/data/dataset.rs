//! Stroke CT dataset discovery, splitting and loading.
//!
//! Two on-disk layouts are recognised:
//!
//! - `<root>/{Bleeding,Ischemia,Normal}/PNG/*.png` with red-annotated copies
//!   in `<root>/<class>/OVERLAY/<same file name>`;
//! - `<root>/stroke_{cropped,noncropped}/{CROPPED/TRAIN_CROP,…}/<class>/*`
//!   with overlays in `<split dir>/OVERLAY/<class>/<stem>.{png,jpg,jpeg}`.
//!
//! Slices without an overlay get an empty mask.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use burn::data::dataset::Dataset;
use image::{DynamicImage, GrayImage};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use walkdir::WalkDir;

use super::{
    augmentation::{Augmentor, TransformMode},
    batcher::StrokeItem,
    mask::{empty_mask, load_overlay_mask},
};
use crate::error::{StrokeSegError, StrokeSegResult};

const FLAT_LAYOUT_CLASSES: [&str; 3] = ["Bleeding", "Ischemia", "Normal"];
const NESTED_LAYOUT_ROOTS: [&str; 2] = ["stroke_cropped", "stroke_noncropped"];
const NESTED_LAYOUT_SPLITS: [&str; 4] = [
    "CROPPED/TRAIN_CROP",
    "CROPPED/TEST_CROP",
    "NON_CROPPED/TRAIN",
    "NON_CROPPED/TEST",
];
const NESTED_LAYOUT_CLASSES: [&str; 5] = ["STROKE", "NORMAL", "Bleeding", "Ischemia", "Normal"];
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Where a sample's pixels come from.
#[derive(Debug, Clone)]
pub enum SampleSource {
    /// CT slice on disk plus an optional red-annotated overlay.
    File {
        image: PathBuf,
        overlay: Option<PathBuf>,
    },
    /// Already decoded image and binary mask.
    Memory { image: DynamicImage, mask: GrayImage },
}

/// One dataset entry.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub source: SampleSource,
}

impl Sample {
    /// Decodes the image and its mask.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::Image)` if a file cannot be decoded.
    pub fn load(&self) -> StrokeSegResult<(DynamicImage, GrayImage)> {
        match &self.source {
            SampleSource::Memory { image, mask } => Ok((image.clone(), mask.clone())),
            SampleSource::File { image, overlay } => {
                let decoded = image::open(image).map_err(|source| StrokeSegError::Image {
                    path: image.clone(),
                    source,
                })?;
                let mask = match overlay {
                    Some(path) => load_overlay_mask(path)?,
                    None => empty_mask(decoded.width(), decoded.height()),
                };
                Ok((decoded, mask))
            }
        }
    }

    /// Decodes the image and its mask and checks that they agree in size.
    ///
    /// A valid header is not enough: truncated or corrupt pixel data only
    /// shows up when the file is decoded.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::DataShapeMismatch)` on disagreement, or
    /// `Err(StrokeSegError::Image)` if a file cannot be decoded.
    pub fn verify(&self) -> StrokeSegResult<()> {
        let (image, mask) = self.load()?;
        let image = (image.width(), image.height());
        let mask = mask.dimensions();

        if image != mask {
            return Err(StrokeSegError::DataShapeMismatch {
                id: self.id.clone(),
                image,
                mask,
            });
        }
        Ok(())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Image files directly inside `dir`, sorted by name.
fn list_images(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.into_path()),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect()
}

fn sample_id(root: &Path, image: &Path) -> String {
    image
        .strip_prefix(root)
        .unwrap_or(image)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Scans a dataset root for image/overlay pairs.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::Io)` if `root` does not exist, and
/// `Err(StrokeSegError::InvalidConfiguration)` if no images are found.
pub fn scan_dataset(root: &Path) -> StrokeSegResult<Vec<Sample>> {
    if !root.is_dir() {
        return Err(StrokeSegError::io(
            root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "dataset root not found"),
        ));
    }

    let nested = NESTED_LAYOUT_ROOTS
        .iter()
        .map(|name| root.join(name))
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();

    let samples = if nested.is_empty() {
        scan_flat_layout(root)
    } else {
        nested
            .iter()
            .flat_map(|base| scan_nested_layout(root, base))
            .collect()
    };

    if samples.is_empty() {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: format!(
                "no images found under {}; expected stroke_cropped/, stroke_noncropped/ or Bleeding|Ischemia|Normal/PNG",
                root.display()
            ),
        });
    }

    let annotated = samples
        .iter()
        .filter(|s| matches!(&s.source, SampleSource::File { overlay: Some(_), .. }))
        .count();
    tracing::info!(
        root = %root.display(),
        samples = samples.len(),
        annotated,
        "dataset scanned"
    );

    Ok(samples)
}

fn scan_flat_layout(root: &Path) -> Vec<Sample> {
    let mut samples = Vec::new();
    for class in FLAT_LAYOUT_CLASSES {
        let png_dir = root.join(class).join("PNG");
        if !png_dir.is_dir() {
            continue;
        }
        let overlay_dir = root.join(class).join("OVERLAY");

        for image in list_images(&png_dir) {
            let overlay = image
                .file_name()
                .map(|name| overlay_dir.join(name))
                .filter(|path| path.is_file());
            samples.push(Sample {
                id: sample_id(root, &image),
                source: SampleSource::File { image, overlay },
            });
        }
    }
    samples
}

fn scan_nested_layout(root: &Path, base: &Path) -> Vec<Sample> {
    let mut samples = Vec::new();
    for split in NESTED_LAYOUT_SPLITS {
        let split_dir = base.join(split);
        if !split_dir.is_dir() {
            tracing::debug!(dir = %split_dir.display(), "split directory absent");
            continue;
        }

        for class in NESTED_LAYOUT_CLASSES {
            let class_dir = split_dir.join(class);
            if !class_dir.is_dir() {
                continue;
            }
            let overlay_dir = split_dir.join("OVERLAY").join(class);

            for image in list_images(&class_dir) {
                let overlay = image.file_stem().and_then(|stem| {
                    let stem = stem.to_string_lossy();
                    IMAGE_EXTENSIONS
                        .iter()
                        .map(|ext| overlay_dir.join(format!("{stem}.{ext}")))
                        .find(|path| path.is_file())
                });
                samples.push(Sample {
                    id: sample_id(root, &image),
                    source: SampleSource::File { image, overlay },
                });
            }
        }
    }
    samples
}

/// Shuffles with a fixed seed and holds out `ceil(len * test_size)` samples.
///
/// Both halves are non-empty whenever at least two samples are given.
///
/// # Errors
///
/// Returns `Err(StrokeSegError::InvalidConfiguration)` if `test_size` is not in `(0, 1)`.
pub fn split_samples(
    mut samples: Vec<Sample>,
    test_size: f64,
    random_state: u64,
) -> StrokeSegResult<(Vec<Sample>, Vec<Sample>)> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(StrokeSegError::InvalidConfiguration {
            reason: format!("test_size must lie in (0, 1), got {test_size}"),
        });
    }

    let mut rng = StdRng::seed_from_u64(random_state);
    samples.shuffle(&mut rng);

    let len = samples.len();
    let held_out = ((len as f64 * test_size).ceil() as usize).clamp(
        usize::from(len > 1),
        len.saturating_sub(1).max(usize::from(len == 1)),
    );
    let validation = samples.split_off(len - held_out);

    Ok((samples, validation))
}

/// Burn dataset over stroke samples.
///
/// Samples that fail to decode, or whose image and mask sizes disagree, are
/// dropped at construction and logged. Burn's loaders stop an epoch at the
/// first `None`, so `get` only sees samples that are known to load. In training mode, each item is augmented with a seed derived
/// from the dataset seed, the current epoch and the item index, so a run is
/// reproducible as long as the loader visits items in a fixed order.
pub struct StrokeDataset {
    samples: Vec<Sample>,
    augmentor: Augmentor,
    mode: TransformMode,
    seed: u64,
    epoch: Arc<AtomicUsize>,
}

impl StrokeDataset {
    pub fn new(samples: Vec<Sample>, augmentor: Augmentor, mode: TransformMode, seed: u64) -> Self {
        let total = samples.len();
        let samples: Vec<Sample> = samples
            .into_iter()
            .filter(|sample| match sample.verify() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(id = %sample.id, error = %e, "skipping sample");
                    false
                }
            })
            .collect();

        if samples.len() != total {
            tracing::warn!(
                kept = samples.len(),
                skipped = total - samples.len(),
                "dropped malformed samples"
            );
        }

        Self {
            samples,
            augmentor,
            mode,
            seed,
            epoch: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter the training loop advances before each epoch.
    pub fn epoch_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.epoch)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn item_seed(&self, index: usize) -> u64 {
        let epoch = self.epoch.load(Ordering::Relaxed) as u64;
        self.seed
            .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(index as u64)
    }

    fn load_item(&self, index: usize, sample: &Sample) -> StrokeSegResult<StrokeItem> {
        let (image, mask) = sample.load()?;
        let transformed = self.augmentor.transform(
            &sample.id,
            &image,
            &mask,
            self.mode,
            Some(self.item_seed(index)),
        )?;

        Ok(StrokeItem {
            id: sample.id.clone(),
            image: transformed.image,
            mask: transformed.mask,
            height: transformed.height,
            width: transformed.width,
        })
    }
}

impl Dataset<StrokeItem> for StrokeDataset {
    fn get(&self, index: usize) -> Option<StrokeItem> {
        let sample = self.samples.get(index)?;
        match self.load_item(index, sample) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::error!(id = %sample.id, error = %e, "failed to load sample");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{Luma, Rgb, RgbImage};

    use super::*;
    use crate::{
        config::{ModelConfig, PreprocessConfig},
        data::augmentation::AugmentationConfig,
    };

    fn memory_sample(id: &str, width: u32, mask_width: u32) -> Sample {
        Sample {
            id: id.to_string(),
            source: SampleSource::Memory {
                image: DynamicImage::ImageRgb8(RgbImage::new(width, 32)),
                mask: GrayImage::new(mask_width, 32),
            },
        }
    }

    fn augmentor() -> Augmentor {
        let model = ModelConfig::new().with_image_height(32).with_image_width(32);
        Augmentor::new(&model, PreprocessConfig::new(), AugmentationConfig::new())
    }

    #[test]
    fn mismatched_samples_are_skipped() {
        let samples = vec![
            memory_sample("ok", 32, 32),
            memory_sample("bad", 32, 16),
            memory_sample("ok2", 48, 48),
        ];
        let dataset = StrokeDataset::new(samples, augmentor(), TransformMode::Eval, 0);

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).map(|item| item.id), Some("ok2".to_string()));
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn truncated_file_is_dropped_and_loader_sees_every_good_sample() {
        use burn::data::dataloader::DataLoaderBuilder;

        use crate::{data::batcher::StrokeBatcher, test_utils::TestBackend};

        let root = tempfile::tempdir().unwrap();
        let gradient = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 7 + y * 13) as u8, (x * y) as u8, (x ^ y) as u8])
        });

        let broken = root.path().join("broken.png");
        gradient.save(&broken).unwrap();
        let bytes = fs::read(&broken).unwrap();
        fs::write(&broken, &bytes[..bytes.len() / 2]).unwrap();
        assert_eq!(image::image_dimensions(&broken).unwrap(), (64, 64));

        let mut samples = Vec::new();
        for i in 0..5 {
            let path = root.path().join(format!("good{i}.png"));
            gradient.save(&path).unwrap();
            samples.push(Sample {
                id: format!("good{i}"),
                source: SampleSource::File {
                    image: path,
                    overlay: None,
                },
            });
        }
        samples.insert(
            2,
            Sample {
                id: "broken".into(),
                source: SampleSource::File {
                    image: broken,
                    overlay: None,
                },
            },
        );

        let dataset = StrokeDataset::new(samples, augmentor(), TransformMode::Eval, 0);
        assert_eq!(dataset.len(), 5);
        assert!((0..5).all(|i| dataset.get(i).is_some()));

        let loader = DataLoaderBuilder::new(StrokeBatcher::<TestBackend>::new())
            .batch_size(2)
            .build(dataset);
        let ids: Vec<String> = loader.iter().flat_map(|batch| batch.ids).collect();
        assert_eq!(ids, ["good0", "good1", "good2", "good3", "good4"]);
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let samples: Vec<_> = (0..20)
            .map(|i| memory_sample(&format!("s{i}"), 32, 32))
            .collect();

        let (train_a, val_a) = split_samples(samples.clone(), 0.15, 42).unwrap();
        let (train_b, val_b) = split_samples(samples, 0.15, 42).unwrap();

        assert_eq!(val_a.len(), 3);
        assert_eq!(train_a.len(), 17);
        let ids = |s: &[Sample]| s.iter().map(|x| x.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&val_a), ids(&val_b));
        assert_eq!(ids(&train_a), ids(&train_b));
        assert!(ids(&val_a).iter().all(|id| !ids(&train_a).contains(id)));
    }

    #[test]
    fn split_keeps_both_halves_non_empty() {
        let samples = vec![memory_sample("a", 32, 32), memory_sample("b", 32, 32)];
        let (train, val) = split_samples(samples, 0.9, 1).unwrap();
        assert_eq!((train.len(), val.len()), (1, 1));

        assert!(split_samples(Vec::new(), 1.5, 1).is_err());
    }

    #[test]
    fn training_items_change_with_epoch() {
        let mut image = RgbImage::new(32, 32);
        image.put_pixel(0, 0, Rgb([255, 255, 255]));
        let mut mask = GrayImage::new(32, 32);
        mask.put_pixel(0, 0, Luma([255]));
        let sample = Sample {
            id: "edge".into(),
            source: SampleSource::Memory {
                image: DynamicImage::ImageRgb8(image),
                mask,
            },
        };
        let model = ModelConfig::new().with_image_height(32).with_image_width(32);
        let augmentor = Augmentor::new(
            &model,
            PreprocessConfig::new(),
            AugmentationConfig::new().with_flip_probability(0.5),
        );
        let dataset = StrokeDataset::new(vec![sample], augmentor, TransformMode::Train, 3);

        let first = dataset.get(0).unwrap();
        assert_eq!(dataset.get(0).unwrap().mask, first.mask);

        let handle = dataset.epoch_handle();
        let differs = (1..32).any(|epoch| {
            handle.store(epoch, Ordering::Relaxed);
            dataset.get(0).unwrap().mask != first.mask
        });
        assert!(differs);
    }

    #[test]
    fn scans_flat_layout_with_overlays() {
        let root = tempfile::tempdir().unwrap();
        let png = root.path().join("Ischemia/PNG");
        let overlay = root.path().join("Ischemia/OVERLAY");
        fs::create_dir_all(&png).unwrap();
        fs::create_dir_all(&overlay).unwrap();

        let slice = RgbImage::from_pixel(16, 16, Rgb([100, 100, 100]));
        slice.save(png.join("b.png")).unwrap();
        slice.save(png.join("a.png")).unwrap();
        let mut annotated = slice.clone();
        annotated.put_pixel(4, 4, Rgb([250, 0, 0]));
        annotated.save(overlay.join("a.png")).unwrap();
        fs::write(png.join("notes.txt"), "not an image").unwrap();

        let samples = scan_dataset(root.path()).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].id, "Ischemia/PNG/a.png");
        assert!(matches!(
            &samples[0].source,
            SampleSource::File { overlay: Some(_), .. }
        ));
        assert!(matches!(
            &samples[1].source,
            SampleSource::File { overlay: None, .. }
        ));

        let (_, mask) = samples[0].load().unwrap();
        assert_eq!(mask.get_pixel(4, 4).0[0], 255);
        assert_eq!(mask.get_pixel(5, 5).0[0], 0);
    }

    #[test]
    fn scans_nested_layout() {
        let root = tempfile::tempdir().unwrap();
        let class_dir = root.path().join("stroke_cropped/CROPPED/TRAIN_CROP/STROKE");
        let overlay_dir = root.path().join("stroke_cropped/CROPPED/TRAIN_CROP/OVERLAY/STROKE");
        fs::create_dir_all(&class_dir).unwrap();
        fs::create_dir_all(&overlay_dir).unwrap();

        let slice = RgbImage::new(8, 8);
        slice.save(class_dir.join("17.png")).unwrap();
        slice.save(overlay_dir.join("17.jpg")).unwrap();

        let samples = scan_dataset(root.path()).unwrap();
        assert_eq!(samples.len(), 1);
        match &samples[0].source {
            SampleSource::File {
                overlay: Some(path),
                ..
            } => assert!(path.ends_with("OVERLAY/STROKE/17.jpg")),
            other => panic!("Expected overlay, got {other:?}"),
        }
    }

    #[test]
    fn empty_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            scan_dataset(root.path()),
            Err(StrokeSegError::InvalidConfiguration { .. })
        ));
    }
}
