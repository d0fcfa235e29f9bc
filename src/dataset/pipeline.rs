//! Sample pipeline: record -> decoded image -> resized -> augmented -> `(C, W, H)` tensor.
//!
//! Nothing is cached. Every call decodes from disk and owns its RNG, so a
//! `SorghumDataset` can be shared across worker threads without locks.

use std::path::Path;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use image::{Rgb, Rgb32FImage, RgbImage};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::dataset::augmentation::AugmentationPipeline;
use crate::dataset::decode::{load_rgb, resize_square};
use crate::dataset::manifest::{Cultivar, CultivarVocabulary, DatasetMode, RecordStore};
use crate::dataset::tensor::PixelTensor;
use crate::utils::error::{Result, SorghumError};

/// Golden-ratio increment used to spread per-index seeds
const SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// One materialized example
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Labeled(PixelTensor, Cultivar),
    Unlabeled(PixelTensor),
}

impl Sample {
    pub fn tensor(&self) -> &PixelTensor {
        match self {
            Sample::Labeled(tensor, _) | Sample::Unlabeled(tensor) => tensor,
        }
    }

    pub fn cultivar(&self) -> Option<&Cultivar> {
        match self {
            Sample::Labeled(_, cultivar) => Some(cultivar),
            Sample::Unlabeled(_) => None,
        }
    }

    pub fn into_parts(self) -> (PixelTensor, Option<Cultivar>) {
        match self {
            Sample::Labeled(tensor, cultivar) => (tensor, Some(cultivar)),
            Sample::Unlabeled(tensor) => (tensor, None),
        }
    }
}

/// Lazily decoding dataset over a record store
#[derive(Debug, Clone)]
pub struct SorghumDataset {
    store: Arc<RecordStore>,
    target_size: usize,
    augmentation: Option<Arc<AugmentationPipeline>>,
    seed: Option<u64>,
}

impl SorghumDataset {
    /// Dataset producing `target_size x target_size` samples without augmentation
    pub fn new(store: RecordStore, target_size: usize) -> Self {
        Self {
            store: Arc::new(store),
            target_size,
            augmentation: None,
            seed: None,
        }
    }

    /// Load the manifest and build a dataset over it
    pub fn from_manifest(
        manifest: &Path,
        root: &Path,
        mode: DatasetMode,
        target_size: usize,
    ) -> Result<Self> {
        let store = RecordStore::from_manifest(manifest, root, mode)?;
        Ok(Self::new(store, target_size))
    }

    pub fn with_augmentation(mut self, pipeline: AugmentationPipeline) -> Self {
        self.augmentation = Some(Arc::new(pipeline));
        self
    }

    /// Make augmentation reproducible per `(seed, index)`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn vocabulary(&self) -> &Arc<CultivarVocabulary> {
        self.store.vocabulary()
    }

    pub fn augmentation(&self) -> Option<&AugmentationPipeline> {
        self.augmentation.as_deref()
    }

    fn sample_rng(&self, index: usize) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => {
                ChaCha8Rng::seed_from_u64(seed ^ (index as u64).wrapping_mul(SEED_MIX))
            }
            None => ChaCha8Rng::from_entropy(),
        }
    }

    /// Materialize the sample at `index`
    pub fn get_sample(&self, index: usize) -> Result<Sample> {
        let mut rng = self.sample_rng(index);
        self.get_sample_with_rng(index, &mut rng)
    }

    /// Materialize the sample at `index`, drawing augmentation randomness from `rng`
    pub fn get_sample_with_rng<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let record = self.store.get(index)?;

        let rgb = load_rgb(&record.image_path)?;
        let rgb = resize_square(rgb, self.target_size as u32);

        let mut img = to_float_image(&rgb);
        if let Some(pipeline) = &self.augmentation {
            img = pipeline.apply(img, rng);
        }

        let tensor = PixelTensor::from_image(&img);

        match (self.store.mode(), record.cultivar.as_deref()) {
            (DatasetMode::Inference, _) => Ok(Sample::Unlabeled(tensor)),
            (DatasetMode::Training, Some(name)) => {
                let cultivar = self.vocabulary().cultivar(name).ok_or_else(|| {
                    SorghumError::Manifest(format!("cultivar '{}' not in vocabulary", name))
                })?;
                Ok(Sample::Labeled(tensor, cultivar))
            }
            (DatasetMode::Training, None) => Err(SorghumError::Manifest(format!(
                "record {} has no cultivar",
                index
            ))),
        }
    }
}

/// 8-bit RGB -> float RGB keeping the 0-255 range
fn to_float_image(rgb: &RgbImage) -> Rgb32FImage {
    let (width, height) = rgb.dimensions();
    Rgb32FImage::from_fn(width, height, |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        Rgb([r as f32, g as f32, b as f32])
    })
}

impl Dataset<Sample> for SorghumDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        match self.get_sample(index) {
            Ok(sample) => Some(sample),
            Err(SorghumError::RecordNotFound { .. }) => None,
            Err(e) => {
                tracing::error!("Failed to load sample {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.store.len()
    }
}
