//! # Sorghum Cultivar Classification
//!
//! Identify sorghum cultivars from leaf photographs with the Burn framework.
//!
//! ## Modules
//!
//! - `dataset`: manifest record store, tolerant image decoding, augmentation,
//!   the per-index sample pipeline and the Burn batcher
//! - `model`: interchangeable backbones (Xception, EfficientNet B0-B3,
//!   ResNeSt-50) behind one adapter, plus the classification head
//! - `training`: fine-tuning loop and checkpoint directories
//! - `inference`: checkpoint-backed prediction and submission files
//! - `config`: TOML experiment configuration
//! - `utils`: errors, logging and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sorghum_cultivar::dataset::{DatasetMode, SorghumDataset};
//! use sorghum_cultivar::model::{BackboneConfig, BackboneKind, ClassifierConfig};
//!
//! let dataset = SorghumDataset::from_manifest(
//!     "train_cultivar_mapping.csv".as_ref(),
//!     "/data/sorghum".as_ref(),
//!     DatasetMode::Training,
//!     299,
//! )?;
//! let sample = dataset.get_sample(0)?;
//!
//! let config = ClassifierConfig::new(BackboneConfig::new(BackboneKind::Xception), 100);
//! let model = config.init::<Backend>(&device)?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

pub use config::ExperimentConfig;
pub use dataset::{
    AugmentationPipeline, Cultivar, CultivarVocabulary, DatasetMode, PixelTensor, RecordStore,
    Sample, SorghumBatch, SorghumBatcher, SorghumDataset,
};
pub use inference::{Prediction, Predictor};
pub use model::{
    BackboneAdapter, BackboneConfig, BackboneKind, ClassifierConfig, FeatureExtractor,
    SorghumClassifier,
};
pub use training::{CheckpointManager, TrainingSummary};
pub use utils::error::{Result, SorghumError};
