//! Experiment configuration loaded from TOML.
//!
//! ```toml
//! checkpoint_dir = "output/checkpoints"
//! output_dir = "output"
//!
//! [dataset]
//! root = "/data/sorghum"
//! train_manifest = "train_cultivar_mapping.csv"
//!
//! [model]
//! backbone = "efficientnet_b3"
//! hidden_size = 512
//! freeze = true
//!
//! [training]
//! epochs = 30
//! batch_size = 16
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::{AugmentationPipeline, Step};
use crate::model::classifier::ClassifierConfig;
use crate::model::descriptor::{BackboneConfig, BackboneKind, WeightsSource, MIN_INPUT_SIZE};
use crate::utils::error::{Result, SorghumError};

/// Top-level experiment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub dataset: DatasetSection,

    pub model: ModelSection,

    /// Custom training augmentation; absent means the default preset
    #[serde(default)]
    pub augmentation: Option<Vec<Step>>,

    #[serde(default)]
    pub training: TrainingSection,

    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Where the images and manifests live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSection {
    /// Directory containing `train_images/` and `test/`
    pub root: PathBuf,

    #[serde(default = "default_train_manifest")]
    pub train_manifest: PathBuf,

    #[serde(default = "default_test_manifest")]
    pub test_manifest: PathBuf,

    /// Share of the training manifest held out for validation
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,

    /// Seed for the train/validation split
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Backbone and head choice; `num_classes` comes from the vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    pub backbone: BackboneKind,

    /// Overrides the backbone's default input size
    #[serde(default)]
    pub input_size: Option<usize>,

    /// Pretrained backbone record
    #[serde(default)]
    pub weights: Option<PathBuf>,

    #[serde(default)]
    pub freeze: bool,

    #[serde(default)]
    pub hidden_size: Option<usize>,

    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

/// Optimizer and loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Parallel sample-loading threads
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Seed for shuffling and augmentation
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of best checkpoints kept on disk
    #[serde(default = "default_keep_best")]
    pub keep_best: usize,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("output/checkpoints")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_train_manifest() -> PathBuf {
    PathBuf::from("train_cultivar_mapping.csv")
}

fn default_test_manifest() -> PathBuf {
    PathBuf::from("test.csv")
}

fn default_val_fraction() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_dropout() -> f64 {
    0.5
}

fn default_epochs() -> usize {
    30
}

fn default_batch_size() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    1e-5
}

fn default_num_workers() -> usize {
    4
}

fn default_keep_best() -> usize {
    1
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            num_workers: default_num_workers(),
            seed: default_seed(),
            keep_best: default_keep_best(),
        }
    }
}

impl DatasetSection {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.val_fraction) {
            return Err(SorghumError::Config(format!(
                "dataset.val_fraction must be in [0, 1), got {}",
                self.val_fraction
            )));
        }
        Ok(())
    }

    /// Manifest paths are relative to the dataset root unless absolute
    pub fn train_manifest_path(&self) -> PathBuf {
        self.root.join(&self.train_manifest)
    }

    pub fn test_manifest_path(&self) -> PathBuf {
        self.root.join(&self.test_manifest)
    }
}

impl ModelSection {
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.input_size {
            if size < MIN_INPUT_SIZE {
                return Err(SorghumError::Config(format!(
                    "model.input_size must be at least {}, got {}",
                    MIN_INPUT_SIZE, size
                )));
            }
        }
        if let Some(hidden) = self.hidden_size {
            if hidden < 4 {
                return Err(SorghumError::Config(format!(
                    "model.hidden_size must be at least 4, got {}",
                    hidden
                )));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SorghumError::Config(format!(
                "model.dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub fn classifier_config(&self, num_classes: usize) -> ClassifierConfig {
        let weights = match &self.weights {
            Some(path) => WeightsSource::File(path.clone()),
            None => WeightsSource::None,
        };
        let backbone = BackboneConfig::new(self.backbone)
            .with_input_size(self.input_size)
            .with_weights(weights)
            .with_freeze(self.freeze);

        ClassifierConfig::new(backbone, num_classes)
            .with_hidden_size(self.hidden_size)
            .with_dropout(self.dropout)
    }
}

impl TrainingSection {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(SorghumError::Config("training.epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(SorghumError::Config("training.batch_size must be > 0".into()));
        }
        if self.learning_rate <= 0.0 {
            return Err(SorghumError::Config(
                "training.learning_rate must be > 0".into(),
            ));
        }
        if self.weight_decay < 0.0 {
            return Err(SorghumError::Config(
                "training.weight_decay must be >= 0".into(),
            ));
        }
        if self.keep_best == 0 {
            return Err(SorghumError::Config("training.keep_best must be > 0".into()));
        }
        Ok(())
    }
}

impl ExperimentConfig {
    /// Read and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SorghumError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!("Loaded experiment config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SorghumError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.model.validate()?;
        self.training.validate()?;
        self.training_augmentation()?;
        Ok(())
    }

    /// The configured training pipeline, or the default preset
    pub fn training_augmentation(&self) -> Result<AugmentationPipeline> {
        match &self.augmentation {
            Some(steps) => AugmentationPipeline::new(steps.clone()),
            None => Ok(AugmentationPipeline::training_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [dataset]
        root = "/data/sorghum"

        [model]
        backbone = "xception"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ExperimentConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.dataset.val_fraction, 0.2);
        assert_eq!(
            config.dataset.train_manifest_path(),
            PathBuf::from("/data/sorghum/train_cultivar_mapping.csv")
        );
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.checkpoint_dir, PathBuf::from("output/checkpoints"));
        assert!(config.augmentation.is_none());
        assert_eq!(
            config.training_augmentation().unwrap(),
            AugmentationPipeline::training_default()
        );
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            checkpoint_dir = "runs/ckpt"

            [dataset]
            root = "/data/sorghum"
            test_manifest = "/elsewhere/test.csv"
            val_fraction = 0.1
            seed = 7

            [model]
            backbone = "efficientnet_b3"
            input_size = 512
            weights = "weights/efficientnet_b3.mpk"
            freeze = true
            hidden_size = 256
            dropout = 0.3

            [training]
            epochs = 5
            learning_rate = 0.001

            [[augmentation]]
            step = "apply"
            p = 0.5
            transform = { kind = "horizontal_flip" }

            [[augmentation]]
            step = "apply"
            p = 1.0
            transform = { kind = "to_tensor" }
        "#;

        let config = ExperimentConfig::from_toml(toml).unwrap();
        assert_eq!(config.dataset.test_manifest_path(), PathBuf::from("/elsewhere/test.csv"));
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training_augmentation().unwrap().steps().len(), 2);

        let classifier = config.model.classifier_config(100);
        assert_eq!(classifier.num_classes, 100);
        assert_eq!(classifier.backbone.kind, BackboneKind::EfficientnetB3);
        assert_eq!(classifier.backbone.input_size, Some(512));
        assert!(classifier.backbone.freeze);
        assert_eq!(
            classifier.backbone.weights,
            WeightsSource::File(PathBuf::from("weights/efficientnet_b3.mpk"))
        );
        assert_eq!(classifier.hidden_size, Some(256));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_fraction = MINIMAL.replace("root = \"/data/sorghum\"", "root = \"/d\"\nval_fraction = 1.0");
        assert!(ExperimentConfig::from_toml(&bad_fraction).is_err());

        let bad_backbone = MINIMAL.replace("xception", "vgg16");
        assert!(ExperimentConfig::from_toml(&bad_backbone).is_err());

        let bad_size = MINIMAL.replace("backbone = \"xception\"", "backbone = \"xception\"\ninput_size = 8");
        assert!(matches!(
            ExperimentConfig::from_toml(&bad_size),
            Err(SorghumError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_augmentation_is_rejected() {
        let toml = format!(
            "{}\n[[augmentation]]\nstep = \"apply\"\np = 1.5\ntransform = {{ kind = \"vertical_flip\" }}\n",
            MINIMAL
        );
        assert!(ExperimentConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.model.backbone, BackboneKind::Xception);

        assert!(ExperimentConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
