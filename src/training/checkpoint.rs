//! Checkpoint persistence.
//!
//! A checkpoint is a directory:
//! - `classifier.json`: the [`ClassifierConfig`] needed to rebuild the model
//! - `checkpoint.json`: epoch, validation metrics, vocabulary and timestamp
//! - `model.mpk`: full-precision parameter record

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::manifest::CultivarVocabulary;
use crate::model::classifier::{ClassifierConfig, SorghumClassifier};
use crate::utils::error::{Result, SorghumError};

const CONFIG_FILE: &str = "classifier.json";
const META_FILE: &str = "checkpoint.json";
const MODEL_FILE: &str = "model";

/// Name of the checkpoint rewritten after every epoch
pub const LAST_CHECKPOINT: &str = "last";

/// Training state stored next to the parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub vocabulary: CultivarVocabulary,
    pub timestamp: String,
}

impl CheckpointMeta {
    pub fn new(epoch: usize, val_loss: f64, val_accuracy: f64, vocabulary: CultivarVocabulary) -> Self {
        Self {
            epoch,
            val_loss,
            val_accuracy,
            vocabulary,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Directory name used for ranked checkpoints
    pub fn dir_name(&self) -> String {
        format!("epoch={}-val_loss={:.2}", self.epoch, self.val_loss)
    }
}

/// A model rebuilt from disk
pub struct LoadedCheckpoint<B: Backend> {
    pub model: SorghumClassifier<B>,
    pub config: ClassifierConfig,
    pub meta: CheckpointMeta,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Write a checkpoint directory, replacing any previous content
pub fn save_checkpoint<B: Backend>(
    dir: &Path,
    model: &SorghumClassifier<B>,
    config: &ClassifierConfig,
    meta: &CheckpointMeta,
) -> Result<()> {
    fs::create_dir_all(dir)?;

    config
        .save(dir.join(CONFIG_FILE))
        .map_err(|e| SorghumError::Checkpoint(format!("failed to write config: {}", e)))?;

    let json = serde_json::to_string_pretty(meta)?;
    fs::write(dir.join(META_FILE), json)?;

    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder())
        .map_err(|e| SorghumError::Checkpoint(format!("failed to save model: {:?}", e)))?;

    Ok(())
}

/// Rebuild the model exactly as saved, including the freeze policy
pub fn load_checkpoint<B: Backend>(dir: &Path, device: &B::Device) -> Result<LoadedCheckpoint<B>> {
    if !dir.is_dir() {
        return Err(SorghumError::Checkpoint(format!(
            "{} is not a checkpoint directory",
            dir.display()
        )));
    }

    let config = ClassifierConfig::load(dir.join(CONFIG_FILE)).map_err(|e| {
        SorghumError::Checkpoint(format!("failed to read {}: {}", CONFIG_FILE, e))
    })?;

    let meta_json = fs::read_to_string(dir.join(META_FILE))?;
    let meta: CheckpointMeta = serde_json::from_str(&meta_json)?;

    if meta.vocabulary.len() != config.num_classes {
        return Err(SorghumError::Checkpoint(format!(
            "vocabulary holds {} cultivars but the head predicts {}",
            meta.vocabulary.len(),
            config.num_classes
        )));
    }

    let model = config
        .init_untrained::<B>(device)?
        .load_file(dir.join(MODEL_FILE), &recorder(), device)
        .map_err(|e| SorghumError::Checkpoint(format!("failed to load model: {:?}", e)))?
        .apply_freeze(config.backbone.freeze);

    info!(
        "Loaded checkpoint {} (epoch {}, val_loss {:.4})",
        dir.display(),
        meta.epoch,
        meta.val_loss
    );

    Ok(LoadedCheckpoint { model, config, meta })
}

/// Keeps the `last` checkpoint plus the best `keep_best` by validation loss
pub struct CheckpointManager {
    root: PathBuf,
    keep_best: usize,
    /// Sorted by ascending validation loss
    ranked: Vec<(f64, PathBuf)>,
}

impl CheckpointManager {
    pub fn new(root: PathBuf, keep_best: usize) -> Self {
        Self {
            root,
            keep_best: keep_best.max(1),
            ranked: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn last_path(&self) -> PathBuf {
        self.root.join(LAST_CHECKPOINT)
    }

    /// Lowest-loss checkpoint written so far
    pub fn best_path(&self) -> Option<&Path> {
        self.ranked.first().map(|(_, path)| path.as_path())
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.ranked.first().map(|(loss, _)| *loss)
    }

    /// Save `last`, and a ranked checkpoint when the epoch makes the top `k`.
    /// Returns the new path when it became the overall best.
    pub fn save_epoch<B: Backend>(
        &mut self,
        model: &SorghumClassifier<B>,
        config: &ClassifierConfig,
        meta: &CheckpointMeta,
    ) -> Result<Option<PathBuf>> {
        save_checkpoint(&self.last_path(), model, config, meta)?;

        let qualifies = self.ranked.len() < self.keep_best
            || self
                .ranked
                .last()
                .is_some_and(|(worst, _)| meta.val_loss < *worst);
        if !qualifies || meta.val_loss.is_nan() {
            return Ok(None);
        }

        let path = self.root.join(meta.dir_name());
        save_checkpoint(&path, model, config, meta)?;

        let position = self
            .ranked
            .partition_point(|(loss, _)| *loss <= meta.val_loss);
        self.ranked.insert(position, (meta.val_loss, path.clone()));

        while self.ranked.len() > self.keep_best {
            if let Some((_, evicted)) = self.ranked.pop() {
                if evicted != path {
                    if let Err(e) = fs::remove_dir_all(&evicted) {
                        warn!("Failed to remove checkpoint {}: {}", evicted.display(), e);
                    }
                }
            }
        }

        Ok((position == 0).then_some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::descriptor::{BackboneConfig, BackboneKind};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::tempdir;

    type TestBackend = NdArray;

    fn config() -> ClassifierConfig {
        ClassifierConfig::new(
            BackboneConfig::new(BackboneKind::EfficientnetB0)
                .with_input_size(Some(32))
                .with_freeze(true),
            3,
        )
        .with_hidden_size(Some(16))
    }

    fn vocabulary() -> CultivarVocabulary {
        CultivarVocabulary::from_names(["PI_152923", "PI_155516", "PI_329256"])
    }

    #[test]
    fn test_checkpoint_reproduces_model() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let config = config();
        let model = config.init::<TestBackend>(&device).unwrap();
        let meta = CheckpointMeta::new(4, 0.3125, 0.75, vocabulary());

        save_checkpoint(dir.path(), &model, &config, &meta).unwrap();
        assert!(dir.path().join("model.mpk").exists());
        assert!(dir.path().join("classifier.json").exists());

        let loaded = load_checkpoint::<TestBackend>(dir.path(), &device).unwrap();
        assert_eq!(loaded.meta.epoch, 4);
        assert_eq!(loaded.meta.vocabulary, vocabulary());
        assert_eq!(loaded.config.hidden_size, Some(16));
        assert!(loaded.config.backbone.freeze);
        assert_eq!(loaded.model.expected_input_size(), 32);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);
        let expected = model.forward(input.clone()).unwrap();
        let actual = loaded.model.forward(input).unwrap();
        expected.into_data().assert_approx_eq(&actual.into_data(), burn::tensor::Tolerance::<f32>::absolute(1e-5));
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempdir().unwrap();
        let result = load_checkpoint::<TestBackend>(&dir.path().join("nope"), &Default::default());
        assert!(matches!(result, Err(SorghumError::Checkpoint(_))));
    }

    #[test]
    fn test_dir_name_format() {
        let meta = CheckpointMeta::new(18, 0.3149, 0.9, vocabulary());
        assert_eq!(meta.dir_name(), "epoch=18-val_loss=0.31");
    }

    #[test]
    fn test_manager_keeps_best_k() {
        let dir = tempdir().unwrap();
        let device = Default::default();
        let config = config();
        let model = config.init::<TestBackend>(&device).unwrap();
        let mut manager = CheckpointManager::new(dir.path().to_path_buf(), 2);

        let losses = [0.9, 0.5, 0.7, 0.2];
        let mut new_best = Vec::new();
        for (epoch, loss) in losses.iter().enumerate() {
            let meta = CheckpointMeta::new(epoch, *loss, 0.5, vocabulary());
            new_best.push(manager.save_epoch(&model, &config, &meta).unwrap().is_some());
        }

        assert_eq!(new_best, vec![true, true, false, true]);
        assert_eq!(manager.best_loss(), Some(0.2));
        assert!(manager.last_path().join("checkpoint.json").exists());

        assert!(dir.path().join("epoch=3-val_loss=0.20").exists());
        assert!(dir.path().join("epoch=1-val_loss=0.50").exists());
        assert!(!dir.path().join("epoch=0-val_loss=0.90").exists());
        assert!(!dir.path().join("epoch=2-val_loss=0.70").exists());
    }
}
