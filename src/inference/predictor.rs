//! Batch prediction over an inference-mode dataset and submission output.

use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{activation::softmax, backend::Backend, Tensor},
};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;
use crate::dataset::batcher::{SorghumBatch, SorghumBatcher};
use crate::dataset::manifest::{CultivarVocabulary, DatasetMode};
use crate::dataset::pipeline::{Sample, SorghumDataset};
use crate::model::classifier::SorghumClassifier;
use crate::training::checkpoint::load_checkpoint;
use crate::utils::error::{Result, SorghumError};

/// Prediction for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub filename: String,
    pub cultivar: String,
    pub class_index: usize,
    /// Softmax probability of the predicted cultivar
    pub confidence: f32,
}

/// One row of the submission file
#[derive(Debug, Serialize)]
struct SubmissionRow<'a> {
    filename: &'a str,
    cultivar: &'a str,
}

/// A trained classifier together with the vocabulary it predicts
pub struct Predictor<B: Backend> {
    model: SorghumClassifier<B>,
    vocabulary: CultivarVocabulary,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(
        model: SorghumClassifier<B>,
        vocabulary: CultivarVocabulary,
        batch_size: usize,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            vocabulary,
            batch_size: batch_size.max(1),
            device,
        }
    }

    /// Load a checkpoint directory written during training
    pub fn from_checkpoint(dir: &Path, batch_size: usize, device: B::Device) -> Result<Self> {
        let loaded = load_checkpoint::<B>(dir, &device)?;
        Ok(Self::new(loaded.model, loaded.meta.vocabulary, batch_size, device))
    }

    pub fn image_size(&self) -> usize {
        self.model.expected_input_size()
    }

    pub fn vocabulary(&self) -> &CultivarVocabulary {
        &self.vocabulary
    }

    /// `(class_index, probability)` of the top class for each image
    pub fn predict_batch(&self, images: Tensor<B, 4>) -> Result<Vec<(usize, f32)>> {
        let logits = self.model.forward(images)?;
        let [batch, classes] = logits.dims();

        let probabilities = softmax(logits, 1)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| SorghumError::Serialization(format!("{:?}", e)))?;

        Ok((0..batch)
            .map(|row| {
                let scores = &probabilities[row * classes..(row + 1) * classes];
                scores
                    .iter()
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, p)| {
                        if p > best.1 {
                            (i, p)
                        } else {
                            best
                        }
                    })
            })
            .collect())
    }

    /// Predict every sample of `dataset`, in manifest order
    pub fn predict_dataset(&self, dataset: &SorghumDataset, show_progress: bool) -> Result<Vec<Prediction>> {
        if dataset.target_size() != self.image_size() {
            return Err(SorghumError::Config(format!(
                "dataset produces {}px samples but the model expects {}px",
                dataset.target_size(),
                self.image_size()
            )));
        }

        let batcher = SorghumBatcher::new(self.image_size());
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let pb = progress(indices.len(), show_progress);
        let mut predictions = Vec::with_capacity(indices.len());

        for chunk in indices.chunks(self.batch_size) {
            let samples = chunk
                .par_iter()
                .map(|&i| dataset.get_sample(i))
                .collect::<Result<Vec<Sample>>>()?;

            let batch: SorghumBatch<B> = batcher.batch(samples, &self.device);
            for (&index, (class_index, confidence)) in
                chunk.iter().zip(self.predict_batch(batch.images)?)
            {
                let record = dataset.store().get(index)?;
                let cultivar = self.vocabulary.name(class_index).ok_or_else(|| {
                    SorghumError::Checkpoint(format!("class {} outside the vocabulary", class_index))
                })?;
                predictions.push(Prediction {
                    filename: record.file_name(),
                    cultivar: cultivar.to_string(),
                    class_index,
                    confidence,
                });
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();

        Ok(predictions)
    }
}

fn progress(total: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Write `filename,cultivar` rows
pub fn write_submission(path: &Path, predictions: &[Prediction]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    for prediction in predictions {
        writer.serialize(SubmissionRow {
            filename: &prediction.filename,
            cultivar: &prediction.cultivar,
        })?;
    }
    writer.flush()?;

    tracing::info!("Wrote {} predictions to {}", predictions.len(), path.display());
    Ok(())
}

/// Predict the test manifest with a checkpoint and write the submission file
pub fn run_test<B: Backend>(
    config: &ExperimentConfig,
    checkpoint: &Path,
    output: &Path,
    device: B::Device,
) -> Result<Vec<Prediction>> {
    let predictor = Predictor::<B>::from_checkpoint(checkpoint, config.training.batch_size, device)?;

    let evaluation = config.training_augmentation()?.evaluation_counterpart();
    let dataset = SorghumDataset::from_manifest(
        &config.dataset.test_manifest_path(),
        &config.dataset.root,
        DatasetMode::Inference,
        predictor.image_size(),
    )?
    .with_augmentation(evaluation);

    let predictions = predictor.predict_dataset(&dataset, true)?;
    write_submission(output, &predictions)?;
    Ok(predictions)
}

/// Default submission location inside the output directory
pub fn submission_path(output_dir: &Path) -> PathBuf {
    output_dir.join("submission.csv")
}
