//! Supervised fine-tuning loop.
//!
//! A plain epoch loop over Burn primitives: shuffled indices, on-demand
//! batches fetched in parallel, Adam with weight decay, validation on the
//! inner backend and ranked checkpoints.

use std::path::{Path, PathBuf};

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor},
};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::{ExperimentConfig, TrainingSection};
use crate::dataset::augmentation::AugmentationPipeline;
use crate::dataset::batcher::{SorghumBatch, SorghumBatcher};
use crate::dataset::manifest::{DatasetMode, RecordStore};
use crate::dataset::pipeline::{Sample, SorghumDataset};
use crate::dataset::split::train_val_split;
use crate::model::classifier::{ClassifierConfig, SorghumClassifier};
use crate::training::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::utils::error::{Result, SorghumError};
use crate::utils::TrainingLogger;

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub best_val_loss: f64,
    pub best_checkpoint: Option<PathBuf>,
    pub last_checkpoint: PathBuf,
}

/// Loss and accuracy over one pass
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Default)]
struct Accumulator {
    loss_sum: f64,
    batches: usize,
    correct: usize,
    seen: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f64, correct: usize, seen: usize) {
        self.loss_sum += loss;
        self.batches += 1;
        self.correct += correct;
        self.seen += seen;
    }

    fn finish(&self) -> Option<EpochMetrics> {
        (self.batches > 0).then(|| EpochMetrics {
            loss: self.loss_sum / self.batches as f64,
            accuracy: self.correct as f64 / self.seen.max(1) as f64,
        })
    }
}

/// Train from an experiment configuration: split the training manifest,
/// build the classifier and run [`fit`]
pub fn run_training<B: AutodiffBackend>(
    config: &ExperimentConfig,
    device: &B::Device,
) -> Result<TrainingSummary> {
    println!("{}", "Loading manifest...".cyan());
    let store = RecordStore::from_manifest(
        &config.dataset.train_manifest_path(),
        &config.dataset.root,
        DatasetMode::Training,
    )?;
    if store.is_empty() {
        return Err(SorghumError::Manifest("training manifest has no rows".into()));
    }

    let (train, val) = train_val_split(&store, config.dataset.val_fraction, config.dataset.seed)?;
    println!("  Training samples:   {}", train.len());
    println!("  Validation samples: {}", val.len());
    println!("  Cultivars:          {}", store.vocabulary().len());

    let classifier = config.model.classifier_config(store.vocabulary().len());
    let augmentation = config.training_augmentation()?;

    fit::<B>(
        train,
        val,
        &classifier,
        augmentation,
        &config.training,
        &config.checkpoint_dir,
        device,
    )
}

/// Fine-tune a classifier on `train`, validating on `val` after every epoch
pub fn fit<B: AutodiffBackend>(
    train: RecordStore,
    val: RecordStore,
    classifier: &ClassifierConfig,
    augmentation: AugmentationPipeline,
    training: &TrainingSection,
    checkpoint_dir: &Path,
    device: &B::Device,
) -> Result<TrainingSummary> {
    training.validate()?;
    let vocabulary = train.vocabulary().as_ref().clone();

    let mut model = classifier.init::<B>(device)?;
    let image_size = model.expected_input_size();

    let eval_augmentation = augmentation.evaluation_counterpart();
    let train_dataset = SorghumDataset::new(train, image_size).with_augmentation(augmentation);
    let val_dataset = SorghumDataset::new(val, image_size)
        .with_augmentation(eval_augmentation)
        .with_seed(training.seed);

    let batcher = SorghumBatcher::new(image_size);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(training.num_workers.max(1))
        .build()
        .map_err(|e| SorghumError::Config(format!("failed to start loader threads: {}", e)))?;

    let mut optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(training.weight_decay as f32)))
        .init();

    let mut manager = CheckpointManager::new(checkpoint_dir.to_path_buf(), training.keep_best);
    let mut logger = TrainingLogger::new(training.epochs);
    let mut epoch_rng = ChaCha8Rng::seed_from_u64(training.seed);

    println!();
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Image size:    {}", image_size);
    println!("  Epochs:        {}", training.epochs);
    println!("  Batch size:    {}", training.batch_size);
    println!("  Learning rate: {}", training.learning_rate);
    println!("  Workers:       {}", training.num_workers.max(1));
    println!();

    for epoch in 0..training.epochs {
        logger.start_epoch(epoch);
        println!("{}", format!("Epoch {}/{}", epoch + 1, training.epochs).yellow().bold());

        let mut indices: Vec<usize> = (0..train_dataset.len()).collect();
        indices.shuffle(&mut epoch_rng);
        let num_batches = indices.len().div_ceil(training.batch_size);
        let pb = batch_progress(num_batches);

        let mut running = Accumulator::default();
        for chunk in indices.chunks(training.batch_size) {
            let seeds: Vec<u64> = chunk.iter().map(|_| epoch_rng.gen()).collect();
            let items = fetch_augmented(&pool, &train_dataset, chunk, &seeds)?;

            let batch: SorghumBatch<B> = batcher.batch(items, device);
            let targets = labeled_targets(batch.targets)?;
            let seen = targets.dims()[0];

            let logits = model.forward(batch.images)?;
            let correct = count_correct(logits.clone(), targets.clone());
            let loss = CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits, targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(training.learning_rate, model, grads);

            running.add(loss_value, correct, seen);
            pb.set_message(format!("loss {:.4}", loss_value));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let train_metrics = running.finish().unwrap_or_default();
        let val_metrics = match evaluate(
            &model.valid(),
            &val_dataset,
            &batcher,
            training.batch_size,
            &pool,
            device,
        )? {
            Some(metrics) => metrics,
            None => {
                tracing::warn!("Validation set is empty, ranking checkpoints by training loss");
                train_metrics
            }
        };

        logger.end_epoch(train_metrics.loss, val_metrics.loss, val_metrics.accuracy);
        println!(
            "  {} Train loss: {:.4} | Train acc: {:.2}% | Val loss: {:.4} | Val acc: {:.2}%",
            "→".cyan(),
            train_metrics.loss,
            train_metrics.accuracy * 100.0,
            val_metrics.loss,
            val_metrics.accuracy * 100.0,
        );

        let meta = CheckpointMeta::new(epoch, val_metrics.loss, val_metrics.accuracy, vocabulary.clone());
        if let Some(path) = manager.save_epoch(&model, classifier, &meta)? {
            logger.log_new_best(val_metrics.loss, &path);
            println!("  {} {}", "New best:".green(), path.display());
        }
        println!();
    }

    let best_val_loss = manager.best_loss().unwrap_or(f64::NAN);
    logger.log_complete(best_val_loss);

    Ok(TrainingSummary {
        epochs: training.epochs,
        best_val_loss,
        best_checkpoint: manager.best_path().map(Path::to_path_buf),
        last_checkpoint: manager.last_path(),
    })
}

/// Validation loss and accuracy, `None` for an empty dataset
pub fn evaluate<B: Backend>(
    model: &SorghumClassifier<B>,
    dataset: &SorghumDataset,
    batcher: &SorghumBatcher,
    batch_size: usize,
    pool: &ThreadPool,
    device: &B::Device,
) -> Result<Option<EpochMetrics>> {
    let mut totals = Accumulator::default();
    let indices: Vec<usize> = (0..dataset.len()).collect();

    for chunk in indices.chunks(batch_size.max(1)) {
        let items = pool.install(|| {
            chunk
                .par_iter()
                .map(|&i| dataset.get_sample(i))
                .collect::<Result<Vec<Sample>>>()
        })?;

        let batch: SorghumBatch<B> = batcher.batch(items, device);
        let targets = labeled_targets(batch.targets)?;
        let seen = targets.dims()[0];

        let logits = model.forward(batch.images)?;
        let correct = count_correct(logits.clone(), targets.clone());
        let loss: f64 = CrossEntropyLossConfig::new()
            .init(device)
            .forward(logits, targets)
            .into_scalar()
            .elem();

        totals.add(loss, correct, seen);
    }

    Ok(totals.finish())
}

/// Fetch samples in parallel, each with its own seeded augmentation RNG.
/// The first load error aborts the batch.
fn fetch_augmented(
    pool: &ThreadPool,
    dataset: &SorghumDataset,
    indices: &[usize],
    seeds: &[u64],
) -> Result<Vec<Sample>> {
    pool.install(|| {
        indices
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                dataset.get_sample_with_rng(index, &mut rng)
            })
            .collect()
    })
}

fn labeled_targets<B: Backend>(targets: Option<Tensor<B, 1, Int>>) -> Result<Tensor<B, 1, Int>> {
    targets.ok_or_else(|| SorghumError::Manifest("batch contains unlabeled samples".into()))
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch, _] = logits.dims();
    let correct: i64 = logits
        .argmax(1)
        .reshape([batch])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

fn batch_progress(num_batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(num_batches as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::{Step, Transform};
    use crate::model::descriptor::{BackboneConfig, BackboneKind};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::fs;
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray>;

    fn write_dataset(root: &Path) -> RecordStore {
        let images = root.join("train_images");
        fs::create_dir_all(&images).unwrap();

        let mut manifest = String::from("image,cultivar\n");
        for i in 0..6u8 {
            let name = format!("{}.png", i);
            let shade = i * 40;
            RgbImage::from_pixel(40, 40, Rgb([shade, 255 - shade, 128]))
                .save(images.join(&name))
                .unwrap();
            manifest.push_str(&format!("{},PI_{}\n", name, i % 2));
        }

        RecordStore::from_reader(manifest.as_bytes(), root, DatasetMode::Training).unwrap()
    }

    fn small_classifier() -> ClassifierConfig {
        ClassifierConfig::new(
            BackboneConfig::new(BackboneKind::EfficientnetB0).with_input_size(Some(32)),
            2,
        )
    }

    fn training(epochs: usize) -> TrainingSection {
        TrainingSection {
            epochs,
            batch_size: 2,
            num_workers: 2,
            ..TrainingSection::default()
        }
    }

    #[test]
    fn test_fit_writes_checkpoints() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        let (train, val) = train_val_split(&store, 0.34, 1).unwrap();
        let checkpoints = dir.path().join("checkpoints");

        let augmentation = AugmentationPipeline::new(vec![
            Step::with_p(Transform::HorizontalFlip, 0.5),
            Step::always(Transform::Normalize {
                mean: [0.5; 3],
                std: [0.5; 3],
                max_pixel_value: 255.0,
            }),
        ])
        .unwrap();

        let summary = fit::<TestBackend>(
            train,
            val,
            &small_classifier(),
            augmentation,
            &training(2),
            &checkpoints,
            &Default::default(),
        )
        .unwrap();

        assert_eq!(summary.epochs, 2);
        assert!(summary.best_val_loss.is_finite());
        assert!(summary.last_checkpoint.join("model.mpk").exists());
        let best = summary.best_checkpoint.unwrap();
        assert!(best.join("checkpoint.json").exists());
        assert!(best
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("epoch="));
    }

    #[test]
    fn test_fit_without_validation_set() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        let (train, val) = train_val_split(&store, 0.0, 1).unwrap();
        assert!(val.is_empty());

        let summary = fit::<TestBackend>(
            train,
            val,
            &small_classifier(),
            AugmentationPipeline::default(),
            &training(1),
            &dir.path().join("checkpoints"),
            &Default::default(),
        )
        .unwrap();
        assert!(summary.best_checkpoint.is_some());
    }

    #[test]
    fn test_evaluate_counts_every_sample() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        let device = Default::default();

        let model = small_classifier().init::<NdArray>(&device).unwrap();
        let dataset = SorghumDataset::new(store, 32);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        let metrics = evaluate(&model, &dataset, &SorghumBatcher::new(32), 4, &pool, &device)
            .unwrap()
            .unwrap();
        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));

        let empty = SorghumDataset::new(dataset.store().select(&[]).unwrap(), 32);
        assert!(evaluate(&model, &empty, &SorghumBatcher::new(32), 4, &pool, &device)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unreadable_image_fails_evaluation() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        fs::write(dir.path().join("train_images/3.png"), b"not an image").unwrap();
        let device = Default::default();

        let model = small_classifier().init::<NdArray>(&device).unwrap();
        let dataset = SorghumDataset::new(store, 32);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        let err = evaluate(&model, &dataset, &SorghumBatcher::new(32), 4, &pool, &device)
            .unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_unreadable_image_fails_training() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        fs::write(dir.path().join("train_images/0.png"), b"not an image").unwrap();
        let (train, val) = train_val_split(&store, 0.0, 1).unwrap();

        let err = fit::<TestBackend>(
            train,
            val,
            &small_classifier(),
            AugmentationPipeline::default(),
            &training(1),
            &dir.path().join("checkpoints"),
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SorghumError::Decode { .. }));
    }

    #[test]
    fn test_invalid_training_section() {
        let dir = tempdir().unwrap();
        let store = write_dataset(dir.path());
        let (train, val) = train_val_split(&store, 0.5, 1).unwrap();

        let result = fit::<TestBackend>(
            train,
            val,
            &small_classifier(),
            AugmentationPipeline::default(),
            &TrainingSection {
                batch_size: 0,
                ..TrainingSection::default()
            },
            &dir.path().join("checkpoints"),
            &Default::default(),
        );
        assert!(matches!(result, Err(SorghumError::Config(_))));
    }
}
