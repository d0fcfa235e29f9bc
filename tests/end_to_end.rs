//! Manifest to logits, through the public API.

use std::fs;
use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn_ndarray::NdArray;
use image::{Rgb, RgbImage};
use tempfile::tempdir;

use sorghum_cultivar::dataset::{
    AugmentationPipeline, DatasetMode, Sample, SorghumBatch, SorghumBatcher, SorghumDataset,
};
use sorghum_cultivar::model::{BackboneConfig, BackboneKind, ClassifierConfig};
use sorghum_cultivar::training::{load_checkpoint, save_checkpoint, CheckpointMeta};
use sorghum_cultivar::SorghumError;

type TestBackend = NdArray;

const ROWS: [(&str, &str); 3] = [
    ("2017-06-16__12-24-20-930.png", "PI_152923"),
    ("2017-06-02__16-05-50-395.png", "PI_329256"),
    ("2017-06-12__13-18-07-707.png", "PI_152923"),
];

fn write_split(root: &Path, dir: &str, manifest: &str, with_labels: bool) {
    let images = root.join(dir);
    fs::create_dir_all(&images).unwrap();

    let mut csv = String::from(if with_labels { "image,cultivar\n" } else { "image\n" });
    for (i, (name, cultivar)) in ROWS.iter().enumerate() {
        let width = 320 + 40 * i as u32;
        RgbImage::from_fn(width, 256, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 77]))
            .save(images.join(name))
            .unwrap();
        if with_labels {
            csv.push_str(&format!("{},{}\n", name, cultivar));
        } else {
            csv.push_str(&format!("{}\n", name));
        }
    }
    fs::write(root.join(manifest), csv).unwrap();
}

#[test]
fn training_manifest_yields_labeled_samples() {
    let dir = tempdir().unwrap();
    write_split(dir.path(), "train_images", "train_cultivar_mapping.csv", true);

    let dataset = SorghumDataset::from_manifest(
        &dir.path().join("train_cultivar_mapping.csv"),
        dir.path(),
        DatasetMode::Training,
        299,
    )
    .unwrap();

    assert_eq!(dataset.len(), 3);
    match dataset.get_sample(0).unwrap() {
        Sample::Labeled(tensor, cultivar) => {
            assert_eq!(tensor.shape(), [3, 299, 299]);
            assert_eq!(cultivar.name, "PI_152923");
            assert_eq!(cultivar.index, 0);
        }
        Sample::Unlabeled(_) => panic!("training samples must carry a cultivar"),
    }

    let first = dataset.get_sample(1).unwrap();
    let second = dataset.get_sample(1).unwrap();
    assert_eq!(first, second);

    assert!(matches!(
        dataset.get_sample(3),
        Err(SorghumError::RecordNotFound { index: 3, len: 3 })
    ));
    assert!(dataset.get(3).is_none());
}

#[test]
fn inference_manifest_yields_unlabeled_samples() {
    let dir = tempdir().unwrap();
    write_split(dir.path(), "test", "test.csv", false);

    let dataset = SorghumDataset::from_manifest(
        &dir.path().join("test.csv"),
        dir.path(),
        DatasetMode::Inference,
        224,
    )
    .unwrap();

    for index in 0..dataset.len() {
        let sample = dataset.get_sample(index).unwrap();
        assert!(matches!(sample, Sample::Unlabeled(_)));
        assert_eq!(sample.tensor().shape(), [3, 224, 224]);
    }
}

#[test]
fn batches_flow_through_classifier_and_checkpoint() {
    let dir = tempdir().unwrap();
    write_split(dir.path(), "train_images", "train.csv", true);
    let device = Default::default();

    let config = ClassifierConfig::new(
        BackboneConfig::new(BackboneKind::EfficientnetB0)
            .with_input_size(Some(64))
            .with_freeze(true),
        2,
    )
    .with_hidden_size(Some(32));
    let model = config.init::<TestBackend>(&device).unwrap();

    let dataset = SorghumDataset::from_manifest(
        &dir.path().join("train.csv"),
        dir.path(),
        DatasetMode::Training,
        model.expected_input_size(),
    )
    .unwrap()
    .with_augmentation(AugmentationPipeline::training_default().evaluation_counterpart());

    let items: Vec<Sample> = (0..dataset.len()).filter_map(|i| dataset.get(i)).collect();
    let batch: SorghumBatch<TestBackend> = SorghumBatcher::new(64).batch(items, &device);
    assert_eq!(batch.images.dims(), [3, 3, 64, 64]);
    assert!(batch.targets.is_some());

    let logits = model.forward(batch.images.clone()).unwrap();
    assert_eq!(logits.dims(), [3, 2]);

    let checkpoint = dir.path().join("checkpoints").join("last");
    let meta = CheckpointMeta::new(0, 0.5, 0.5, dataset.vocabulary().as_ref().clone());
    save_checkpoint(&checkpoint, &model, &config, &meta).unwrap();

    let restored = load_checkpoint::<TestBackend>(&checkpoint, &device).unwrap();
    assert_eq!(restored.meta.vocabulary.names(), ["PI_152923", "PI_329256"]);
    let restored_logits = restored.model.forward(batch.images).unwrap();
    logits
        .into_data()
        .assert_approx_eq(&restored_logits.into_data(), burn::tensor::Tolerance::<f32>::absolute(1e-5));
}
