//! Burn batcher grouping samples into `(batch, 3, S, S)` tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::dataset::pipeline::Sample;
use crate::dataset::tensor::CHANNELS;

/// A batch of sorghum images
#[derive(Clone, Debug)]
pub struct SorghumBatch<B: Backend> {
    /// `[batch, 3, S, S]`; axis 2 is the image column, axis 3 the row
    pub images: Tensor<B, 4>,
    /// Class indices, present only when every sample in the batch is labeled
    pub targets: Option<Tensor<B, 1, Int>>,
}

/// Stacks sample tensors; the image size must match the samples' target size
#[derive(Clone, Debug)]
pub struct SorghumBatcher {
    image_size: usize,
}

impl SorghumBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl<B: Backend> Batcher<B, Sample, SorghumBatch<B>> for SorghumBatcher {
    fn batch(&self, items: Vec<Sample>, device: &B::Device) -> SorghumBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * CHANNELS * size * size);
        let mut targets_data = Vec::with_capacity(batch_size);

        for item in items {
            let (tensor, cultivar) = item.into_parts();
            images_data.extend(tensor.into_vec());
            if let Some(cultivar) = cultivar {
                targets_data.push(cultivar.index as i64);
            }
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, CHANNELS, size, size]),
            device,
        );

        let targets = (targets_data.len() == batch_size).then(|| {
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device)
        });

        SorghumBatch { images, targets }
    }
}
