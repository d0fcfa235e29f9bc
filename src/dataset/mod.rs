//! Dataset module: manifest records, image decoding, augmentation and batching

pub mod augmentation;
pub mod batcher;
pub mod decode;
pub mod manifest;
pub mod pipeline;
pub mod scan;
pub mod split;
pub mod tensor;

pub use augmentation::{AugmentationPipeline, BorderMode, Step, Transform, WeightedTransform};
pub use batcher::{SorghumBatch, SorghumBatcher};
pub use manifest::{Cultivar, CultivarVocabulary, DatasetMode, Record, RecordStore};
pub use pipeline::{Sample, SorghumDataset};
pub use scan::{scan_images, ScanReport};
pub use split::train_val_split;
pub use tensor::PixelTensor;
