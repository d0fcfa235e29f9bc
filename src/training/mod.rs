//! Training module
//!
//! - Supervised fine-tuning loop over the sorghum dataset
//! - Checkpoint directories ranked by validation loss

pub mod checkpoint;
pub mod trainer;

pub use checkpoint::{
    load_checkpoint, save_checkpoint, CheckpointManager, CheckpointMeta, LoadedCheckpoint,
    LAST_CHECKPOINT,
};
pub use trainer::{evaluate, fit, run_training, EpochMetrics, TrainingSummary};
