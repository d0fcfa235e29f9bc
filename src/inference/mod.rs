//! Inference module: checkpoint-backed prediction and submission files

pub mod predictor;

pub use predictor::{run_test, submission_path, write_submission, Prediction, Predictor};
