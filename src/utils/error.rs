//! Error Handling Module
//!
//! Defines the error taxonomy for the sorghum cultivar pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for sorghum cultivar operations
#[derive(Error, Debug)]
pub enum SorghumError {
    /// Index outside the record store
    #[error("Record {index} not found (dataset holds {len} records)")]
    RecordNotFound { index: usize, len: usize },

    /// Image file missing, empty or not decodable at all
    #[error("Failed to decode image at '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Batch handed to a backbone with the wrong spatial size
    #[error("Shape mismatch for backbone '{backbone}': expected [N, 3, {expected}, {expected}], got {actual:?}")]
    ShapeMismatch {
        backbone: String,
        expected: usize,
        actual: [usize; 4],
    },

    /// Pretrained weights could not be loaded into a backbone
    #[error("Failed to load backbone '{backbone}': {reason}")]
    BackboneLoad { backbone: String, reason: String },

    /// Manifest file missing columns or rows
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Invalid augmentation pipeline
    #[error("Augmentation error: {0}")]
    Augmentation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint save/load error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SorghumError {
    fn from(err: serde_json::Error) -> Self {
        SorghumError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for SorghumError {
    fn from(err: csv::Error) -> Self {
        SorghumError::Manifest(err.to_string())
    }
}

/// Convenience Result type for sorghum cultivar operations
pub type Result<T> = std::result::Result<T, SorghumError>;
