//! Model Module
//!
//! Backbone adapters, the classification head and the composed classifier.

pub mod backbone;
pub mod classifier;
pub mod descriptor;
pub mod head;

pub use backbone::{Backbone, BackboneAdapter, FeatureExtractor};
pub use classifier::{ClassifierConfig, SorghumClassifier};
pub use descriptor::{BackboneConfig, BackboneDescriptor, BackboneKind, WeightsSource};
pub use head::{ClassificationHead, HeadConfig};
