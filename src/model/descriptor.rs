//! Backbone descriptors: per-variant input size, feature width and weight source.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::model::backbone::efficientnet::EfficientNetVariant;
use crate::utils::error::SorghumError;

/// Smallest input every backbone can reduce to a `1 x 1` map
pub const MIN_INPUT_SIZE: usize = 32;

/// Supported backbone families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    Xception,
    EfficientnetB0,
    EfficientnetB1,
    EfficientnetB2,
    EfficientnetB3,
    Resnest50,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 6] = [
        BackboneKind::Xception,
        BackboneKind::EfficientnetB0,
        BackboneKind::EfficientnetB1,
        BackboneKind::EfficientnetB2,
        BackboneKind::EfficientnetB3,
        BackboneKind::Resnest50,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackboneKind::Xception => "xception",
            BackboneKind::EfficientnetB0 => "efficientnet_b0",
            BackboneKind::EfficientnetB1 => "efficientnet_b1",
            BackboneKind::EfficientnetB2 => "efficientnet_b2",
            BackboneKind::EfficientnetB3 => "efficientnet_b3",
            BackboneKind::Resnest50 => "resnest50",
        }
    }

    /// EfficientNet scaling variant, if this is an EfficientNet
    pub fn efficientnet_variant(&self) -> Option<EfficientNetVariant> {
        match self {
            BackboneKind::EfficientnetB0 => Some(EfficientNetVariant::B0),
            BackboneKind::EfficientnetB1 => Some(EfficientNetVariant::B1),
            BackboneKind::EfficientnetB2 => Some(EfficientNetVariant::B2),
            BackboneKind::EfficientnetB3 => Some(EfficientNetVariant::B3),
            _ => None,
        }
    }

    /// Side length the backbone is trained at unless overridden
    pub fn default_input_size(&self) -> usize {
        match self {
            BackboneKind::Xception => 299,
            BackboneKind::EfficientnetB0 => 224,
            BackboneKind::EfficientnetB1 => 240,
            BackboneKind::EfficientnetB2 => 260,
            BackboneKind::EfficientnetB3 => 1024,
            BackboneKind::Resnest50 => 512,
        }
    }

    /// Width of the pooled feature vector
    pub fn feature_width(&self) -> usize {
        match self.efficientnet_variant() {
            Some(variant) => variant.feature_width(),
            None => 2048,
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackboneKind {
    type Err = SorghumError;

    fn from_str(s: &str) -> crate::utils::error::Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        BackboneKind::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| {
                let known: Vec<_> = BackboneKind::ALL.iter().map(|k| k.name()).collect();
                SorghumError::Config(format!(
                    "unknown backbone '{}' (expected one of {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// Where pretrained backbone parameters come from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsSource {
    /// Random initialization
    #[default]
    None,
    /// Full-precision named MessagePack record of the backbone module
    File(PathBuf),
}

/// Resolved metadata for one backbone choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneDescriptor {
    pub kind: BackboneKind,
    pub expected_input_size: usize,
    pub output_width: usize,
    pub weights: WeightsSource,
}

impl BackboneDescriptor {
    /// Descriptor with the kind's defaults and no pretrained weights
    pub fn for_kind(kind: BackboneKind) -> Self {
        Self {
            kind,
            expected_input_size: kind.default_input_size(),
            output_width: kind.feature_width(),
            weights: WeightsSource::None,
        }
    }
}

/// Backbone choice inside a classifier configuration
#[derive(Config, Debug)]
pub struct BackboneConfig {
    pub kind: BackboneKind,
    /// Overrides the kind's default input size
    pub input_size: Option<usize>,
    #[config(default = "WeightsSource::None")]
    pub weights: WeightsSource,
    /// Turn off gradient tracking on every backbone parameter
    #[config(default = "false")]
    pub freeze: bool,
}

impl BackboneConfig {
    pub fn descriptor(&self) -> BackboneDescriptor {
        BackboneDescriptor {
            kind: self.kind,
            expected_input_size: self
                .input_size
                .unwrap_or_else(|| self.kind.default_input_size()),
            output_width: self.kind.feature_width(),
            weights: self.weights.clone(),
        }
    }

    pub fn validate(&self) -> crate::utils::error::Result<()> {
        if let Some(size) = self.input_size {
            if size < MIN_INPUT_SIZE {
                return Err(SorghumError::Config(format!(
                    "backbone input_size must be at least {}, got {}",
                    MIN_INPUT_SIZE, size
                )));
            }
        }
        Ok(())
    }
}
