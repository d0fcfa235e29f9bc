//! EfficientNet feature extractor (B0-B3 compound scaling).
//!
//! Stem convolution, seven stages of MBConv blocks with squeeze-and-excitation
//! and SiLU, a `1 x 1` head convolution and global average pooling.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};
use serde::{Deserialize, Serialize};

use super::blocks::{flatten_pooled, ConvBn, ConvSpec};
use super::FeatureExtractor;

const BN_EPSILON: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.01;
const SE_RATIO: f64 = 0.25;
const CHANNEL_DIVISOR: usize = 8;
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// Compound-scaling variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EfficientNetVariant {
    B0,
    B1,
    B2,
    B3,
}

impl EfficientNetVariant {
    /// `(width multiplier, depth multiplier)`
    pub fn scaling(&self) -> (f64, f64) {
        match self {
            EfficientNetVariant::B0 => (1.0, 1.0),
            EfficientNetVariant::B1 => (1.0, 1.1),
            EfficientNetVariant::B2 => (1.1, 1.2),
            EfficientNetVariant::B3 => (1.2, 1.4),
        }
    }

    /// Width of the pooled feature vector
    pub fn feature_width(&self) -> usize {
        round_filters(HEAD_CHANNELS, self.scaling().0)
    }
}

/// Base stage table: `(kernel, stride, expand ratio, in, out, repeats)`
const STAGES: [(usize, usize, usize, usize, usize, usize); 7] = [
    (3, 1, 1, 32, 16, 1),
    (3, 2, 6, 16, 24, 2),
    (5, 2, 6, 24, 40, 2),
    (3, 2, 6, 40, 80, 3),
    (5, 1, 6, 80, 112, 3),
    (5, 2, 6, 112, 192, 4),
    (3, 1, 6, 192, 320, 1),
];

/// Scale a channel count by `width` and round to a multiple of 8, never
/// dropping more than 10%
pub fn round_filters(filters: usize, width: f64) -> usize {
    let scaled = filters as f64 * width;
    let divisor = CHANNEL_DIVISOR as f64;
    let rounded = ((scaled + divisor / 2.0) / divisor).floor() * divisor;
    let mut rounded = rounded.max(divisor);
    if rounded < 0.9 * scaled {
        rounded += divisor;
    }
    rounded as usize
}

/// Scale a stage's repeat count by `depth`, rounding up
pub fn round_repeats(repeats: usize, depth: f64) -> usize {
    (repeats as f64 * depth).ceil() as usize
}

/// Squeeze-and-excitation gate
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

/// Mobile inverted bottleneck
#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se: SqueezeExcitation<B>,
    project: ConvBn<B>,
    residual: bool,
}

impl<B: Backend> MBConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let norm = |i: usize, o: usize, spec: ConvSpec| {
            ConvBn::with_norm(i, o, spec, BN_EPSILON, BN_MOMENTUM, device)
        };

        let expand = (expand_ratio != 1).then(|| norm(in_channels, hidden, ConvSpec::new(1)));
        let depthwise = norm(
            hidden,
            hidden,
            ConvSpec::new(kernel).stride(stride).groups(hidden),
        );
        let squeezed = ((in_channels as f64 * SE_RATIO) as usize).max(1);
        let se = SqueezeExcitation::new(hidden, squeezed, device);
        let project = norm(hidden, out_channels, ConvSpec::new(1));

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => silu(expand.forward(input.clone())),
            None => input.clone(),
        };
        let x = silu(self.depthwise.forward(x));
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        if self.residual {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNet backbone without its ImageNet classifier
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MBConv<B>>,
    head: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
    features: usize,
}

impl<B: Backend> EfficientNet<B> {
    pub fn new(variant: EfficientNetVariant, device: &B::Device) -> Self {
        let (width, depth) = variant.scaling();
        let norm = |i: usize, o: usize, spec: ConvSpec| {
            ConvBn::with_norm(i, o, spec, BN_EPSILON, BN_MOMENTUM, device)
        };

        let stem_channels = round_filters(STEM_CHANNELS, width);
        let stem = norm(3, stem_channels, ConvSpec::new(3).stride(2));

        let mut blocks = Vec::new();
        for (kernel, stride, expand, in_base, out_base, repeats) in STAGES {
            let in_channels = round_filters(in_base, width);
            let out_channels = round_filters(out_base, width);

            blocks.push(MBConv::new(
                in_channels,
                out_channels,
                kernel,
                stride,
                expand,
                device,
            ));
            for _ in 1..round_repeats(repeats, depth) {
                blocks.push(MBConv::new(
                    out_channels,
                    out_channels,
                    kernel,
                    1,
                    expand,
                    device,
                ));
            }
        }

        let last_channels = round_filters(STAGES[STAGES.len() - 1].4, width);
        let features = variant.feature_width();
        let head = norm(last_channels, features, ConvSpec::new(1));

        Self {
            stem,
            blocks,
            head,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            features,
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for EfficientNet<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(input));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));

        flatten_pooled(self.pool.forward(x))
    }

    fn feature_width(&self) -> usize {
        self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_round_filters() {
        assert_eq!(round_filters(32, 1.0), 32);
        assert_eq!(round_filters(32, 1.2), 40);
        assert_eq!(round_filters(1280, 1.2), 1536);
        assert_eq!(round_filters(1280, 1.1), 1408);
        assert_eq!(round_filters(320, 1.2), 384);
    }

    #[test]
    fn test_round_repeats() {
        assert_eq!(round_repeats(2, 1.4), 3);
        assert_eq!(round_repeats(4, 1.4), 6);
        assert_eq!(round_repeats(1, 1.0), 1);
    }

    #[test]
    fn test_variant_feature_widths() {
        assert_eq!(EfficientNetVariant::B0.feature_width(), 1280);
        assert_eq!(EfficientNetVariant::B3.feature_width(), 1536);
    }

    #[test]
    fn test_mbconv_residual_only_when_shape_kept() {
        let device = Default::default();
        let keep = MBConv::<TestBackend>::new(16, 16, 3, 1, 6, &device);
        let down = MBConv::<TestBackend>::new(16, 24, 5, 2, 6, &device);
        assert!(keep.residual);
        assert!(!down.residual);

        let out = down.forward(Tensor::ones([1, 16, 8, 8], &device));
        assert_eq!(out.dims(), [1, 24, 4, 4]);
    }

    #[test]
    fn test_b0_block_count() {
        let device = Default::default();
        let net = EfficientNet::<TestBackend>::new(EfficientNetVariant::B0, &device);
        assert_eq!(net.blocks.len(), 16);
    }
}
