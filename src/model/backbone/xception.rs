//! Xception feature extractor.
//!
//! Entry flow (two stem convolutions, three strided separable blocks
//! 64 -> 128 -> 256 -> 728), middle flow (eight residual blocks at 728
//! channels) and exit flow (728 -> 1024 block, separable convolutions to
//! 1536 and 2048), globally average pooled to a 2048-wide feature vector.

use burn::{
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

use super::blocks::{flatten_pooled, ConvBn, ConvSpec, SeparableConv2d};
use super::FeatureExtractor;

/// Width of the pooled feature vector
pub const XCEPTION_FEATURES: usize = 2048;

const MIDDLE_FLOW_BLOCKS: usize = 8;

/// Separable convolution plus batch norm
#[derive(Module, Debug)]
pub struct SeparableUnit<B: Backend> {
    sep: SeparableConv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> SeparableUnit<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            sep: SeparableConv2d::new(in_channels, out_channels, 3, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.sep.forward(x))
    }
}

/// Residual block of ReLU + separable units with an optional strided max-pool
#[derive(Module, Debug)]
pub struct XceptionBlock<B: Backend> {
    units: Vec<SeparableUnit<B>>,
    pool: Option<MaxPool2d>,
    skip: Option<ConvBn<B>>,
    start_with_relu: bool,
}

impl<B: Backend> XceptionBlock<B> {
    /// `grow_first` widens to `out_channels` in the first unit instead of the last
    fn new(
        in_channels: usize,
        out_channels: usize,
        reps: usize,
        stride: usize,
        start_with_relu: bool,
        grow_first: bool,
        device: &B::Device,
    ) -> Self {
        let mut units = Vec::with_capacity(reps);
        let mut channels = in_channels;

        if grow_first {
            units.push(SeparableUnit::new(in_channels, out_channels, device));
            channels = out_channels;
        }
        for _ in 1..reps {
            units.push(SeparableUnit::new(channels, channels, device));
        }
        if !grow_first {
            units.push(SeparableUnit::new(in_channels, out_channels, device));
        }

        let pool = (stride != 1).then(|| {
            MaxPool2dConfig::new([3, 3])
                .with_strides([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init()
        });

        let skip = (in_channels != out_channels || stride != 1).then(|| {
            ConvBn::new(
                in_channels,
                out_channels,
                ConvSpec::new(1).stride(stride),
                device,
            )
        });

        Self {
            units,
            pool,
            skip,
            start_with_relu,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        for (i, unit) in self.units.iter().enumerate() {
            if i > 0 || self.start_with_relu {
                x = relu(x);
            }
            x = unit.forward(x);
        }
        if let Some(pool) = &self.pool {
            x = pool.forward(x);
        }

        let residual = match &self.skip {
            Some(skip) => skip.forward(input),
            None => input,
        };
        x + residual
    }
}

/// Xception backbone without its ImageNet classifier
#[derive(Module, Debug)]
pub struct Xception<B: Backend> {
    stem1: ConvBn<B>,
    stem2: ConvBn<B>,
    blocks: Vec<XceptionBlock<B>>,
    conv3: SeparableUnit<B>,
    conv4: SeparableUnit<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> Xception<B> {
    pub fn new(device: &B::Device) -> Self {
        let stem1 = ConvBn::new(3, 32, ConvSpec::new(3).stride(2).padding(0), device);
        let stem2 = ConvBn::new(32, 64, ConvSpec::new(3).padding(0), device);

        let mut blocks = vec![
            XceptionBlock::new(64, 128, 2, 2, false, true, device),
            XceptionBlock::new(128, 256, 2, 2, true, true, device),
            XceptionBlock::new(256, 728, 2, 2, true, true, device),
        ];
        for _ in 0..MIDDLE_FLOW_BLOCKS {
            blocks.push(XceptionBlock::new(728, 728, 3, 1, true, true, device));
        }
        blocks.push(XceptionBlock::new(728, 1024, 2, 2, true, false, device));

        Self {
            stem1,
            stem2,
            blocks,
            conv3: SeparableUnit::new(1024, 1536, device),
            conv4: SeparableUnit::new(1536, XCEPTION_FEATURES, device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for Xception<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.stem1.forward(input));
        let mut x = relu(self.stem2.forward(x));

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = relu(self.conv3.forward(x));
        let x = relu(self.conv4.forward(x));

        flatten_pooled(self.pool.forward(x))
    }

    fn feature_width(&self) -> usize {
        XCEPTION_FEATURES
    }
}
