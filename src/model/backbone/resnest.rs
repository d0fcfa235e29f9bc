//! ResNeSt-50 feature extractor.
//!
//! Deep stem (three `3 x 3` convolutions), four stages of split-attention
//! bottlenecks `[3, 4, 6, 3]` with radix 2, average-pool downsampling on the
//! shortcut and in the block (avd), and global average pooling to 2048.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{
            AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d,
            MaxPool2dConfig,
        },
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{
        activation::{relu, softmax},
        backend::Backend,
        Tensor,
    },
};

use super::blocks::{flatten_pooled, ConvBn, ConvSpec};
use super::FeatureExtractor;

/// Width of the pooled feature vector
pub const RESNEST_FEATURES: usize = 2048;

const EXPANSION: usize = 4;
const STEM_WIDTH: usize = 32;
const RADIX: usize = 2;
const REDUCTION: usize = 4;
const MIN_INTER_CHANNELS: usize = 32;
const LAYERS: [usize; 4] = [3, 4, 6, 3];

/// Split-attention convolution
///
/// Each radix split has its own `3 x 3` convolution; the splits are
/// concatenated so channel `r * C + c` belongs to split `r`.
#[derive(Module, Debug)]
pub struct SplitAttentionConv<B: Backend> {
    branches: Vec<ConvBn<B>>,
    pool: AdaptiveAvgPool2d,
    fc1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    fc2: Conv2d<B>,
    channels: usize,
    radix: usize,
}

impl<B: Backend> SplitAttentionConv<B> {
    fn new(in_channels: usize, channels: usize, radix: usize, device: &B::Device) -> Self {
        let inter = (in_channels * radix / REDUCTION).max(MIN_INTER_CHANNELS);
        let branches = (0..radix)
            .map(|_| ConvBn::new(in_channels, channels, ConvSpec::new(3), device))
            .collect();

        Self {
            branches,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: Conv2dConfig::new([channels, inter], [1, 1]).init(device),
            bn1: BatchNormConfig::new(inter).init(device),
            fc2: Conv2dConfig::new([inter, channels * radix], [1, 1]).init(device),
            channels,
            radix,
        }
    }

    /// Softmax across the radix splits of each channel
    fn radix_softmax(&self, attention: Tensor<B, 4>) -> Tensor<B, 4> {
        let batch = attention.dims()[0];

        let attention = attention.reshape([batch, self.radix, self.channels]);
        softmax(attention, 1).reshape([batch, self.radix * self.channels, 1, 1])
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let branches: Vec<Tensor<B, 4>> = self
            .branches
            .iter()
            .map(|branch| relu(branch.forward(x.clone())))
            .collect();
        let x = Tensor::cat(branches, 1);
        let [batch, _, height, width] = x.dims();

        let splits: Tensor<B, 5> = x.reshape([batch, self.radix, self.channels, height, width]);

        let gap = splits
            .clone()
            .sum_dim(1)
            .reshape([batch, self.channels, height, width]);
        let gap = self.pool.forward(gap);
        let gap = relu(self.bn1.forward(self.fc1.forward(gap)));
        let attention = self
            .radix_softmax(self.fc2.forward(gap))
            .reshape([batch, self.radix, self.channels, 1, 1]);

        (splits * attention)
            .sum_dim(1)
            .reshape([batch, self.channels, height, width])
    }
}

/// Bottleneck with a split-attention `3 x 3` convolution
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: ConvBn<B>,
    conv2: SplitAttentionConv<B>,
    avd: Option<AvgPool2d>,
    conv3: ConvBn<B>,
    downsample: Option<Downsample<B>>,
}

/// Average-pool then `1 x 1` projection on the shortcut path
///
/// The pool rounds odd sizes up, matching `avd` on the main path.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pool: Option<AvgPool2d>,
    proj: ConvBn<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let pool = (stride != 1).then(|| {
            AvgPool2dConfig::new([3, 3])
                .with_strides([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_count_include_pad(false)
                .init()
        });
        Self {
            pool,
            proj: ConvBn::new(in_channels, out_channels, ConvSpec::new(1), device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        self.proj.forward(x)
    }
}

impl<B: Backend> Bottleneck<B> {
    fn new(
        in_channels: usize,
        planes: usize,
        stride: usize,
        is_first: bool,
        device: &B::Device,
    ) -> Self {
        let out_channels = planes * EXPANSION;

        let avd = (stride > 1 || is_first).then(|| {
            AvgPool2dConfig::new([3, 3])
                .with_strides([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init()
        });

        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        Self {
            conv1: ConvBn::new(in_channels, planes, ConvSpec::new(1), device),
            conv2: SplitAttentionConv::new(planes, planes, RADIX, device),
            avd,
            conv3: ConvBn::new(planes, out_channels, ConvSpec::new(1), device),
            downsample,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(input.clone()));
        let x = self.conv2.forward(x);
        let x = match &self.avd {
            Some(avd) => avd.forward(x),
            None => x,
        };
        let x = self.conv3.forward(x);

        let residual = match &self.downsample {
            Some(downsample) => downsample.forward(input),
            None => input,
        };
        relu(x + residual)
    }
}

/// ResNeSt-50 backbone without its ImageNet classifier
#[derive(Module, Debug)]
pub struct ResNeSt<B: Backend> {
    stem: Vec<ConvBn<B>>,
    maxpool: MaxPool2d,
    blocks: Vec<Bottleneck<B>>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> ResNeSt<B> {
    pub fn new(device: &B::Device) -> Self {
        let stem = vec![
            ConvBn::new(3, STEM_WIDTH, ConvSpec::new(3).stride(2), device),
            ConvBn::new(STEM_WIDTH, STEM_WIDTH, ConvSpec::new(3), device),
            ConvBn::new(STEM_WIDTH, STEM_WIDTH * 2, ConvSpec::new(3), device),
        ];
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut blocks = Vec::new();
        let mut in_channels = STEM_WIDTH * 2;
        for (stage, &count) in LAYERS.iter().enumerate() {
            let planes = 64 << stage;
            let stride = if stage == 0 { 1 } else { 2 };

            for i in 0..count {
                let (block_stride, is_first) = if i == 0 { (stride, true) } else { (1, false) };
                blocks.push(Bottleneck::new(in_channels, planes, block_stride, is_first, device));
                in_channels = planes * EXPANSION;
            }
        }

        Self {
            stem,
            maxpool,
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for ResNeSt<B> {
    fn forward_features(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = input;
        for conv in &self.stem {
            x = relu(conv.forward(x));
        }
        let mut x = self.maxpool.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        flatten_pooled(self.pool.forward(x))
    }

    fn feature_width(&self) -> usize {
        RESNEST_FEATURES
    }
}
