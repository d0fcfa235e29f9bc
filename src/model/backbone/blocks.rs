//! Layer building blocks shared by the backbone implementations.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// Options for a bias-free convolution
#[derive(Debug, Clone, Copy)]
pub struct ConvSpec {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl ConvSpec {
    /// `k x k` kernel, stride 1, size-preserving padding, no grouping
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel,
            stride: 1,
            padding: kernel / 2,
            groups: 1,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Conv2d<B> {
        Conv2dConfig::new([in_channels, out_channels], [self.kernel, self.kernel])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
            .with_groups(self.groups)
            .with_bias(false)
            .init(device)
    }
}

/// Convolution followed by batch norm, no activation
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        spec: ConvSpec,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: spec.init(in_channels, out_channels, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    /// Same block with custom batch-norm epsilon and momentum
    pub fn with_norm(
        in_channels: usize,
        out_channels: usize,
        spec: ConvSpec,
        epsilon: f64,
        momentum: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: spec.init(in_channels, out_channels, device),
            bn: BatchNormConfig::new(out_channels)
                .with_epsilon(epsilon)
                .with_momentum(momentum)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Depthwise `k x k` convolution followed by a pointwise `1 x 1` projection
#[derive(Module, Debug)]
pub struct SeparableConv2d<B: Backend> {
    pub depthwise: Conv2d<B>,
    pub pointwise: Conv2d<B>,
}

impl<B: Backend> SeparableConv2d<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            depthwise: ConvSpec::new(kernel)
                .groups(in_channels)
                .init(in_channels, in_channels, device),
            pointwise: ConvSpec::new(1).init(in_channels, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(x))
    }
}

/// `[batch, channels, 1, 1]` -> `[batch, channels]`
pub fn flatten_pooled<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    x.reshape([batch, channels])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_conv_bn_stride() {
        let device = Default::default();
        let block = ConvBn::<TestBackend>::new(3, 8, ConvSpec::new(3).stride(2), &device);
        let out = block.forward(Tensor::zeros([2, 3, 16, 16], &device));
        assert_eq!(out.dims(), [2, 8, 8, 8]);
    }

    #[test]
    fn test_separable_conv_keeps_size() {
        let device = Default::default();
        let sep = SeparableConv2d::<TestBackend>::new(4, 6, 3, &device);
        let out = sep.forward(Tensor::ones([1, 4, 5, 5], &device));
        assert_eq!(out.dims(), [1, 6, 5, 5]);
    }

    #[test]
    fn test_flatten_pooled() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([3, 7, 1, 1], &device);
        assert_eq!(flatten_pooled(x).dims(), [3, 7]);
    }
}
