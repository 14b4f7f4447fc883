//! UNet stages: downsampling, upsampling and the bottleneck projections.

use alloc::vec;

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::module::max_pool2d;
use burn::tensor::Tensor;

use super::resnet::{ResidualConvBlock, ResidualConvBlockConfig};

/// Number of groups of every group normalization in the UNet.
pub(crate) const NORM_GROUPS: usize = 8;

#[derive(Config, Debug)]
pub struct UnetDownConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl UnetDownConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UnetDown<B> {
        let resnet = ResidualConvBlockConfig::new(self.in_channels, self.out_channels).init(device);
        UnetDown { resnet }
    }
}

/// Residual block followed by a 2x2 max pooling, halving the resolution.
#[derive(Module, Debug)]
pub struct UnetDown<B: Backend> {
    resnet: ResidualConvBlock<B>,
}

impl<B: Backend> UnetDown<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        let xs = self.resnet.forward(xs);
        max_pool2d(xs, [2, 2], [2, 2], [0, 0], [1, 1])
    }
}

#[derive(Config, Debug)]
pub struct UnetUpConfig {
    /// Channels of the upsampled input and the skip connection together.
    pub in_channels: usize,
    pub out_channels: usize,
}

impl UnetUpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UnetUp<B> {
        let upsample = ConvTranspose2dConfig::new([self.in_channels, self.out_channels], [2, 2])
            .with_stride([2, 2])
            .init(device);
        let resnet = ResidualConvBlockConfig::new(self.out_channels, self.out_channels);
        UnetUp {
            upsample,
            resnet_1: resnet.init(device),
            resnet_2: resnet.init(device),
        }
    }
}

/// Concatenates the skip connection, upsamples 2x with a transposed
/// convolution and refines with two residual blocks.
#[derive(Module, Debug)]
pub struct UnetUp<B: Backend> {
    upsample: ConvTranspose2d<B>,
    resnet_1: ResidualConvBlock<B>,
    resnet_2: ResidualConvBlock<B>,
}

impl<B: Backend> UnetUp<B> {
    pub fn forward(&self, xs: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let xs = Tensor::cat(vec![xs, skip], 1);
        let xs = self.upsample.forward(xs);
        let xs = self.resnet_1.forward(xs);
        self.resnet_2.forward(xs)
    }
}

#[derive(Config, Debug)]
pub struct BottleneckUpConfig {
    pub channels: usize,
    /// Side of the feature map at the deepest level of the UNet.
    pub kernel_size: usize,
}

impl BottleneckUpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BottleneckUp<B> {
        let k = self.kernel_size;
        let upsample = ConvTranspose2dConfig::new([self.channels, self.channels], [k, k])
            .with_stride([k, k])
            .init(device);
        let norm = GroupNormConfig::new(NORM_GROUPS, self.channels).init(device);
        BottleneckUp { upsample, norm }
    }
}

/// Expands the `1x1` bottleneck vector back to the deepest feature map size.
#[derive(Module, Debug)]
pub struct BottleneckUp<B: Backend> {
    upsample: ConvTranspose2d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> BottleneckUp<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.upsample.forward(xs)))
    }
}

#[derive(Config, Debug)]
pub struct OutputHeadConfig {
    pub in_channels: usize,
    pub hidden_channels: usize,
    pub out_channels: usize,
}

impl OutputHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OutputHead<B> {
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        OutputHead {
            conv_1: conv([self.in_channels, self.hidden_channels]),
            norm: GroupNormConfig::new(NORM_GROUPS, self.hidden_channels).init(device),
            conv_2: conv([self.hidden_channels, self.out_channels]),
        }
    }
}

/// Projects the final feature map back to image channels.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    conv_1: Conv2d<B>,
    norm: GroupNorm<B>,
    conv_2: Conv2d<B>,
}

impl<B: Backend> OutputHead<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        let xs = relu(self.norm.forward(self.conv_1.forward(xs)));
        self.conv_2.forward(xs)
    }
}
