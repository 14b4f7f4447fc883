//! ResNet Building Blocks
//!
//! Residual convolutional blocks used by the conditional UNet.
//!
//! Deep Residual Learning for Image Recognition, K. He and al, 2015.
//! https://arxiv.org/abs/1512.03385

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for a residual convolution block.
#[derive(Config, Debug)]
pub struct ResidualConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Whether the block output adds back a residual connection.
    #[config(default = false)]
    pub is_res: bool,
    /// The residual output is scaled by dividing by this value.
    #[config(default = 1.414)]
    pub output_scale_factor: f64,
}

impl ResidualConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualConvBlock<B> {
        ResidualConvBlock {
            conv1: ConvBnGelu::new(self.in_channels, self.out_channels, device),
            conv2: ConvBnGelu::new(self.out_channels, self.out_channels, device),
            same_channels: self.in_channels == self.out_channels,
            is_res: self.is_res,
            output_scale_factor: self.output_scale_factor,
        }
    }
}

/// 3x3 convolution, batch normalization and GELU.
#[derive(Module, Debug)]
struct ConvBnGelu<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBnGelu<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);

        Self { conv, norm }
    }

    fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        gelu(self.norm.forward(self.conv.forward(xs)))
    }
}

/// Two stacked convolutions with an optional residual connection.
///
/// When the channel count changes, the residual is taken from the output of the
/// first convolution instead of the input.
#[derive(Module, Debug)]
pub struct ResidualConvBlock<B: Backend> {
    conv1: ConvBnGelu<B>,
    conv2: ConvBnGelu<B>,
    same_channels: bool,
    is_res: bool,
    output_scale_factor: f64,
}

impl<B: Backend> ResidualConvBlock<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        let x1 = self.conv1.forward(xs.clone());
        let x2 = self.conv2.forward(x1.clone());

        if !self.is_res {
            return x2;
        }

        let shortcut = if self.same_channels { xs } else { x1 };
        (shortcut + x2) / self.output_scale_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::{Distribution, Shape};

    #[test]
    fn test_block_keeps_spatial_size() {
        let device = Default::default();
        let block = ResidualConvBlockConfig::new(3, 8)
            .with_is_res(true)
            .init::<TestBackend>(&device);
        let xs = Tensor::<TestBackend, 4>::random([2, 3, 6, 6], Distribution::Default, &device);

        let out = block.forward(xs);

        assert_eq!(out.shape(), Shape::from([2, 8, 6, 6]));
    }

    #[test]
    fn test_residual_scaling() {
        let device = Default::default();
        let config = ResidualConvBlockConfig::new(4, 4);
        let plain = config.init::<TestBackend>(&device);
        let residual = ResidualConvBlock {
            conv1: plain.conv1.clone(),
            conv2: plain.conv2.clone(),
            same_channels: true,
            is_res: true,
            output_scale_factor: 1.414,
        };
        let xs = Tensor::<TestBackend, 4>::random([1, 4, 5, 5], Distribution::Default, &device);

        let expected = (xs.clone() + plain.forward(xs.clone())) / 1.414;

        residual
            .forward(xs)
            .into_data()
            .assert_approx_eq(&expected.into_data(), 4);
    }
}
