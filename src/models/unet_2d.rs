//! Conditional UNet denoiser
//!
//! Predicts the noise added to an image given its class label and the
//! normalized diffusion step. Class conditioning can be switched off per
//! example with a context mask, which is what classifier-free guidance needs.

use alloc::vec;

use burn::config::Config;
use burn::module::Module;
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{Int, Tensor};

use super::embeddings::{EmbedFC, EmbedFCConfig};
use super::resnet::{ResidualConvBlock, ResidualConvBlockConfig};
use super::unet_2d_blocks::{
    BottleneckUp, BottleneckUpConfig, OutputHead, OutputHeadConfig, UnetDown, UnetDownConfig,
    UnetUp, UnetUpConfig, NORM_GROUPS,
};
use crate::error::{ensure_dims, DdpmError};
use crate::utils::one_hot;

#[derive(Config, Debug)]
pub struct ContextUnetConfig {
    /// Number of image channels.
    pub in_channels: usize,
    /// Base feature width `F`; must be a multiple of 8.
    #[config(default = 256)]
    pub n_feat: usize,
    #[config(default = 10)]
    pub n_classes: usize,
    /// Side of the square input images; must be a multiple of 4.
    #[config(default = 28)]
    pub image_size: usize,
}

impl ContextUnetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ContextUnet<B>, DdpmError> {
        if self.image_size == 0 || self.image_size % 4 != 0 {
            return Err(DdpmError::InvalidImageSize(self.image_size));
        }
        if self.n_feat == 0 || self.n_feat % NORM_GROUPS != 0 {
            return Err(DdpmError::InvalidFeatureWidth(self.n_feat));
        }
        let n_feat = self.n_feat;

        Ok(ContextUnet {
            init_conv: ResidualConvBlockConfig::new(self.in_channels, n_feat)
                .with_is_res(true)
                .init(device),
            down1: UnetDownConfig::new(n_feat, n_feat).init(device),
            down2: UnetDownConfig::new(n_feat, 2 * n_feat).init(device),
            timeembed1: EmbedFCConfig::new(1, 2 * n_feat).init(device),
            timeembed2: EmbedFCConfig::new(1, n_feat).init(device),
            contextembed1: EmbedFCConfig::new(self.n_classes, 2 * n_feat).init(device),
            contextembed2: EmbedFCConfig::new(self.n_classes, n_feat).init(device),
            up0: BottleneckUpConfig::new(2 * n_feat, self.image_size / 4).init(device),
            up1: UnetUpConfig::new(4 * n_feat, n_feat).init(device),
            up2: UnetUpConfig::new(2 * n_feat, n_feat).init(device),
            out: OutputHeadConfig::new(2 * n_feat, n_feat, self.in_channels).init(device),
            in_channels: self.in_channels,
            n_classes: self.n_classes,
            image_size: self.image_size,
        })
    }
}

#[derive(Module, Debug)]
pub struct ContextUnet<B: Backend> {
    init_conv: ResidualConvBlock<B>,
    down1: UnetDown<B>,
    down2: UnetDown<B>,
    timeembed1: EmbedFC<B>,
    timeembed2: EmbedFC<B>,
    contextembed1: EmbedFC<B>,
    contextembed2: EmbedFC<B>,
    up0: BottleneckUp<B>,
    up1: UnetUp<B>,
    up2: UnetUp<B>,
    out: OutputHead<B>,
    in_channels: usize,
    n_classes: usize,
    image_size: usize,
}

impl<B: Backend> ContextUnet<B> {
    /// Predicts the noise of `xs`.
    ///
    /// # Shapes
    ///
    /// - xs: `[batch, in_channels, image_size, image_size]`
    /// - labels: `[batch]`, values in `[0, n_classes)`
    /// - timesteps: `[batch, 1]`, the diffusion step divided by `T`
    /// - context_mask: `[batch]`, `1` drops the class context, `0` keeps it
    /// - output: same as `xs`
    pub fn forward(
        &self,
        xs: Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        timesteps: Tensor<B, 2>,
        context_mask: Tensor<B, 1>,
    ) -> Result<Tensor<B, 4>, DdpmError> {
        let [batch, _, _, _] = xs.dims();
        ensure_dims(
            "noisy images",
            [batch, self.in_channels, self.image_size, self.image_size],
            xs.dims(),
        )?;
        ensure_dims("class labels", [batch], labels.dims())?;
        ensure_dims("timesteps", [batch, 1], timesteps.dims())?;
        ensure_dims("context mask", [batch], context_mask.dims())?;
        check_context_mask(&context_mask)?;

        let x = self.init_conv.forward(xs);
        let down1 = self.down1.forward(x.clone());
        let down2 = self.down2.forward(down1.clone());
        let hiddenvec = gelu(adaptive_avg_pool2d(down2.clone(), [1, 1]));

        let context = one_hot(labels, self.n_classes)?;
        // -(1 - mask): flips 0 <-> 1, so masked rows become all zero.
        let context_mask = context_mask
            .unsqueeze_dim::<2>(1)
            .repeat(1, self.n_classes)
            .neg()
            .add_scalar(1.0)
            .neg();
        let context = context * context_mask;

        let cemb1 = self.contextembed1.forward_spatial(context.clone());
        let temb1 = self.timeembed1.forward_spatial(timesteps.clone());
        let cemb2 = self.contextembed2.forward_spatial(context);
        let temb2 = self.timeembed2.forward_spatial(timesteps);

        let up1 = self.up0.forward(hiddenvec);
        let up2 = self.up1.forward(cemb1 * up1 + temb1, down2);
        let up3 = self.up2.forward(cemb2 * up2 + temb2, down1);

        Ok(self.out.forward(Tensor::cat(vec![up3, x], 1)))
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

fn check_context_mask<B: Backend>(context_mask: &Tensor<B, 1>) -> Result<(), DdpmError> {
    let values = context_mask.to_data().convert::<f32>().value;
    match values.into_iter().find(|&v| v != 0.0 && v != 1.0) {
        Some(value) => Err(DdpmError::InvalidContextMask { value }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{float_tensor, int_tensor};
    use crate::TestBackend;
    use burn::tensor::{Distribution, Shape};

    fn small_unet() -> ContextUnet<TestBackend> {
        ContextUnetConfig::new(3)
            .with_n_feat(8)
            .with_image_size(8)
            .init(&Default::default())
            .unwrap()
    }

    fn inputs(batch: usize) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 2>) {
        let device = Default::default();
        let xs = Tensor::random([batch, 3, 8, 8], Distribution::Normal(0., 1.), &device);
        let ts = Tensor::ones([batch, 1], &device).mul_scalar(0.5);
        (xs, ts)
    }

    #[test]
    fn test_output_matches_input_shape() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(4);

        let out = unet
            .forward(
                xs,
                int_tensor(&[0, 3, 9, 1], &device),
                ts,
                float_tensor(&[0.0, 1.0, 0.0, 1.0], &device),
            )
            .unwrap();

        assert_eq!(out.shape(), Shape::from([4, 3, 8, 8]));
    }

    #[test]
    fn test_masked_context_ignores_label() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(1);
        let mask = float_tensor::<TestBackend>(&[1.0], &device);

        let out_a = unet
            .forward(xs.clone(), int_tensor(&[2], &device), ts.clone(), mask.clone())
            .unwrap();
        let out_b = unet
            .forward(xs, int_tensor(&[7], &device), ts, mask)
            .unwrap();

        out_a.into_data().assert_approx_eq(&out_b.into_data(), 5);
    }

    #[test]
    fn test_active_context_uses_label() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(1);
        let mask = float_tensor::<TestBackend>(&[0.0], &device);

        let out_a = unet
            .forward(xs.clone(), int_tensor(&[2], &device), ts.clone(), mask.clone())
            .unwrap();
        let out_b = unet
            .forward(xs, int_tensor(&[7], &device), ts, mask)
            .unwrap();

        let diff = (out_a - out_b).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_forward_is_deterministic() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(2);
        let labels = int_tensor::<TestBackend>(&[1, 2], &device);
        let mask = float_tensor::<TestBackend>(&[0.0, 0.0], &device);

        let out_a = unet
            .forward(xs.clone(), labels.clone(), ts.clone(), mask.clone())
            .unwrap();
        let out_b = unet.forward(xs, labels, ts, mask).unwrap();

        assert_eq!(
            out_a.into_data().convert::<f32>().value,
            out_b.into_data().convert::<f32>().value
        );
    }

    #[test]
    fn test_rejects_wrong_channels() {
        let device = Default::default();
        let unet = small_unet();
        let xs = Tensor::<TestBackend, 4>::zeros([2, 1, 8, 8], &device);

        let err = unet
            .forward(
                xs,
                int_tensor(&[0, 1], &device),
                Tensor::zeros([2, 1], &device),
                float_tensor(&[0.0, 0.0], &device),
            )
            .unwrap_err();

        assert_eq!(
            err,
            DdpmError::ShapeMismatch {
                context: "noisy images",
                expected: vec![2, 3, 8, 8],
                actual: vec![2, 1, 8, 8],
            }
        );
    }

    #[test]
    fn test_rejects_label_batch_mismatch() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(2);

        let err = unet
            .forward(xs, int_tensor(&[0], &device), ts, float_tensor(&[0.0, 0.0], &device))
            .unwrap_err();

        assert!(matches!(err, DdpmError::ShapeMismatch { context: "class labels", .. }));
    }

    #[test]
    fn test_rejects_invalid_label() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(2);

        let err = unet
            .forward(xs, int_tensor(&[0, 10], &device), ts, float_tensor(&[0.0, 0.0], &device))
            .unwrap_err();

        assert_eq!(err, DdpmError::InvalidLabel { label: 10, n_classes: 10 });
    }

    #[test]
    fn test_rejects_fractional_mask() {
        let device = Default::default();
        let unet = small_unet();
        let (xs, ts) = inputs(2);

        let err = unet
            .forward(xs, int_tensor(&[0, 1], &device), ts, float_tensor(&[0.0, 0.5], &device))
            .unwrap_err();

        assert_eq!(err, DdpmError::InvalidContextMask { value: 0.5 });
    }

    #[test]
    fn test_rejects_image_size_not_multiple_of_four() {
        let err = ContextUnetConfig::new(3)
            .with_image_size(30)
            .init::<TestBackend>(&Default::default())
            .unwrap_err();

        assert_eq!(err, DdpmError::InvalidImageSize(30));
    }

    #[test]
    fn test_rejects_feature_width_not_multiple_of_eight() {
        for n_feat in [0, 12] {
            let err = ContextUnetConfig::new(3)
                .with_n_feat(n_feat)
                .with_image_size(8)
                .init::<TestBackend>(&Default::default())
                .unwrap_err();

            assert_eq!(err, DdpmError::InvalidFeatureWidth(n_feat));
        }
    }
}
