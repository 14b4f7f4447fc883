use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::{Data, Int, Shape, Tensor};
use image::{ImageResult, Rgb, RgbImage};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::DdpmError;

/// Draws a standard Gaussian tensor from `rng`.
pub fn randn<B: Backend, const D: usize, R: Rng + ?Sized>(
    rng: &mut R,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let num_elements = shape.iter().product();
    let values: Vec<f32> = (0..num_elements)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();

    Tensor::from_data(Data::new(values, Shape::new(shape)).convert(), device)
}

pub(crate) fn int_tensor<B: Backend>(values: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    let data = Data::new(values.to_vec(), Shape::new([values.len()]));
    Tensor::from_data(data.convert(), device)
}

pub(crate) fn float_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 1> {
    let data = Data::new(values.to_vec(), Shape::new([values.len()]));
    Tensor::from_data(data.convert(), device)
}

/// Lifts one scalar per example, shape `[batch]`, to `[batch, 1, 1, 1]` so it
/// scales every channel and pixel of that example and nothing else.
pub fn per_example<B: Backend>(coefficients: Tensor<B, 1>) -> Tensor<B, 4> {
    let [batch] = coefficients.dims();
    coefficients.reshape([batch, 1, 1, 1])
}

/// One-hot encodes class labels into a `[batch, n_classes]` tensor.
pub fn one_hot<B: Backend>(
    labels: Tensor<B, 1, Int>,
    n_classes: usize,
) -> Result<Tensor<B, 2>, DdpmError> {
    let device = labels.device();
    let labels = labels.into_data().convert::<i64>().value;
    let mut encoded = vec![0f32; labels.len() * n_classes];

    for (row, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= n_classes {
            return Err(DdpmError::InvalidLabel { label, n_classes });
        }
        encoded[row * n_classes + label as usize] = 1.0;
    }

    let data = Data::new(encoded, Shape::new([labels.len(), n_classes]));
    Ok(Tensor::from_data(data.convert(), &device))
}

/// Writes a batch of `[N, C, H, W]` images in `[0, 1]` as a grid with `nrow`
/// images per row and a two pixel black border around each image.
pub fn save_image_grid<B: Backend, P: AsRef<Path>>(
    images: Tensor<B, 4>,
    nrow: usize,
    path: P,
) -> ImageResult<()> {
    const PADDING: usize = 2;

    let [n, channels, height, width] = images.dims();
    let values = images.into_data().convert::<f32>().value;

    let ncol = nrow.min(n).max(1);
    let nrows = (n + ncol - 1) / ncol;
    let (cell_h, cell_w) = (height + PADDING, width + PADDING);
    let mut grid = RgbImage::new(
        (ncol * cell_w + PADDING) as u32,
        (nrows * cell_h + PADDING) as u32,
    );

    for k in 0..n {
        let (row, col) = (k / ncol, k % ncol);
        for y in 0..height {
            for x in 0..width {
                // Single channel images are replicated over RGB.
                let pixel = |c: usize| {
                    let c = c.min(channels - 1);
                    let value = values[((k * channels + c) * height + y) * width + x];
                    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
                };
                grid.put_pixel(
                    (col * cell_w + PADDING + x) as u32,
                    (row * cell_h + PADDING + y) as u32,
                    Rgb([pixel(0), pixel(1), pixel(2)]),
                );
            }
        }
    }

    grid.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_randn_is_reproducible() {
        let device = Default::default();

        let a: Tensor<TestBackend, 4> = randn(&mut StdRng::seed_from_u64(7), [2, 3, 4, 4], &device);
        let b: Tensor<TestBackend, 4> = randn(&mut StdRng::seed_from_u64(7), [2, 3, 4, 4], &device);
        let c: Tensor<TestBackend, 4> = randn(&mut StdRng::seed_from_u64(8), [2, 3, 4, 4], &device);

        assert_eq!(a.dims(), [2, 3, 4, 4]);
        let a = a.into_data().convert::<f32>().value;
        assert_eq!(a, b.into_data().convert::<f32>().value);
        assert_ne!(a, c.into_data().convert::<f32>().value);
    }

    #[test]
    fn test_randn_moments() {
        let device = Default::default();
        let xs: Tensor<TestBackend, 1> = randn(&mut StdRng::seed_from_u64(0), [20_000], &device);

        let mean = xs.clone().mean().into_scalar();
        let var = xs.powf_scalar(2.0).mean().into_scalar() - mean * mean;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn test_one_hot() {
        let device = Default::default();
        let labels = int_tensor::<TestBackend>(&[2, 0, 1], &device);

        let encoded = one_hot(labels, 3).unwrap();

        assert_eq!(encoded.dims(), [3, 3]);
        encoded.to_data().assert_approx_eq(
            &Data::from([[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]),
            3,
        );
    }

    #[test]
    fn test_one_hot_rejects_out_of_range_labels() {
        let device = Default::default();

        let err = one_hot(int_tensor::<TestBackend>(&[0, 10], &device), 10).unwrap_err();
        assert_eq!(err, DdpmError::InvalidLabel { label: 10, n_classes: 10 });

        let err = one_hot(int_tensor::<TestBackend>(&[-1], &device), 10).unwrap_err();
        assert_eq!(err, DdpmError::InvalidLabel { label: -1, n_classes: 10 });
    }

    #[test]
    fn test_per_example_scales_whole_example() {
        let device = Default::default();
        let xs = Tensor::<TestBackend, 4>::ones([2, 3, 2, 2], &device);
        let scale = float_tensor::<TestBackend>(&[2.0, -1.0], &device);

        let scaled = per_example(scale) * xs;

        assert_eq!(scaled.dims(), [2, 3, 2, 2]);
        let values = scaled.into_data().convert::<f32>().value;
        assert!(values[..12].iter().all(|&v| v == 2.0));
        assert!(values[12..].iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_save_image_grid() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([3, 3, 4, 4], &device);
        let path = std::env::temp_dir().join("ddpm_burn_test_grid.png");

        save_image_grid(images, 2, &path).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        // Two images per row, two rows, two pixel padding.
        assert_eq!(grid.dimensions(), (2 * 6 + 2, 2 * 6 + 2));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(2, 2), &Rgb([255, 255, 255]));
        // The fourth cell is empty.
        assert_eq!(grid.get_pixel(8, 8), &Rgb([0, 0, 0]));
        std::fs::remove_file(path).ok();
    }
}
