//! Training loop: Adam with linearly decaying learning rate, per-epoch sample
//! grids and periodic checkpoints.

use std::fs;
use std::path::Path;

use alloc::vec;

use anyhow::{ensure, Context, Result};
use burn::config::Config;
use burn::data::dataloader::DataLoaderBuilder;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::data::{DigitBatch, DigitBatcher, DigitDataset};
use crate::pipelines::{Ddpm, DdpmConfig};
use crate::utils::{int_tensor, save_image_grid};

#[derive(Config)]
pub struct TrainingConfig {
    pub ddpm: DdpmConfig,
    pub optimizer: AdamConfig,
    /// Guidance strengths sampled after every epoch.
    pub guide_weights: Vec<f64>,
    #[config(default = 100)]
    pub n_epoch: usize,
    #[config(default = 512)]
    pub batch_size: usize,
    /// Learning rate of the first epoch.
    #[config(default = 2e-4)]
    pub lrate: f64,
    #[config(default = 5)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 10)]
    pub checkpoint_every: usize,
    /// Generated images per class in the epoch grids.
    #[config(default = 4)]
    pub samples_per_class: usize,
}

impl TrainingConfig {
    /// Rejects settings that would only fail once the first epoch is over.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_epoch > 0, "n_epoch must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.samples_per_class > 0,
            "samples_per_class must be positive to draw the epoch grids"
        );
        ensure!(
            self.guide_weights.iter().all(|w| w.is_finite()),
            "guidance weights must be finite, got {:?}",
            self.guide_weights
        );
        Ok(())
    }
}

/// `lrate * (1 - ep / n_epoch)`
pub fn learning_rate(lrate: f64, ep: usize, n_epoch: usize) -> f64 {
    lrate * (1.0 - ep as f64 / n_epoch as f64)
}

/// Exponential moving average of the training loss, seeded with the first value.
#[derive(Debug, Default, Clone, Copy)]
pub struct LossEma {
    value: Option<f64>,
}

impl LossEma {
    pub fn update(&mut self, loss: f64) -> f64 {
        let value = match self.value {
            None => loss,
            Some(ema) => 0.95 * ema + 0.05 * loss,
        };
        self.value = Some(value);
        value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Trains a model on `dataset`, writing the config, sample grids and
/// checkpoints into `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &TrainingConfig,
    dataset: DigitDataset,
    device: &B::Device,
) -> Result<Ddpm<B>> {
    config.validate()?;
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
    config
        .save(artifact_dir.join("config.json"))
        .context("failed to save the training config")?;

    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut ddpm: Ddpm<B> = config.ddpm.init(device)?;
    let mut optim = config.optimizer.init();

    let image_size = dataset.image_size();
    let mut builder = DataLoaderBuilder::new(DigitBatcher::<B>::new(device.clone(), image_size))
        .batch_size(config.batch_size)
        .shuffle(config.seed);
    if config.num_workers > 0 {
        builder = builder.num_workers(config.num_workers);
    }
    let dataloader = builder.build(dataset);

    for ep in 0..config.n_epoch {
        let lr = learning_rate(config.lrate, ep, config.n_epoch);
        info!("epoch {ep} (lr {lr:.2e})");

        let mut loss_ema = LossEma::default();
        let mut last_batch = None;
        for batch in dataloader.iter() {
            let loss = ddpm.forward(batch.images.clone(), batch.labels.clone(), &mut rng)?;
            let loss_value = loss.clone().into_scalar().elem::<f64>();
            let grads = GradientsParams::from_grads(loss.backward(), &ddpm);
            ddpm = optim.step(lr, ddpm, grads);

            debug!("loss: {:.4}", loss_ema.update(loss_value));
            last_batch = Some(batch);
        }
        if let Some(ema) = loss_ema.value() {
            info!("epoch {ep} loss: {ema:.4}");
        }

        if let Some(batch) = last_batch {
            let batch = DigitBatch {
                images: batch.images.inner(),
                labels: batch.labels.inner(),
            };
            write_epoch_grids(&ddpm.valid(), &batch, config, ep, artifact_dir, &mut rng)?;
        }

        let periodic = config.checkpoint_every > 0 && ep % config.checkpoint_every == 0;
        if periodic || ep + 1 == config.n_epoch {
            let path = artifact_dir.join(format!("model_{ep}"));
            ddpm.save(&path)?;
            info!("saved model at {}", path.display());
        }
    }

    Ok(ddpm)
}

/// Generated images (top rows) followed by real images of the same classes
/// (bottom rows), one grid per guidance weight.
fn write_epoch_grids<B: Backend, R: Rng + ?Sized>(
    ddpm: &Ddpm<B>,
    batch: &DigitBatch<B>,
    config: &TrainingConfig,
    ep: usize,
    artifact_dir: &Path,
    rng: &mut R,
) -> Result<()> {
    let device = batch.images.device();
    let [_, channels, height, width] = batch.images.dims();
    let n_classes = config.ddpm.denoiser.n_classes;
    let n_sample = config.samples_per_class * n_classes;
    let x_real = real_images_by_class(
        &batch.images,
        &batch.labels,
        n_classes,
        config.samples_per_class,
    );

    for &w in &config.guide_weights {
        let output = ddpm.sample(n_sample, [channels, height, width], w, rng, &device)?;
        let x_all = Tensor::cat(vec![output.samples, x_real.clone()], 0);

        let path = artifact_dir.join(grid_file_name(ep, w));
        save_image_grid(x_all.neg().add_scalar(1.0), n_classes, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("saved image at {}", path.display());
    }

    Ok(())
}

/// `image_ep{ep}_w{w}.png`, with the weight always written with a decimal
/// point (`w0.0`, `w0.5`, `w2.0`).
pub fn grid_file_name(ep: usize, guide_w: f64) -> String {
    format!("image_ep{ep}_w{guide_w:?}.png")
}

/// Picks `per_class` real images of every class, laid out like the sample
/// grid: slot `k + j * n_classes` holds the `j`-th image of class `k`, or the
/// first image of the batch when the class has fewer than `j + 1` images.
pub fn real_images_by_class<B: Backend>(
    images: &Tensor<B, 4>,
    labels: &Tensor<B, 1, Int>,
    n_classes: usize,
    per_class: usize,
) -> Tensor<B, 4> {
    let labels = labels.to_data().convert::<i64>().value;
    let mut indices = vec![0i64; n_classes * per_class];

    for k in 0..n_classes {
        let matching = labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == k as i64)
            .map(|(index, _)| index as i64);
        for (j, index) in matching.take(per_class).enumerate() {
            indices[k + j * n_classes] = index;
        }
    }

    images.clone().select(0, int_tensor(&indices, &images.device()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_digits;
    use crate::models::ContextUnetConfig;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::Data;

    #[test]
    fn test_learning_rate_decays_linearly() {
        assert_eq!(learning_rate(2e-4, 0, 100), 2e-4);
        assert!((learning_rate(2e-4, 50, 100) - 1e-4).abs() < 1e-18);
        assert!((learning_rate(2e-4, 99, 100) - 2e-6).abs() < 1e-18);
    }

    #[test]
    fn test_loss_ema() {
        let mut ema = LossEma::default();
        assert_eq!(ema.value(), None);

        assert_eq!(ema.update(1.0), 1.0);
        assert!((ema.update(2.0) - 1.05).abs() < 1e-12);
        assert!((ema.value().unwrap() - 1.05).abs() < 1e-12);
    }

    #[test]
    fn test_grid_file_name() {
        assert_eq!(grid_file_name(0, 0.0), "image_ep0_w0.0.png");
        assert_eq!(grid_file_name(3, 0.5), "image_ep3_w0.5.png");
        assert_eq!(grid_file_name(12, 2.0), "image_ep12_w2.0.png");
    }

    #[test]
    fn test_train_rejects_empty_sample_grid_before_training() {
        let (image_dir, csv_path) = write_digits("ddpm_burn_test_training_invalid", 2, 8);
        let dataset = DigitDataset::new(&image_dir, &csv_path, 8).unwrap();
        let artifact_dir = std::env::temp_dir().join("ddpm_burn_test_training_invalid_artifacts");
        fs::remove_dir_all(&artifact_dir).ok();
        let ddpm = DdpmConfig::new(ContextUnetConfig::new(3).with_n_feat(8).with_image_size(8))
            .with_n_t(5);
        let config = TrainingConfig::new(ddpm, AdamConfig::new(), vec![0.0])
            .with_n_epoch(1)
            .with_num_workers(0)
            .with_samples_per_class(0);

        let err = train::<TestAutodiffBackend>(&artifact_dir, &config, dataset, &Default::default())
            .unwrap_err();

        assert!(err.to_string().contains("samples_per_class"));
        assert!(!artifact_dir.exists());
    }

    #[test]
    fn test_real_images_by_class() {
        let device = Default::default();
        // Image `i` is filled with the value `i`.
        let images = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0, 3.0, 4.0], &device)
            .reshape([5, 1, 1, 1]);
        let labels = int_tensor::<TestBackend>(&[1, 0, 1, 2, 0], &device);

        let real = real_images_by_class(&images, &labels, 3, 2);

        assert_eq!(real.dims(), [6, 1, 1, 1]);
        real.reshape([6]).into_data().assert_approx_eq(
            &Data::from([1.0, 0.0, 3.0, 4.0, 2.0, 0.0]),
            3,
        );
    }

    #[test]
    fn test_train_writes_artifacts() {
        let (image_dir, csv_path) = write_digits("ddpm_burn_test_training", 10, 8);
        let dataset = DigitDataset::new(&image_dir, &csv_path, 8).unwrap();
        let artifact_dir = std::env::temp_dir().join("ddpm_burn_test_training_artifacts");
        let ddpm = DdpmConfig::new(ContextUnetConfig::new(3).with_n_feat(8).with_image_size(8))
            .with_n_t(5)
            .with_drop_prob(0.2);
        let config = TrainingConfig::new(ddpm, AdamConfig::new(), vec![0.0, 2.0])
            .with_n_epoch(2)
            .with_batch_size(4)
            .with_num_workers(0)
            .with_samples_per_class(1);

        let model = train::<TestAutodiffBackend>(&artifact_dir, &config, dataset, &Default::default())
            .unwrap();

        assert_eq!(model.n_t(), 5);
        for file in [
            "config.json",
            "model_0.mpk",
            "model_1.mpk",
            "image_ep0_w0.0.png",
            "image_ep1_w2.0.png",
        ] {
            assert!(artifact_dir.join(file).exists(), "missing {file}");
        }
        let saved = TrainingConfig::load(artifact_dir.join("config.json")).unwrap();
        assert_eq!(saved.guide_weights, vec![0.0, 2.0]);
        assert_eq!(saved.ddpm.n_t, 5);

        fs::remove_dir_all(artifact_dir).ok();
    }
}
