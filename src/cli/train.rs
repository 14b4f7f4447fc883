use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::optim::AdamConfig;
use clap::Args;
use ddpm_burn::data::DigitDataset;
use ddpm_burn::models::ContextUnetConfig;
use ddpm_burn::pipelines::DdpmConfig;
use ddpm_burn::training::{train, TrainingConfig};
use tracing::info;

use super::CliAutodiffBackend;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory holding the training PNG images.
    #[arg(long, value_name = "DIR", default_value = "hw2_data/digits/svhn/data")]
    data_dir: PathBuf,

    /// CSV file with an `image_name,label` header and one row per image.
    #[arg(long, value_name = "FILE", default_value = "hw2_data/digits/svhn/train.csv")]
    labels: PathBuf,

    /// Where the config, checkpoints and sample grids are written.
    #[arg(long, value_name = "DIR", default_value = "artifacts")]
    artifact_dir: PathBuf,

    #[arg(long, default_value_t = 100)]
    n_epoch: usize,

    #[arg(long, default_value_t = 512)]
    batch_size: usize,

    #[arg(long, default_value_t = 2e-4)]
    lrate: f64,

    /// Base feature width of the denoiser.
    #[arg(long, default_value_t = 256)]
    n_feat: usize,

    #[arg(long, default_value_t = 10)]
    n_classes: usize,

    /// Side of the square training images; must be a multiple of 4.
    #[arg(long, default_value_t = 28)]
    image_size: usize,

    /// Number of diffusion steps.
    #[arg(long, default_value_t = 500)]
    n_t: usize,

    /// Probability of dropping the class context of a training example.
    #[arg(long, default_value_t = 0.2)]
    drop_prob: f64,

    /// Guidance weights of the per-epoch sample grids.
    #[arg(long, value_delimiter = ',', default_value = "0.0,0.5,2.0")]
    guide_weights: Vec<f64>,

    #[arg(long, default_value_t = 5)]
    num_workers: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

pub fn handle_train(args: &TrainArgs) -> Result<()> {
    let device = Default::default();

    let denoiser = ContextUnetConfig::new(3)
        .with_n_feat(args.n_feat)
        .with_n_classes(args.n_classes)
        .with_image_size(args.image_size);
    let ddpm = DdpmConfig::new(denoiser)
        .with_n_t(args.n_t)
        .with_drop_prob(args.drop_prob);
    let config = TrainingConfig::new(ddpm, AdamConfig::new(), args.guide_weights.clone())
        .with_n_epoch(args.n_epoch)
        .with_batch_size(args.batch_size)
        .with_lrate(args.lrate)
        .with_num_workers(args.num_workers)
        .with_seed(args.seed);

    let dataset = DigitDataset::new(&args.data_dir, &args.labels, args.image_size)
        .with_context(|| format!("failed to load {}", args.data_dir.display()))?;

    train::<CliAutodiffBackend>(&args.artifact_dir, &config, dataset, &device)?;
    info!("training done, artifacts in {}", args.artifact_dir.display());

    Ok(())
}
