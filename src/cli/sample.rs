use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::config::Config;
use clap::Args;
use ddpm_burn::pipelines::Ddpm;
use ddpm_burn::training::TrainingConfig;
use ddpm_burn::utils::save_image_grid;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use super::CliBackend;

#[derive(Args, Debug)]
pub struct SampleArgs {
    /// Training artifact directory holding `config.json`.
    #[arg(long, value_name = "DIR", default_value = "artifacts")]
    artifact_dir: PathBuf,

    /// Checkpoint name inside the artifact directory, without extension.
    #[arg(long, default_value = "model_99")]
    checkpoint: String,

    /// Images generated per class.
    #[arg(long, default_value_t = 4)]
    samples_per_class: usize,

    /// Strength of the classifier-free guidance.
    #[arg(long, default_value_t = 2.0)]
    guide_w: f64,

    /// The random seed to be used for the generation.
    #[arg(long, default_value_t = 32)]
    seed: u64,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "ddpm_final.png")]
    final_image: PathBuf,

    /// Also write one grid per intermediate sampling snapshot.
    #[arg(long, action)]
    intermediary_images: bool,
}

pub fn handle_sample(args: &SampleArgs) -> Result<()> {
    let device = Default::default();

    let config_path = args.artifact_dir.join("config.json");
    let config = TrainingConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let ddpm = Ddpm::<CliBackend>::load(
        &config.ddpm,
        args.artifact_dir.join(&args.checkpoint),
        &device,
    )?;
    info!("loaded {} ({} steps)", args.checkpoint, ddpm.n_t());

    let mut rng = StdRng::seed_from_u64(args.seed);
    let denoiser = ddpm.denoiser();
    let n_classes = denoiser.n_classes();
    let n_sample = args.samples_per_class * n_classes;
    let size = [denoiser.in_channels(), denoiser.image_size(), denoiser.image_size()];
    let output = ddpm.sample(n_sample, size, args.guide_w, &mut rng, &device)?;

    // Inverted like the training grids.
    let samples = output.samples.neg().add_scalar(1.0);
    save_image_grid(samples, n_classes, &args.final_image)
        .with_context(|| format!("failed to write {}", args.final_image.display()))?;
    info!("saved image at {}", args.final_image.display());

    if args.intermediary_images {
        for snapshot in output.history {
            let path = args
                .final_image
                .with_file_name(format!("history_t{}.png", snapshot.timestep));
            save_image_grid(snapshot.xt.neg().add_scalar(1.0), n_classes, &path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        info!("saved sampling history next to {}", args.final_image.display());
    }

    Ok(())
}
