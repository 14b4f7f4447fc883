//! Denoising Diffusion Probabilistic Models with classifier-free guidance.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho and al, 2020.
//! https://arxiv.org/abs/2006.11239
//!
//! Classifier-Free Diffusion Guidance, J. Ho and T. Salimans, 2022.
//! https://arxiv.org/abs/2207.12598

use std::path::Path;

use alloc::vec;

use burn::config::Config;
use burn::module::Module;
use burn::nn::loss::{MseLoss, Reduction};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use rand::Rng;
use tracing::debug;

use crate::error::{ensure_dims, DdpmError};
use crate::models::{ContextUnet, ContextUnetConfig};
use crate::schedulers::{NoiseSchedule, ScheduleBuffers, StepCoefficients};
use crate::utils::{float_tensor, int_tensor, per_example, randn};

/// Steps below this one are always kept in the sampling history.
const HISTORY_TAIL: usize = 8;
/// Cadence of the sampling history snapshots.
const HISTORY_EVERY: usize = 20;

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Config, Debug)]
pub struct DdpmConfig {
    pub denoiser: ContextUnetConfig,
    /// `beta_t` at `t = 0`.
    #[config(default = 1e-4)]
    pub beta1: f64,
    /// `beta_t` at `t = n_t`.
    #[config(default = 0.02)]
    pub beta2: f64,
    /// Number of diffusion steps `T`.
    #[config(default = 500)]
    pub n_t: usize,
    /// Probability of dropping the class context of a training example.
    #[config(default = 0.1)]
    pub drop_prob: f64,
}

impl DdpmConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Ddpm<B>, DdpmError> {
        if !(0.0..=1.0).contains(&self.drop_prob) {
            return Err(DdpmError::InvalidDropProbability(self.drop_prob));
        }
        let schedule = NoiseSchedule::new(self.beta1, self.beta2, self.n_t)?;

        Ok(Ddpm {
            nn_model: self.denoiser.init(device)?,
            schedule: ScheduleBuffers::new(&schedule, device),
            n_t: self.n_t,
            drop_prob: self.drop_prob,
        })
    }
}

/// The diffusion process: forward noising for training and guided reverse
/// denoising for generation.
#[derive(Module, Debug)]
pub struct Ddpm<B: Backend> {
    nn_model: ContextUnet<B>,
    schedule: ScheduleBuffers<B>,
    n_t: usize,
    drop_prob: f64,
}

/// An intermediate sampling state kept for visualization.
#[derive(Debug, Clone)]
pub struct Snapshot<B: Backend> {
    pub timestep: usize,
    pub xt: Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub struct SampleOutput<B: Backend> {
    /// Final samples, `[n_sample, channels, height, width]`.
    pub samples: Tensor<B, 4>,
    /// Snapshots ordered from `t = T` down to `t = 1`.
    pub history: Vec<Snapshot<B>>,
}

impl<B: Backend> Ddpm<B> {
    pub fn n_t(&self) -> usize {
        self.n_t
    }

    pub fn denoiser(&self) -> &ContextUnet<B> {
        &self.nn_model
    }

    /// Host copy of the coefficients this model was built or loaded with.
    pub fn schedule(&self) -> NoiseSchedule {
        self.schedule.to_schedule()
    }

    /// Training loss on a batch of clean images `x` with class `labels`.
    ///
    /// Draws one timestep in `[1, T]` per example, the Gaussian noise and the
    /// context dropout mask from `rng`, in that order.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>, DdpmError> {
        let [batch, _, _, _] = x.dims();
        let device = x.device();

        let timesteps: Vec<usize> = (0..batch).map(|_| rng.gen_range(1..=self.n_t)).collect();
        let eps = randn(rng, x.dims(), &device);
        let mask: Vec<f32> = (0..batch)
            .map(|_| if rng.gen_bool(self.drop_prob) { 1.0 } else { 0.0 })
            .collect();

        self.forward_with(x, labels, &timesteps, eps, float_tensor(&mask, &device))
    }

    /// Training loss with every random draw supplied by the caller.
    pub fn forward_with(
        &self,
        x: Tensor<B, 4>,
        labels: Tensor<B, 1, Int>,
        timesteps: &[usize],
        eps: Tensor<B, 4>,
        context_mask: Tensor<B, 1>,
    ) -> Result<Tensor<B, 1>, DdpmError> {
        let [batch, _, _, _] = x.dims();
        let device = x.device();

        let x_t = self.noise_images(x, eps.clone(), timesteps)?;
        let t_norm: Vec<f32> = timesteps
            .iter()
            .map(|&t| t as f32 / self.n_t as f32)
            .collect();
        let t_norm = float_tensor(&t_norm, &device).reshape([batch, 1]);

        let eps_pred = self.nn_model.forward(x_t, labels, t_norm, context_mask)?;

        Ok(MseLoss::new().forward(eps_pred, eps, Reduction::Mean))
    }

    /// `x_t = sqrt(alphabar_t) * x + sqrt(1 - alphabar_t) * eps`, one `t` per example.
    pub fn noise_images(
        &self,
        x: Tensor<B, 4>,
        eps: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 4>, DdpmError> {
        let [batch, _, _, _] = x.dims();
        ensure_dims("noise", x.dims(), eps.dims())?;
        ensure_dims("timesteps", [batch], [timesteps.len()])?;

        let mut indices = Vec::with_capacity(batch);
        for &t in timesteps {
            if !(1..=self.n_t).contains(&t) {
                return Err(DdpmError::InvalidTimestep {
                    timestep: t,
                    n_t: self.n_t,
                });
            }
            indices.push(t as i64);
        }
        let indices = int_tensor::<B>(&indices, &x.device());

        let sqrtab = per_example(self.schedule.sqrtab_at(indices.clone()));
        let sqrtmab = per_example(self.schedule.sqrtmab_at(indices));

        Ok(sqrtab * x + sqrtmab * eps)
    }

    /// Generates `n_sample` images of shape `size = [channels, height, width]`.
    ///
    /// Labels cycle through `0..n_classes`, so `n_sample` must be a positive
    /// multiple of the number of classes. `guide_w = 0` samples from the
    /// conditional model only; larger values push further away from the
    /// unconditional prediction.
    ///
    /// Draws the initial noise, then one noise tensor per step for `t > 1`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n_sample: usize,
        size: [usize; 3],
        guide_w: f64,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<SampleOutput<B>, DdpmError> {
        let n_classes = self.nn_model.n_classes();
        if n_sample == 0 || n_sample % n_classes != 0 {
            return Err(DdpmError::SampleCountNotMultiple {
                n_sample,
                n_classes,
            });
        }

        let image_size = self.nn_model.image_size();
        ensure_dims(
            "sample size",
            [self.nn_model.in_channels(), image_size, image_size],
            size,
        )?;

        let schedule = self.schedule.to_schedule();
        let [channels, height, width] = size;
        let shape = [n_sample, channels, height, width];
        let mut xt: Tensor<B, 4> = randn(rng, shape, device);

        // The first half of the doubled batch is conditional, the second half
        // has its context dropped.
        let labels: Vec<i64> = (0..2 * n_sample).map(|i| (i % n_classes) as i64).collect();
        let labels = int_tensor::<B>(&labels, device);
        let mask: Vec<f32> = (0..2 * n_sample)
            .map(|i| if i < n_sample { 0.0 } else { 1.0 })
            .collect();
        let context_mask = float_tensor::<B>(&mask, device);

        let mut history = Vec::new();
        for t in (1..=self.n_t).rev() {
            debug!("sampling timestep {t}");
            let t_is = Tensor::<B, 2>::ones([2 * n_sample, 1], device)
                .mul_scalar(t as f64 / self.n_t as f64);
            let z = (t > 1).then(|| randn(rng, shape, device));

            let xt_doubled = Tensor::cat(vec![xt.clone(), xt.clone()], 0);
            let eps = self
                .nn_model
                .forward(xt_doubled, labels.clone(), t_is, context_mask.clone())?;
            let eps_cond = eps.clone().slice([0..n_sample]);
            let eps_uncond = eps.slice([n_sample..2 * n_sample]);
            let eps = guide(eps_cond, eps_uncond, guide_w);

            xt = reverse_step(xt, eps, schedule.step(t)?, z).detach();
            if is_snapshot_step(t, self.n_t) {
                history.push(Snapshot {
                    timestep: t,
                    xt: xt.clone(),
                });
            }
        }

        Ok(SampleOutput {
            samples: xt,
            history,
        })
    }

    /// Writes the denoiser weights and the schedule coefficients to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DdpmError> {
        let path = path.as_ref();
        self.clone()
            .save_file(path.to_path_buf(), &CheckpointRecorder::new())
            .map_err(|err| checkpoint_error(path, err))
    }

    /// Builds a model from `config` and loads the weights and coefficients
    /// stored at `path`.
    pub fn load<P: AsRef<Path>>(
        config: &DdpmConfig,
        path: P,
        device: &B::Device,
    ) -> Result<Self, DdpmError> {
        let path = path.as_ref();
        config
            .init(device)?
            .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)
            .map_err(|err| checkpoint_error(path, err))
    }
}

fn checkpoint_error(path: &Path, err: impl core::fmt::Debug) -> DdpmError {
    DdpmError::Checkpoint {
        path: path.display().to_string(),
        reason: format!("{err:?}"),
    }
}

/// Classifier-free guidance: `(1 + w) * eps_cond - w * eps_uncond`.
pub fn guide<B: Backend>(
    eps_cond: Tensor<B, 4>,
    eps_uncond: Tensor<B, 4>,
    guide_w: f64,
) -> Tensor<B, 4> {
    eps_cond.mul_scalar(1.0 + guide_w) - eps_uncond.mul_scalar(guide_w)
}

/// One reverse update from `x_t` to `x_{t-1}`. `z` is `None` on the last step,
/// which then adds no noise at all.
pub fn reverse_step<B: Backend>(
    xt: Tensor<B, 4>,
    eps: Tensor<B, 4>,
    step: StepCoefficients,
    z: Option<Tensor<B, 4>>,
) -> Tensor<B, 4> {
    let mean = (xt - eps.mul_scalar(step.mab_over_sqrtmab)).mul_scalar(step.oneover_sqrta);
    match z {
        Some(z) => mean + z.mul_scalar(step.sqrt_beta_t),
        None => mean,
    }
}

/// Whether the state after step `t` is kept in the sampling history.
pub fn is_snapshot_step(t: usize, n_t: usize) -> bool {
    t % HISTORY_EVERY == 0 || t == n_t || t < HISTORY_TAIL
}
