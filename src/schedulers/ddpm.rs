use burn::module::{Module, Param};
use burn::tensor::{backend::Backend, Data, Int, Shape, Tensor};

use crate::error::DdpmError;

/// Pre-computed coefficients of a linear beta schedule.
///
/// Every sequence has `n_t + 1` entries and is indexed by the diffusion step
/// `t ∈ [0, n_t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    n_t: usize,
    alpha_t: Vec<f64>,
    oneover_sqrta: Vec<f64>,
    sqrt_beta_t: Vec<f64>,
    alphabar_t: Vec<f64>,
    sqrtab: Vec<f64>,
    sqrtmab: Vec<f64>,
    mab_over_sqrtmab: Vec<f64>,
}

/// The three coefficients used by one reverse step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCoefficients {
    /// `1/\sqrt{\alpha_t}`
    pub oneover_sqrta: f64,
    /// `(1-\alpha_t)/\sqrt{1-\bar{\alpha}_t}`
    pub mab_over_sqrtmab: f64,
    /// `\sqrt{\beta_t}`
    pub sqrt_beta_t: f64,
}

impl NoiseSchedule {
    /// Builds the schedule for `beta_t` linearly interpolated between `beta1`
    /// (at `t = 0`) and `beta2` (at `t = n_t`).
    pub fn new(beta1: f64, beta2: f64, n_t: usize) -> Result<Self, DdpmError> {
        // Written so that NaN bounds are rejected too.
        let valid = beta1 > 0.0 && beta1 < beta2 && beta2 < 1.0 && n_t >= 1;
        if !valid {
            return Err(DdpmError::InvalidSchedule { beta1, beta2, n_t });
        }

        let len = n_t + 1;
        let mut schedule = Self {
            n_t,
            alpha_t: Vec::with_capacity(len),
            oneover_sqrta: Vec::with_capacity(len),
            sqrt_beta_t: Vec::with_capacity(len),
            alphabar_t: Vec::with_capacity(len),
            sqrtab: Vec::with_capacity(len),
            sqrtmab: Vec::with_capacity(len),
            mab_over_sqrtmab: Vec::with_capacity(len),
        };

        // \bar{\alpha}_t is accumulated in log space rather than as a running product.
        let mut log_alphabar = 0.0;
        for t in 0..len {
            let beta = (beta2 - beta1) * t as f64 / n_t as f64 + beta1;
            let alpha = 1.0 - beta;
            log_alphabar += alpha.ln();
            let alphabar = log_alphabar.exp();
            let sqrtmab = (1.0 - alphabar).sqrt();

            schedule.alpha_t.push(alpha);
            schedule.oneover_sqrta.push(1.0 / alpha.sqrt());
            schedule.sqrt_beta_t.push(beta.sqrt());
            schedule.alphabar_t.push(alphabar);
            schedule.sqrtab.push(alphabar.sqrt());
            schedule.sqrtmab.push(sqrtmab);
            schedule.mab_over_sqrtmab.push((1.0 - alpha) / sqrtmab);
        }

        Ok(schedule)
    }

    /// Number of diffusion steps `T`.
    pub fn n_t(&self) -> usize {
        self.n_t
    }

    pub fn alpha_t(&self) -> &[f64] {
        &self.alpha_t
    }

    pub fn oneover_sqrta(&self) -> &[f64] {
        &self.oneover_sqrta
    }

    pub fn sqrt_beta_t(&self) -> &[f64] {
        &self.sqrt_beta_t
    }

    pub fn alphabar_t(&self) -> &[f64] {
        &self.alphabar_t
    }

    pub fn sqrtab(&self) -> &[f64] {
        &self.sqrtab
    }

    pub fn sqrtmab(&self) -> &[f64] {
        &self.sqrtmab
    }

    pub fn mab_over_sqrtmab(&self) -> &[f64] {
        &self.mab_over_sqrtmab
    }

    /// Coefficients of the reverse update at step `t ∈ [1, n_t]`.
    pub fn step(&self, t: usize) -> Result<StepCoefficients, DdpmError> {
        self.check_timestep(t)?;
        Ok(StepCoefficients {
            oneover_sqrta: self.oneover_sqrta[t],
            mab_over_sqrtmab: self.mab_over_sqrtmab[t],
            sqrt_beta_t: self.sqrt_beta_t[t],
        })
    }

    fn check_timestep(&self, t: usize) -> Result<(), DdpmError> {
        if (1..=self.n_t).contains(&t) {
            Ok(())
        } else {
            Err(DdpmError::InvalidTimestep {
                timestep: t,
                n_t: self.n_t,
            })
        }
    }
}

/// Device copy of a [NoiseSchedule](NoiseSchedule), stored in module records so
/// a checkpoint carries the coefficients it was trained with.
///
/// The buffers are never trained: every read goes through `detach`.
#[derive(Module, Debug)]
pub struct ScheduleBuffers<B: Backend> {
    alpha_t: Param<Tensor<B, 1>>,
    oneover_sqrta: Param<Tensor<B, 1>>,
    sqrt_beta_t: Param<Tensor<B, 1>>,
    alphabar_t: Param<Tensor<B, 1>>,
    sqrtab: Param<Tensor<B, 1>>,
    sqrtmab: Param<Tensor<B, 1>>,
    mab_over_sqrtmab: Param<Tensor<B, 1>>,
}

impl<B: Backend> ScheduleBuffers<B> {
    pub fn new(schedule: &NoiseSchedule, device: &B::Device) -> Self {
        let buffer = |values: &[f64]| -> Param<Tensor<B, 1>> {
            let data = Data::new(values.to_vec(), Shape::new([values.len()]));
            Param::from_tensor(Tensor::from_data(data.convert(), device))
        };

        Self {
            alpha_t: buffer(schedule.alpha_t()),
            oneover_sqrta: buffer(schedule.oneover_sqrta()),
            sqrt_beta_t: buffer(schedule.sqrt_beta_t()),
            alphabar_t: buffer(schedule.alphabar_t()),
            sqrtab: buffer(schedule.sqrtab()),
            sqrtmab: buffer(schedule.sqrtmab()),
            mab_over_sqrtmab: buffer(schedule.mab_over_sqrtmab()),
        }
        .no_grad()
    }

    pub fn n_t(&self) -> usize {
        self.sqrtab.val().dims()[0] - 1
    }

    /// `\sqrt{\bar{\alpha}_t}` for each entry of `timesteps`.
    pub fn sqrtab_at(&self, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.sqrtab.val().detach().select(0, timesteps)
    }

    /// `\sqrt{1-\bar{\alpha}_t}` for each entry of `timesteps`.
    pub fn sqrtmab_at(&self, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.sqrtmab.val().detach().select(0, timesteps)
    }

    /// Reads the stored coefficients back to the host.
    pub fn to_schedule(&self) -> NoiseSchedule {
        let host = |buffer: &Param<Tensor<B, 1>>| -> Vec<f64> {
            buffer.val().detach().into_data().convert::<f64>().value
        };

        NoiseSchedule {
            n_t: self.n_t(),
            alpha_t: host(&self.alpha_t),
            oneover_sqrta: host(&self.oneover_sqrta),
            sqrt_beta_t: host(&self.sqrt_beta_t),
            alphabar_t: host(&self.alphabar_t),
            sqrtab: host(&self.sqrtab),
            sqrtmab: host(&self.sqrtmab),
            mab_over_sqrtmab: host(&self.mab_over_sqrtmab),
        }
    }
}
