//! # Schedulers
//!
//! Per-timestep coefficients of the forward noising process.

pub mod ddpm;

pub use ddpm::{NoiseSchedule, ScheduleBuffers, StepCoefficients};
