//! # Pipelines
//!
//! Training and generation procedures built on the models and schedulers.

pub mod ddpm;

pub use ddpm::{Ddpm, DdpmConfig, SampleOutput, Snapshot};
