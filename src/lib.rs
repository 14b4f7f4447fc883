//! # Class-conditional DDPM
//!
//! Denoising diffusion with classifier-free guidance on small labelled images,
//! built on [Burn](https://github.com/burn-rs/burn): a noise schedule, a
//! conditional UNet denoiser, the training objective, guided sampling and the
//! training loop that ties them to a dataset.

pub mod data;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod training;
pub mod utils;

pub use error::DdpmError;

#[cfg(all(test, feature = "ndarray"))]
use burn::backend::ndarray;

#[cfg(all(test, feature = "torch", not(feature = "ndarray")))]
use burn::backend::libtorch;

#[cfg(all(test, feature = "wgpu", not(any(feature = "ndarray", feature = "torch"))))]
use burn::backend::wgpu;

extern crate alloc;

#[cfg(all(test, feature = "ndarray"))]
pub type TestBackend = ndarray::NdArray<f32>;

#[cfg(all(test, feature = "torch", not(feature = "ndarray")))]
pub type TestBackend = libtorch::LibTorch<f32>;

#[cfg(all(
    test,
    feature = "wgpu",
    not(any(feature = "ndarray", feature = "torch")),
    not(target_os = "macos")
))]
pub type TestBackend = wgpu::Wgpu<wgpu::Vulkan, f32, i32>;

#[cfg(all(
    test,
    feature = "wgpu",
    not(any(feature = "ndarray", feature = "torch")),
    target_os = "macos"
))]
pub type TestBackend = wgpu::Wgpu<wgpu::Metal, f32, i32>;

#[cfg(test)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
