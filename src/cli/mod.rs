pub mod sample;
pub mod train;

#[cfg(feature = "wgpu")]
pub type CliBackend = burn::backend::Wgpu;

#[cfg(all(feature = "torch", not(feature = "wgpu")))]
pub type CliBackend = burn::backend::LibTorch<f32>;

#[cfg(all(feature = "ndarray", not(any(feature = "wgpu", feature = "torch"))))]
pub type CliBackend = burn::backend::NdArray<f32>;

pub type CliAutodiffBackend = burn::backend::Autodiff<CliBackend>;
