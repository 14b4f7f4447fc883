//! # Models
//!
//! The conditional UNet used as noise predictor in the diffusion loop.

pub mod embeddings;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;

pub use unet_2d::{ContextUnet, ContextUnetConfig};
