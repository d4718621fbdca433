//! Core Building Blocks for Trajectory Diffusion Models
//!
//! This crate provides shared components used by the temporal U-Net, the
//! value network and the diffusion process.
//!
//! # Modules
//!
//! - [`error`] - Configuration and shape errors
//! - [`groupnorm`] - Group normalization over `[batch, channels, length]`
//! - [`mish`] - Mish activation with an overflow-free softplus
//!
//! # Example
//!
//! ```ignore
//! use diffuser_core::groupnorm::GroupNorm;
//! use diffuser_core::mish::mish;
//!
//! let norm = GroupNorm::new(8, 64, &device)?;
//! let h = mish(norm.forward(h));
//! ```

pub mod error;
pub mod groupnorm;
pub mod mish;

pub use error::{ConfigError, DiffusionError, ShapeError};
