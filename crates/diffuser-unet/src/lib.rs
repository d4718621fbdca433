//! Temporal Networks for Trajectory Diffusion
//!
//! This crate provides the 1D convolutional networks that operate on
//! fixed-horizon state/action trajectories.
//!
//! # Models
//!
//! - [`TemporalUnet`] - Denoiser predicting injected noise or the clean trajectory
//! - [`TemporalValue`] - Value network scoring noisy trajectories
//!
//! # Building Blocks
//!
//! - [`TimeMlp`] - Sinusoidal timestep embedding + MLP
//! - [`ConvBlock`] - Conv1d -> GroupNorm -> Mish
//! - [`ResidualTemporalBlock`] - Two conv blocks with time injection and a skip path
//! - [`Downsample1d`], [`Upsample1d`] - Temporal resolution scaling
//!
//! # Example
//!
//! ```ignore
//! use diffuser_unet::TemporalUnetConfig;
//!
//! let unet = TemporalUnetConfig::new(32, transition_dim).init::<Backend>(&device)?;
//!
//! // [batch, horizon, transition_dim] in, same shape out
//! let noise_pred = unet.forward(trajectories, timesteps);
//! ```

pub mod blocks;
pub mod temporal_unet;
pub mod temporal_value;

pub use blocks::{
    timestep_embedding, ConvBlock, Downsample1d, ResidualTemporalBlock, TimeMlp, Upsample1d,
};
pub use temporal_unet::{TemporalUnet, TemporalUnetConfig};
pub use temporal_value::{TemporalValue, TemporalValueConfig};
