//! Gaussian Diffusion over Trajectories
//!
//! This crate implements the denoising diffusion process used to plan
//! fixed-horizon state/action trajectories.
//!
//! # Components
//!
//! - [`Schedule`] - Cosine beta schedule and every derived coefficient
//! - [`apply_conditioning`] - Pins known observations inside a trajectory
//! - [`GaussianDiffusion`] - Forward noising, reverse sampling, training loss
//! - [`WeightedLoss`], [`ValueLoss`] - Training objectives
//! - [`Ema`] - Exponential moving average of model weights
//! - [`SeededNoise`] - Reproducible random source
//!
//! # Example
//!
//! ```ignore
//! use diffuser_diffusion::{temporal_unet_diffusion, Conditions, DiffusionConfig, SeededNoise};
//! use diffuser_unet::TemporalUnetConfig;
//!
//! let config = DiffusionConfig::new(32, observation_dim, action_dim);
//! let unet = TemporalUnetConfig::new(32, config.transition_dim());
//! let diffusion = temporal_unet_diffusion::<Backend>(&config, &unet, &device)?;
//!
//! let mut rng = SeededNoise::new(0);
//! let mut cond = Conditions::new();
//! cond.insert(0, current_observation);
//! let plan = diffusion.conditional_sample(&cond, None, &mut rng)?;
//! ```

pub mod conditioning;
pub mod ema;
pub mod gaussian;
pub mod loss;
pub mod noise;
pub mod schedule;
pub mod value_loss;

pub use conditioning::{apply_conditioning, Conditions};
pub use ema::{Ema, EmaConfig, EmaUpdate};
pub use gaussian::{
    temporal_unet_diffusion, Denoiser, DiffusionConfig, GaussianDiffusion, Posterior, PredictionType,
};
pub use loss::{loss_weights, ElementwiseLoss, LossResult, LossType, WeightedLoss, L1, L2};
pub use noise::{NoiseSource, SeededNoise};
pub use schedule::{cosine_betas, extract, Schedule};
pub use value_loss::ValueLoss;

pub use diffuser_core::error::{ConfigError, DiffusionError, ShapeError};
