//! Gaussian diffusion over state/action trajectories
//!
//! Owns the noise schedule and the denoiser, and implements the forward
//! (noising) process, the reverse sampling chain and the training loss.
//! Conditioning is enforced purely by masking the trajectory around every
//! denoiser evaluation.

use std::collections::BTreeMap;

use burn::prelude::*;

use diffuser_core::error::{ConfigError, DiffusionError, ShapeError};
use diffuser_unet::TemporalUnet;

use crate::conditioning::{apply_conditioning, Conditions};
use crate::loss::{LossResult, LossType, WeightedLoss};
use crate::noise::NoiseSource;
use crate::schedule::{extract, Schedule, DEFAULT_OFFSET};

/// Network that denoises trajectories
///
/// Output shape must equal the shape of `x`.
pub trait Denoiser<B: Backend> {
    /// Predicts the injected noise (or the clean trajectory) for `x` at timesteps `t`
    fn predict(&self, x: Tensor<B, 3>, cond: &Conditions<B>, t: Tensor<B, 1, Int>) -> Tensor<B, 3>;

    /// Rejects trajectory lengths the network cannot process
    fn validate_horizon(&self, _horizon: usize) -> Result<(), ShapeError> {
        Ok(())
    }
}

impl<B: Backend> Denoiser<B> for TemporalUnet<B> {
    /// Conditions are accepted but not consumed by the network body
    fn predict(&self, x: Tensor<B, 3>, _cond: &Conditions<B>, t: Tensor<B, 1, Int>) -> Tensor<B, 3> {
        self.forward(x, t.float())
    }

    fn validate_horizon(&self, horizon: usize) -> Result<(), ShapeError> {
        let factor = self.horizon_factor();
        if horizon % factor != 0 {
            return Err(ShapeError::HorizonNotDivisible { horizon, factor });
        }
        Ok(())
    }
}

/// What the denoiser output represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// The noise that was injected into the clean trajectory
    #[default]
    Epsilon,
    /// The clean trajectory itself
    Sample,
}

/// Diffusion process configuration
#[derive(Debug, Clone)]
pub struct DiffusionConfig {
    /// Trajectory length
    pub horizon: usize,
    /// Observation channels per timestep
    pub observation_dim: usize,
    /// Action channels per timestep, stored before the observation
    pub action_dim: usize,
    /// Number of diffusion steps
    pub num_steps: usize,
    /// Offset `s` of the cosine schedule
    pub schedule_offset: f64,
    /// Elementwise training loss
    pub loss_type: LossType,
    /// Clip reconstructed trajectories to `[-1, 1]` while sampling
    pub clip_denoised: bool,
    /// What the denoiser predicts
    pub prediction_type: PredictionType,
    /// Loss weight of the first action
    pub action_weight: f32,
    /// Per-timestep loss discount
    pub loss_discount: f32,
    /// Extra loss multipliers keyed by observation channel
    pub loss_weights: BTreeMap<usize, f32>,
}

impl DiffusionConfig {
    /// Defaults: 1000 cosine steps, L1 loss, epsilon prediction, no clipping
    pub fn new(horizon: usize, observation_dim: usize, action_dim: usize) -> Self {
        Self {
            horizon,
            observation_dim,
            action_dim,
            num_steps: 1000,
            schedule_offset: DEFAULT_OFFSET,
            loss_type: LossType::L1,
            clip_denoised: false,
            prediction_type: PredictionType::Epsilon,
            action_weight: 1.0,
            loss_discount: 1.0,
            loss_weights: BTreeMap::new(),
        }
    }

    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn with_schedule_offset(mut self, s: f64) -> Self {
        self.schedule_offset = s;
        self
    }

    pub fn with_loss_type(mut self, loss_type: LossType) -> Self {
        self.loss_type = loss_type;
        self
    }

    pub fn with_clip_denoised(mut self, clip_denoised: bool) -> Self {
        self.clip_denoised = clip_denoised;
        self
    }

    pub fn with_prediction_type(mut self, prediction_type: PredictionType) -> Self {
        self.prediction_type = prediction_type;
        self
    }

    pub fn with_action_weight(mut self, action_weight: f32) -> Self {
        self.action_weight = action_weight;
        self
    }

    pub fn with_loss_discount(mut self, loss_discount: f32) -> Self {
        self.loss_discount = loss_discount;
        self
    }

    pub fn with_loss_weights(mut self, loss_weights: BTreeMap<usize, f32>) -> Self {
        self.loss_weights = loss_weights;
        self
    }

    /// `action_dim + observation_dim`
    pub fn transition_dim(&self) -> usize {
        self.action_dim + self.observation_dim
    }

    /// Builds the diffusion process around `model`
    pub fn init<B: Backend, M: Denoiser<B>>(
        &self,
        model: M,
        device: &B::Device,
    ) -> Result<GaussianDiffusion<B, M>, ConfigError> {
        GaussianDiffusion::new(self.clone(), model, device)
    }
}

/// Gaussian over `[batch, 1, 1]`-broadcastable variance and a full mean
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    /// `[batch, horizon, transition_dim]`
    pub mean: Tensor<B, 3>,
    /// `[batch, 1, 1]`
    pub variance: Tensor<B, 3>,
    /// `[batch, 1, 1]`, floored before the log
    pub log_variance: Tensor<B, 3>,
}

/// Denoising diffusion process over fixed-horizon trajectories
#[derive(Debug)]
pub struct GaussianDiffusion<B: Backend, M> {
    model: M,
    schedule: Schedule,
    config: DiffusionConfig,
    loss_fn: WeightedLoss<B>,
}

impl<B: Backend, M: Denoiser<B>> GaussianDiffusion<B, M> {
    /// Computes the schedule and loss weights and takes ownership of `model`
    pub fn new(config: DiffusionConfig, model: M, device: &B::Device) -> Result<Self, ConfigError> {
        if config.horizon == 0 {
            return Err(ConfigError::Zero("horizon"));
        }
        if config.transition_dim() == 0 {
            return Err(ConfigError::Zero("transition_dim"));
        }

        let schedule = Schedule::cosine(config.num_steps, config.schedule_offset)?;
        let loss_fn = WeightedLoss::init(
            config.horizon,
            config.action_dim,
            config.observation_dim,
            config.action_weight,
            config.loss_discount,
            &config.loss_weights,
            config.loss_type,
            device,
        )?;

        tracing::debug!(
            horizon = config.horizon,
            transition_dim = config.transition_dim(),
            num_steps = config.num_steps,
            loss = %config.loss_type,
            prediction = ?config.prediction_type,
            "created gaussian diffusion"
        );

        Ok(Self {
            model,
            schedule,
            config,
            loss_fn,
        })
    }

    pub fn horizon(&self) -> usize {
        self.config.horizon
    }

    pub fn transition_dim(&self) -> usize {
        self.config.transition_dim()
    }

    pub fn action_dim(&self) -> usize {
        self.config.action_dim
    }

    pub fn observation_dim(&self) -> usize {
        self.config.observation_dim
    }

    pub fn num_steps(&self) -> usize {
        self.schedule.num_steps
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn loss_fn(&self) -> &WeightedLoss<B> {
        &self.loss_fn
    }

    /// The owned denoiser
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Releases the owned denoiser
    pub fn into_model(self) -> M {
        self.model
    }

    /// Replaces the denoiser with `f(model)`, e.g. after an optimizer step
    pub fn map_model(self, f: impl FnOnce(M) -> M) -> Self {
        Self {
            model: f(self.model),
            ..self
        }
    }

    fn check_trajectory(&self, x: &Tensor<B, 3>) -> Result<(), ShapeError> {
        let [_, _, transition_dim] = x.dims();
        if transition_dim != self.transition_dim() {
            return Err(ShapeError::TransitionDim {
                expected: self.transition_dim(),
                actual: transition_dim,
            });
        }
        Ok(())
    }

    fn check_timesteps(&self, x: &Tensor<B, 3>, t: &Tensor<B, 1, Int>) -> Result<(), ShapeError> {
        self.check_trajectory(x)?;
        let [batch, _, _] = x.dims();
        let [t_batch] = t.dims();
        if t_batch != batch {
            return Err(ShapeError::TimestepBatch {
                expected: batch,
                actual: t_batch,
            });
        }
        Ok(())
    }

    /// Noises `x_start` to timestep `t` with the given noise
    ///
    /// `x_t = sqrt(ᾱₜ) x₀ + sqrt(1 - ᾱₜ) ε`
    pub fn q_sample(
        &self,
        x_start: Tensor<B, 3>,
        t: Tensor<B, 1, Int>,
        noise: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        self.check_timesteps(&x_start, &t)?;
        if noise.dims() != x_start.dims() {
            return Err(ShapeError::Mismatch {
                pred: noise.dims().to_vec(),
                target: x_start.dims().to_vec(),
            });
        }

        let coef1: Tensor<B, 3> = extract(&self.schedule.sqrt_alphas_cumprod, t.clone());
        let coef2: Tensor<B, 3> = extract(&self.schedule.sqrt_one_minus_alphas_cumprod, t);

        Ok(coef1 * x_start + coef2 * noise)
    }

    /// [`q_sample`](Self::q_sample) with standard-normal noise drawn from `rng`
    pub fn q_sample_with(
        &self,
        x_start: Tensor<B, 3>,
        t: Tensor<B, 1, Int>,
        rng: &mut impl NoiseSource,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        let noise = rng.standard_normal(x_start.dims(), &x_start.device());
        self.q_sample(x_start, t, noise)
    }

    /// Reconstructs `x₀` from a denoiser output at `x_t`
    ///
    /// In epsilon mode `x₀ = x_t / sqrt(ᾱₜ) - sqrt(1/ᾱₜ - 1) ε`; in sample mode
    /// the prediction is returned unchanged.
    pub fn predict_start_from_noise(
        &self,
        x_t: Tensor<B, 3>,
        t: Tensor<B, 1, Int>,
        noise_pred: Tensor<B, 3>,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        self.check_timesteps(&x_t, &t)?;
        if noise_pred.dims() != x_t.dims() {
            return Err(ShapeError::Mismatch {
                pred: noise_pred.dims().to_vec(),
                target: x_t.dims().to_vec(),
            });
        }

        match self.config.prediction_type {
            PredictionType::Epsilon => {
                let coef1: Tensor<B, 3> = extract(&self.schedule.sqrt_recip_alphas_cumprod, t.clone());
                let coef2: Tensor<B, 3> = extract(&self.schedule.sqrt_recipm1_alphas_cumprod, t);
                Ok(coef1 * x_t - coef2 * noise_pred)
            }
            PredictionType::Sample => Ok(noise_pred),
        }
    }

    /// Posterior `q(x_{t-1} | x_t, x₀)`
    pub fn q_posterior(
        &self,
        x_start: Tensor<B, 3>,
        x_t: Tensor<B, 3>,
        t: Tensor<B, 1, Int>,
    ) -> Result<Posterior<B>, ShapeError> {
        self.check_timesteps(&x_t, &t)?;
        if x_start.dims() != x_t.dims() {
            return Err(ShapeError::Mismatch {
                pred: x_start.dims().to_vec(),
                target: x_t.dims().to_vec(),
            });
        }

        let coef1: Tensor<B, 3> = extract(&self.schedule.posterior_mean_coef1, t.clone());
        let coef2: Tensor<B, 3> = extract(&self.schedule.posterior_mean_coef2, t.clone());

        Ok(Posterior {
            mean: coef1 * x_start + coef2 * x_t,
            variance: extract(&self.schedule.posterior_variance, t.clone()),
            log_variance: extract(&self.schedule.posterior_log_variance_clipped, t),
        })
    }

    /// Model estimate of `p(x_{t-1} | x_t)`
    pub fn p_mean_variance(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditions<B>,
        t: Tensor<B, 1, Int>,
    ) -> Result<Posterior<B>, ShapeError> {
        self.check_timesteps(&x, &t)?;

        let pred = self.model.predict(x.clone(), cond, t.clone());
        let x_recon = self.predict_start_from_noise(x.clone(), t.clone(), pred)?;
        let x_recon = if self.config.clip_denoised {
            x_recon.clamp(-1.0, 1.0)
        } else {
            x_recon
        };

        self.q_posterior(x_recon, x, t)
    }

    /// One reverse step `x_t -> x_{t-1}`
    ///
    /// No noise is added for batch elements at `t == 0`.
    pub fn p_sample(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditions<B>,
        t: Tensor<B, 1, Int>,
        rng: &mut impl NoiseSource,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        let [batch, _, _] = x.dims();
        let device = x.device();
        let shape = x.dims();

        let posterior = self.p_mean_variance(x, cond, t.clone())?;
        let noise = rng.standard_normal(shape, &device);

        let nonzero_mask = t.not_equal_elem(0).float().reshape([batch, 1, 1]);
        let std = posterior.log_variance.mul_scalar(0.5).exp();

        Ok(posterior.mean + nonzero_mask * std * noise)
    }

    /// Runs the full reverse chain from pure noise
    ///
    /// Steps run strictly from `num_steps - 1` down to 0, with the conditions
    /// re-applied after every step. The horizon must be non-zero and accepted
    /// by the denoiser.
    pub fn p_sample_loop(
        &self,
        shape: [usize; 3],
        cond: &Conditions<B>,
        device: &B::Device,
        rng: &mut impl NoiseSource,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        let [batch, horizon, transition_dim] = shape;
        if transition_dim != self.transition_dim() {
            return Err(ShapeError::TransitionDim {
                expected: self.transition_dim(),
                actual: transition_dim,
            });
        }
        if horizon == 0 {
            return Err(ShapeError::ZeroHorizon);
        }
        self.model.validate_horizon(horizon)?;

        tracing::debug!(batch, horizon, num_steps = self.num_steps(), "starting reverse diffusion");

        let x = rng.standard_normal(shape, device);
        let mut x = apply_conditioning(x, cond, self.config.action_dim)?;

        for i in (0..self.num_steps()).rev() {
            tracing::trace!(t = i, "reverse step");
            let t = Tensor::<B, 1, Int>::full([batch], i as i64, device);
            x = self.p_sample(x, cond, t, rng)?;
            x = apply_conditioning(x, cond, self.config.action_dim)?;
        }

        tracing::debug!("finished reverse diffusion");

        Ok(x)
    }

    /// Samples trajectories that satisfy `cond`
    ///
    /// The batch size and device are taken from the conditions, which must
    /// therefore be non-empty. `horizon` defaults to the configured horizon.
    pub fn conditional_sample(
        &self,
        cond: &Conditions<B>,
        horizon: Option<usize>,
        rng: &mut impl NoiseSource,
    ) -> Result<Tensor<B, 3>, ShapeError> {
        let first = cond.values().next().ok_or(ShapeError::EmptyConditions)?;
        let [batch, _] = first.dims();
        let device = first.device();
        let horizon = horizon.unwrap_or(self.config.horizon);

        self.p_sample_loop([batch, horizon, self.transition_dim()], cond, &device, rng)
    }

    /// Denoising loss at given timesteps
    pub fn p_losses(
        &self,
        x_start: Tensor<B, 3>,
        cond: &Conditions<B>,
        t: Tensor<B, 1, Int>,
        rng: &mut impl NoiseSource,
    ) -> Result<LossResult<B>, ShapeError> {
        self.check_timesteps(&x_start, &t)?;

        let noise = rng.standard_normal(x_start.dims(), &x_start.device());
        let x_noisy = self.q_sample(x_start.clone(), t.clone(), noise.clone())?;
        let x_noisy = apply_conditioning(x_noisy, cond, self.config.action_dim)?;

        let x_recon = self.model.predict(x_noisy, cond, t);
        let x_recon = apply_conditioning(x_recon, cond, self.config.action_dim)?;

        let target = match self.config.prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::Sample => x_start,
        };

        self.loss_fn.forward(x_recon, target)
    }

    /// Training loss with timesteps drawn uniformly per batch element
    pub fn loss(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditions<B>,
        rng: &mut impl NoiseSource,
    ) -> Result<LossResult<B>, ShapeError> {
        let [batch, _, _] = x.dims();
        let t = rng.timesteps(batch, self.num_steps(), &x.device());
        self.p_losses(x, cond, t, rng)
    }
}

/// Builds a U-Net denoiser and the diffusion process around it
pub fn temporal_unet_diffusion<B: Backend>(
    config: &DiffusionConfig,
    unet: &diffuser_unet::TemporalUnetConfig,
    device: &B::Device,
) -> Result<GaussianDiffusion<B, TemporalUnet<B>>, DiffusionError> {
    if unet.horizon != config.horizon {
        return Err(ShapeError::Horizon {
            expected: config.horizon,
            actual: unet.horizon,
        }
        .into());
    }
    if unet.transition_dim != config.transition_dim() {
        return Err(ShapeError::TransitionDim {
            expected: config.transition_dim(),
            actual: unet.transition_dim,
        }
        .into());
    }

    let model = unet.init::<B>(device)?;
    Ok(config.init(model, device)?)
}
