//! Noise schedule for trajectory diffusion
//!
//! The schedule is a pure function of `(num_steps, s)`: it is computed once on
//! the host and never mutated. [`extract`] gathers per-sample coefficients on
//! the host and uploads only those, to whatever device the timesteps live on.

use burn::prelude::*;

use diffuser_core::error::ConfigError;

/// Default offset of the cosine schedule
pub const DEFAULT_OFFSET: f64 = 0.008;

/// Upper clip of every beta
pub const MAX_BETA: f64 = 0.999;

/// Floor applied to the posterior variance before taking its log
pub const POSTERIOR_VARIANCE_FLOOR: f32 = 1e-20;

/// Cosine beta schedule
///
/// As proposed in "Improved Denoising Diffusion Probabilistic Models"
/// (Nichol & Dhariwal, 2021). Evaluated in f64, stored as f32.
///
/// `f(i) = cos(((i / num_steps) + s) / (1 + s) * pi / 2)^2` for
/// `i in 0..=num_steps`, normalized by `f(0)`, then
/// `beta_i = clip(1 - f(i + 1) / f(i), 0, 0.999)`.
pub fn cosine_betas(num_steps: usize, s: f64) -> Result<Vec<f32>, ConfigError> {
    if num_steps < 2 {
        return Err(ConfigError::TooFewSteps(num_steps));
    }
    if !s.is_finite() || s < 0.0 {
        return Err(ConfigError::InvalidScheduleOffset(s));
    }

    // Sample points span [0, 1] inclusive of both ends
    let f: Vec<f64> = (0..=num_steps)
        .map(|i| {
            let x = i as f64 / num_steps as f64;
            ((x + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2).cos().powi(2)
        })
        .collect();
    let f0 = f[0];

    Ok(f.windows(2)
        .map(|w| (1.0 - (w[1] / f0) / (w[0] / f0)).clamp(0.0, MAX_BETA) as f32)
        .collect())
}

/// Precomputed diffusion schedule values
///
/// Every vector has length `num_steps` and is indexed by diffusion timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Number of diffusion steps
    pub num_steps: usize,
    /// Per-step noise variance: βₜ
    pub betas: Vec<f32>,
    /// 1 - βₜ
    pub alphas: Vec<f32>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f32>,
    /// ᾱₜ₋₁ with ᾱ₋₁ = 1
    pub alphas_cumprod_prev: Vec<f32>,
    /// √ᾱₜ
    pub sqrt_alphas_cumprod: Vec<f32>,
    /// √(1 - ᾱₜ)
    pub sqrt_one_minus_alphas_cumprod: Vec<f32>,
    /// ln(1 - ᾱₜ)
    pub log_one_minus_alphas_cumprod: Vec<f32>,
    /// 1 / √ᾱₜ
    pub sqrt_recip_alphas_cumprod: Vec<f32>,
    /// √(1 / ᾱₜ - 1)
    pub sqrt_recipm1_alphas_cumprod: Vec<f32>,
    /// Variance of q(xₜ₋₁ | xₜ, x₀)
    pub posterior_variance: Vec<f32>,
    /// ln(max(posterior variance, 1e-20)); the true variance is 0 at t = 0
    pub posterior_log_variance_clipped: Vec<f32>,
    /// Posterior mean coefficient of x₀
    pub posterior_mean_coef1: Vec<f32>,
    /// Posterior mean coefficient of xₜ
    pub posterior_mean_coef2: Vec<f32>,
}

impl Schedule {
    /// Cosine schedule with offset `s`
    pub fn cosine(num_steps: usize, s: f64) -> Result<Self, ConfigError> {
        let schedule = Self::from_betas(cosine_betas(num_steps, s)?)?;

        tracing::debug!(
            num_steps,
            s,
            first_beta = schedule.betas[0],
            last_beta = schedule.betas[num_steps - 1],
            "computed cosine schedule"
        );

        Ok(schedule)
    }

    /// Derives every schedule vector from `betas`
    ///
    /// Fails if the betas leave `[0, 0.999]` or if `ᾱ` is not strictly
    /// decreasing from 1, which would put a zero in a `1 - ᾱ` denominator.
    pub fn from_betas(betas: Vec<f32>) -> Result<Self, ConfigError> {
        let num_steps = betas.len();
        if num_steps < 2 {
            return Err(ConfigError::TooFewSteps(num_steps));
        }
        if let Some(b) = betas
            .iter()
            .find(|b| !(0.0..=MAX_BETA as f32).contains(*b))
        {
            return Err(ConfigError::DegenerateSchedule(format!(
                "beta {b} outside [0, {MAX_BETA}]"
            )));
        }

        let alphas: Vec<f32> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        let mut cumprod = 1.0f32;
        for (t, alpha) in alphas.iter().enumerate() {
            let next = cumprod * alpha;
            if next.is_nan() || next >= cumprod {
                return Err(ConfigError::DegenerateSchedule(format!(
                    "alphas_cumprod does not decrease at step {t}"
                )));
            }
            cumprod = next;
            alphas_cumprod.push(cumprod);
        }

        let alphas_cumprod_prev: Vec<f32> = std::iter::once(1.0)
            .chain(alphas_cumprod[..num_steps - 1].iter().copied())
            .collect();

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();
        let log_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).ln()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| a.powf(-0.5)).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let mut posterior_variance = Vec::with_capacity(num_steps);
        let mut posterior_mean_coef1 = Vec::with_capacity(num_steps);
        let mut posterior_mean_coef2 = Vec::with_capacity(num_steps);
        for t in 0..num_steps {
            let denom = 1.0 - alphas_cumprod[t];
            posterior_variance.push(betas[t] * (1.0 - alphas_cumprod_prev[t]) / denom);
            posterior_mean_coef1.push(betas[t] * alphas_cumprod_prev[t].sqrt() / denom);
            posterior_mean_coef2.push((1.0 - alphas_cumprod_prev[t]) * alphas[t].sqrt() / denom);
        }
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .map(|v| v.max(POSTERIOR_VARIANCE_FLOOR).ln())
            .collect();

        Ok(Self {
            num_steps,
            betas,
            alphas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }
}

/// Gathers `values[t[i]]` for every batch element and reshapes to `[batch, 1, ..., 1]`
///
/// The gather runs on the host, so only the `[batch]` coefficients are
/// uploaded, to the device of `t`. Out-of-range timesteps yield NaN. `D` is
/// the rank of the tensor the result will be broadcast against.
pub fn extract<B: Backend, const D: usize>(values: &[f32], t: Tensor<B, 1, Int>) -> Tensor<B, D> {
    let device = t.device();
    let [batch] = t.dims();

    let gathered: Vec<f32> = t
        .into_data()
        .iter::<i64>()
        .map(|i| {
            usize::try_from(i)
                .ok()
                .and_then(|i| values.get(i).copied())
                .unwrap_or(f32::NAN)
        })
        .collect();

    let mut shape = [1usize; D];
    shape[0] = batch;
    Tensor::from_data(TensorData::new(gathered, shape), &device)
}
