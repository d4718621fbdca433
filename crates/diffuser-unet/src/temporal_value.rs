//! Temporal value network
//!
//! Scores noisy trajectories with a scalar (or small vector) value. Shares the
//! time path and residual blocks of the U-Net but only has an encoder: every
//! level halves the horizon, then the features are flattened and passed
//! through an MLP together with the time vector.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use diffuser_core::error::ConfigError;
use diffuser_core::mish::mish;

use crate::blocks::{Downsample1d, ResidualTemporalBlock, TimeMlp};

/// Value network configuration
#[derive(Debug, Clone)]
pub struct TemporalValueConfig {
    /// Trajectory length (must be divisible by `2^levels`)
    pub horizon: usize,
    /// Channels per timestep
    pub transition_dim: usize,
    /// Base channel width, also the time embedding width
    pub dim: usize,
    /// Channel multipliers per resolution level
    pub dim_mults: Vec<usize>,
    /// Width of the output
    pub out_dim: usize,
    /// Kernel size of the residual conv blocks
    pub kernel_size: usize,
    /// Group count of every group normalization
    pub norm_groups: usize,
}

impl TemporalValueConfig {
    /// Default architecture with a scalar output
    pub fn new(horizon: usize, transition_dim: usize) -> Self {
        Self {
            horizon,
            transition_dim,
            dim: 32,
            dim_mults: vec![1, 2, 4, 8],
            out_dim: 1,
            kernel_size: 5,
            norm_groups: 8,
        }
    }

    /// Sets the base channel width
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Sets the channel multipliers
    pub fn with_dim_mults(mut self, dim_mults: Vec<usize>) -> Self {
        self.dim_mults = dim_mults;
        self
    }

    /// Sets the output width
    pub fn with_out_dim(mut self, out_dim: usize) -> Self {
        self.out_dim = out_dim;
        self
    }

    /// Initializes a value network with freshly initialized weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TemporalValue<B>, ConfigError> {
        TemporalValue::new(self, device)
    }
}

/// Encoder level of the value network
#[derive(Module, Debug)]
pub struct ValueLevel<B: Backend> {
    /// `dim_in -> dim_out`
    pub res1: ResidualTemporalBlock<B>,
    /// `dim_out -> dim_out`
    pub res2: ResidualTemporalBlock<B>,
    /// Halves the horizon
    pub downsample: Downsample1d<B>,
}

/// Temporal value network
#[derive(Module, Debug)]
pub struct TemporalValue<B: Backend> {
    /// Sinusoidal embedding + MLP
    pub time_mlp: TimeMlp<B>,
    /// Encoder levels
    pub blocks: Vec<ValueLevel<B>>,
    /// `fc_dim + time_dim -> fc_dim / 2`
    pub final_1: Linear<B>,
    /// `fc_dim / 2 -> out_dim`
    pub final_2: Linear<B>,
}

impl<B: Backend> TemporalValue<B> {
    /// Creates a new value network
    pub fn new(config: &TemporalValueConfig, device: &B::Device) -> Result<Self, ConfigError> {
        if config.dim_mults.is_empty() {
            return Err(ConfigError::EmptyDimMults);
        }
        if config.out_dim == 0 {
            return Err(ConfigError::Zero("out_dim"));
        }

        let levels = config.dim_mults.len();
        let factor = 1usize << levels;
        if config.horizon == 0 || config.horizon % factor != 0 {
            return Err(ConfigError::HorizonNotDivisible {
                horizon: config.horizon,
                factor,
                downsamples: levels,
            });
        }

        let dims: Vec<usize> = std::iter::once(config.transition_dim)
            .chain(config.dim_mults.iter().map(|m| config.dim * m))
            .collect();
        let time_dim = config.dim;
        let k = config.kernel_size;
        let groups = config.norm_groups;

        let time_mlp = TimeMlp::new(config.dim, device)?;

        let mut blocks = Vec::with_capacity(levels);
        for w in dims.windows(2) {
            let (dim_in, dim_out) = (w[0], w[1]);
            blocks.push(ValueLevel {
                res1: ResidualTemporalBlock::new(dim_in, dim_out, time_dim, k, groups, device)?,
                res2: ResidualTemporalBlock::new(dim_out, dim_out, time_dim, k, groups, device)?,
                downsample: Downsample1d::new(dim_out, device),
            });
        }

        let fc_dim = dims[dims.len() - 1] * (config.horizon / factor).max(1);
        tracing::debug!(fc_dim, levels, "building temporal value network");

        let final_1 = LinearConfig::new(fc_dim + time_dim, fc_dim / 2).init(device);
        let final_2 = LinearConfig::new(fc_dim / 2, config.out_dim).init(device);

        Ok(Self {
            time_mlp,
            blocks,
            final_1,
            final_2,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Trajectories `[batch, horizon, transition_dim]`
    /// * `timesteps` - Diffusion timestep for each sample `[batch]`
    ///
    /// # Returns
    /// Values `[batch, out_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
        let mut h = x.swap_dims(1, 2);
        let t = self.time_mlp.forward(timesteps);

        for level in &self.blocks {
            h = level.res1.forward(h, t.clone());
            h = level.res2.forward(h, t.clone());
            h = level.downsample.forward(h);
        }

        let [batch, channels, length] = h.dims();
        let h = h.reshape([batch, channels * length]);
        let h = Tensor::cat(vec![h, t], 1);

        let h = mish(self.final_1.forward(h));
        self.final_2.forward(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_value_tiny_forward() {
        let device = Default::default();
        let value = TemporalValueConfig::new(16, 3)
            .with_dim(8)
            .with_dim_mults(vec![1, 2])
            .init::<TestBackend>(&device)
            .unwrap();

        let x = Tensor::<TestBackend, 3>::ones([2, 16, 3], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([3.0, 7.0], &device);
        assert_eq!(value.forward(x, t).dims(), [2, 1]);
    }

    #[test]
    fn test_value_every_level_downsamples() {
        let device = Default::default();
        let err = TemporalValueConfig::new(8, 3)
            .with_dim(8)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::HorizonNotDivisible {
                horizon: 8,
                factor: 16,
                downsamples: 4,
            }
        );
    }
}
