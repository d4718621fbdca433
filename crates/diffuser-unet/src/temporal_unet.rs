//! Temporal U-Net
//!
//! The denoising backbone for trajectory diffusion. Trajectories enter as
//! `[batch, horizon, transition_dim]`, are processed channel-first by 1D
//! residual blocks at decreasing temporal resolution, and leave with the
//! same shape they came in with.

use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::prelude::*;

use diffuser_core::error::ConfigError;

use crate::blocks::{ConvBlock, Downsample1d, ResidualTemporalBlock, TimeMlp, Upsample1d};

/// Temporal U-Net configuration
#[derive(Debug, Clone)]
pub struct TemporalUnetConfig {
    /// Trajectory length (must be divisible by `2^(levels - 1)`)
    pub horizon: usize,
    /// Channels per timestep (action + observation)
    pub transition_dim: usize,
    /// Base channel width, also the time embedding width
    pub dim: usize,
    /// Channel multipliers per resolution level
    pub dim_mults: Vec<usize>,
    /// Kernel size of the residual conv blocks
    pub kernel_size: usize,
    /// Group count of every group normalization
    pub norm_groups: usize,
}

impl TemporalUnetConfig {
    /// Default architecture (`dim = 32`, `dim_mults = [1, 2, 4, 8]`)
    pub fn new(horizon: usize, transition_dim: usize) -> Self {
        Self {
            horizon,
            transition_dim,
            dim: 32,
            dim_mults: vec![1, 2, 4, 8],
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

    /// Sets the group count of the normalizations
    pub fn with_norm_groups(mut self, norm_groups: usize) -> Self {
        self.norm_groups = norm_groups;
        self
    }

    /// Channel sizes `[transition_dim, dim * m0, dim * m1, ...]`
    pub fn dims(&self) -> Vec<usize> {
        std::iter::once(self.transition_dim)
            .chain(self.dim_mults.iter().map(|m| self.dim * m))
            .collect()
    }

    /// `(dim_in, dim_out)` per resolution level
    pub fn in_out(&self) -> Vec<(usize, usize)> {
        let dims = self.dims();
        dims.windows(2).map(|w| (w[0], w[1])).collect()
    }

    /// Checks the shape invariants without allocating weights
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dim_mults.is_empty() {
            return Err(ConfigError::EmptyDimMults);
        }
        if self.horizon == 0 {
            return Err(ConfigError::Zero("horizon"));
        }
        if self.transition_dim == 0 {
            return Err(ConfigError::Zero("transition_dim"));
        }
        if self.kernel_size == 0 {
            return Err(ConfigError::Zero("kernel_size"));
        }

        let downsamples = self.dim_mults.len() - 1;
        let factor = 1usize << downsamples;
        if self.horizon % factor != 0 {
            return Err(ConfigError::HorizonNotDivisible {
                horizon: self.horizon,
                factor,
                downsamples,
            });
        }

        Ok(())
    }

    /// Initializes a U-Net with freshly initialized weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TemporalUnet<B>, ConfigError> {
        TemporalUnet::new(self, device)
    }
}

/// One encoder level: two residual blocks, then a strided down-sampling
#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    /// `dim_in -> dim_out`
    pub res1: ResidualTemporalBlock<B>,
    /// `dim_out -> dim_out`
    pub res2: ResidualTemporalBlock<B>,
    /// None at the deepest level
    pub downsample: Option<Downsample1d<B>>,
}

/// One decoder level: skip concatenation, two residual blocks, up-sampling
#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    /// `2 * dim_out -> dim_in`
    pub res1: ResidualTemporalBlock<B>,
    /// `dim_in -> dim_in`
    pub res2: ResidualTemporalBlock<B>,
    /// Doubles the horizon
    pub upsample: Upsample1d<B>,
}

/// Temporal U-Net denoiser
#[derive(Module, Debug)]
pub struct TemporalUnet<B: Backend> {
    /// Sinusoidal embedding + MLP
    pub time_mlp: TimeMlp<B>,
    /// Encoder levels
    pub downs: Vec<DownLevel<B>>,
    /// First bottleneck block
    pub mid_block1: ResidualTemporalBlock<B>,
    /// Second bottleneck block
    pub mid_block2: ResidualTemporalBlock<B>,
    /// Decoder levels
    pub ups: Vec<UpLevel<B>>,
    /// Output conv block at base width
    pub final_block: ConvBlock<B>,
    /// 1x1 projection back to the transition dim
    pub final_conv: Conv1d<B>,
    /// Trajectory length the network was built for
    pub horizon: usize,
    /// Channels per timestep
    pub transition_dim: usize,
}

impl<B: Backend> TemporalUnet<B> {
    /// Creates a new temporal U-Net
    ///
    /// Fails if the horizon cannot be halved once per down-sampling level, or
    /// if a channel width cannot be split into the normalization groups.
    pub fn new(config: &TemporalUnetConfig, device: &B::Device) -> Result<Self, ConfigError> {
        config.validate()?;

        let dims = config.dims();
        let in_out = config.in_out();
        let num_levels = in_out.len();
        let time_dim = config.dim;
        let k = config.kernel_size;
        let groups = config.norm_groups;

        tracing::debug!(
            horizon = config.horizon,
            transition_dim = config.transition_dim,
            ?in_out,
            "building temporal unet"
        );

        let time_mlp = TimeMlp::new(config.dim, device)?;

        let mut downs = Vec::with_capacity(num_levels);
        for (level, &(dim_in, dim_out)) in in_out.iter().enumerate() {
            let is_last = level == num_levels - 1;
            downs.push(DownLevel {
                res1: ResidualTemporalBlock::new(dim_in, dim_out, time_dim, k, groups, device)?,
                res2: ResidualTemporalBlock::new(dim_out, dim_out, time_dim, k, groups, device)?,
                downsample: (!is_last).then(|| Downsample1d::new(dim_out, device)),
            });
        }

        let mid_dim = dims[dims.len() - 1];
        let mid_block1 = ResidualTemporalBlock::new(mid_dim, mid_dim, time_dim, k, groups, device)?;
        let mid_block2 = ResidualTemporalBlock::new(mid_dim, mid_dim, time_dim, k, groups, device)?;

        // Mirror every level that down-sampled, deepest first
        let mut ups = Vec::with_capacity(num_levels - 1);
        for &(dim_in, dim_out) in in_out[1..].iter().rev() {
            ups.push(UpLevel {
                res1: ResidualTemporalBlock::new(dim_out * 2, dim_in, time_dim, k, groups, device)?,
                res2: ResidualTemporalBlock::new(dim_in, dim_in, time_dim, k, groups, device)?,
                upsample: Upsample1d::new(dim_in, device),
            });
        }

        let final_block = ConvBlock::new(dims[1], config.dim, k, groups, device)?;
        let final_conv = Conv1dConfig::new(config.dim, config.transition_dim, 1).init(device);

        Ok(Self {
            time_mlp,
            downs,
            mid_block1,
            mid_block2,
            ups,
            final_block,
            final_conv,
            horizon: config.horizon,
            transition_dim: config.transition_dim,
        })
    }

    /// Factor every input horizon must be divisible by, `2^(levels - 1)`
    pub fn horizon_factor(&self) -> usize {
        let downsamples = self.downs.iter().filter(|level| level.downsample.is_some()).count();
        1 << downsamples
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Noisy trajectories `[batch, horizon, transition_dim]`
    /// * `timesteps` - Diffusion timestep for each sample `[batch]`
    ///
    /// # Returns
    /// Predicted noise (or clean trajectory) `[batch, horizon, transition_dim]`
    pub fn forward(&self, x: Tensor<B, 3>, timesteps: Tensor<B, 1>) -> Tensor<B, 3> {
        // [batch, horizon, transition] -> [batch, transition, horizon]
        let mut h = x.swap_dims(1, 2);

        let t = self.time_mlp.forward(timesteps);

        let mut skips = Vec::with_capacity(self.downs.len());
        for level in &self.downs {
            h = level.res1.forward(h, t.clone());
            h = level.res2.forward(h, t.clone());
            skips.push(h.clone());
            if let Some(down) = &level.downsample {
                h = down.forward(h);
            }
        }

        h = self.mid_block1.forward(h, t.clone());
        h = self.mid_block2.forward(h, t.clone());

        // The full-resolution skip of level 0 has no decoder counterpart
        for (level, skip) in self.ups.iter().zip(skips.into_iter().rev()) {
            h = Tensor::cat(vec![h, skip], 1);
            h = level.res1.forward(h, t.clone());
            h = level.res2.forward(h, t.clone());
            h = level.upsample.forward(h);
        }

        let h = self.final_block.forward(h);
        let h = self.final_conv.forward(h);

        h.swap_dims(1, 2)
    }
}
