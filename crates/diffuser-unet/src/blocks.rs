//! Temporal building blocks: time embedding, conv blocks, residual blocks, down/up sampling
//!
//! All convolutional blocks operate on channel-first feature maps of shape
//! `[batch, channels, horizon]`.

use burn::nn::{
    conv::{Conv1d, Conv1dConfig},
    Linear, LinearConfig, PaddingConfig1d,
};
use burn::prelude::*;

use diffuser_core::error::ConfigError;
use diffuser_core::groupnorm::GroupNorm;
use diffuser_core::mish::mish;

/// Precompute frequency tensor for timestep embedding
///
/// `freqs[i] = exp(-i * ln(10000) / (half_dim - 1))`, so the last frequency is
/// exactly `1 / 10000`. Call this once during initialization and pass to
/// `timestep_embedding_with_freqs`.
pub fn timestep_freqs<B: Backend>(dim: usize, device: &B::Device) -> Tensor<B, 1> {
    let half_dim = dim / 2;
    let scale = 10000.0f64.ln() / (half_dim as f64 - 1.0);

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-(i as f64) * scale).exp() as f32)
        .collect();

    Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), device)
}

/// Timestep embedding using precomputed frequencies
///
/// Returns `concat(sin(t * freqs), cos(t * freqs))` of shape `[batch, 2 * half_dim]`.
pub fn timestep_embedding_with_freqs<B: Backend>(
    timesteps: Tensor<B, 1>,
    freqs: Tensor<B, 1>,
) -> Tensor<B, 2> {
    let [batch] = timesteps.dims();
    let [half_dim] = freqs.dims();
    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    let sin = args.clone().sin();
    let cos = args.cos();

    Tensor::cat(vec![sin, cos], 1)
}

/// Timestep embedding using sinusoidal positional encoding
///
/// Note: For hot paths, prefer `timestep_embedding_with_freqs` with precomputed freqs.
pub fn timestep_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let freqs = timestep_freqs(dim, device);
    timestep_embedding_with_freqs(timesteps, freqs)
}

/// Sinusoidal embedding followed by `Linear -> mish -> Linear`
///
/// Maps `[batch]` diffusion timesteps to `[batch, dim]` time vectors that are
/// shared by every residual block of a network.
#[derive(Module, Debug)]
pub struct TimeMlp<B: Backend> {
    /// Precomputed sinusoidal frequencies
    pub freqs: Tensor<B, 1>,
    /// Expands the embedding to 4 * dim
    pub linear_1: Linear<B>,
    /// Projects back to dim
    pub linear_2: Linear<B>,
}

impl<B: Backend> TimeMlp<B> {
    /// Creates a time MLP for embedding width `dim`
    pub fn new(dim: usize, device: &B::Device) -> Result<Self, ConfigError> {
        if dim < 4 || dim % 2 != 0 {
            return Err(ConfigError::InvalidEmbeddingDim(dim));
        }

        Ok(Self {
            freqs: timestep_freqs(dim, device),
            linear_1: LinearConfig::new(dim, dim * 4).init(device),
            linear_2: LinearConfig::new(dim * 4, dim).init(device),
        })
    }

    /// Embeds a batch of (float) timesteps into `[batch, dim]`
    pub fn forward(&self, timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
        let emb = timestep_embedding_with_freqs(timesteps, self.freqs.clone());
        let emb = self.linear_1.forward(emb);
        let emb = mish(emb);
        self.linear_2.forward(emb)
    }
}

/// Conv1d -> GroupNorm -> Mish
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    /// Length-preserving convolution (padding = kernel / 2)
    pub conv: Conv1d<B>,
    /// Channel-wise group normalization
    pub norm: GroupNorm<B>,
}

impl<B: Backend> ConvBlock<B> {
    /// Creates a new conv block
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `kernel_size` - Odd convolution kernel size
    /// * `norm_groups` - Group count of the normalization (must divide `out_channels`)
    /// * `device` - Device to create tensors on
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        norm_groups: usize,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let conv = Conv1dConfig::new(in_channels, out_channels, kernel_size)
            .with_padding(PaddingConfig1d::Explicit(kernel_size / 2))
            .init(device);
        let norm = GroupNorm::new(norm_groups, out_channels, device)?;

        Ok(Self { conv, norm })
    }

    /// `[batch, in_channels, length] -> [batch, out_channels, length]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        mish(x)
    }
}

/// Residual block with time embedding injection
#[derive(Module, Debug)]
pub struct ResidualTemporalBlock<B: Backend> {
    /// First conv block
    pub block1: ConvBlock<B>,
    /// Second conv block
    pub block2: ConvBlock<B>,
    /// Time embedding projection (applied after mish)
    pub time_proj: Linear<B>,
    /// Skip connection convolution (when in_channels != out_channels)
    pub residual_conv: Option<Conv1d<B>>,
}

impl<B: Backend> ResidualTemporalBlock<B> {
    /// Creates a new residual block
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `time_dim` - Dimension of the time vector
    /// * `kernel_size` - Kernel size of both conv blocks
    /// * `norm_groups` - Group count of the normalizations
    /// * `device` - Device to create tensors on
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_dim: usize,
        kernel_size: usize,
        norm_groups: usize,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let block1 = ConvBlock::new(in_channels, out_channels, kernel_size, norm_groups, device)?;
        let block2 = ConvBlock::new(out_channels, out_channels, kernel_size, norm_groups, device)?;
        let time_proj = LinearConfig::new(time_dim, out_channels).init(device);

        let residual_conv = if in_channels != out_channels {
            Some(Conv1dConfig::new(in_channels, out_channels, 1).init(device))
        } else {
            None
        };

        Ok(Self {
            block1,
            block2,
            time_proj,
            residual_conv,
        })
    }

    /// Forward pass through the residual block
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, in_channels, length]`
    /// * `time_emb` - Time vector of shape `[batch, time_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, out_channels, length]`
    pub fn forward(&self, x: Tensor<B, 3>, time_emb: Tensor<B, 2>) -> Tensor<B, 3> {
        let residual = match &self.residual_conv {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let hidden = self.block1.forward(x);

        let time_emb = self.time_proj.forward(mish(time_emb));
        let [b, emb_dim] = time_emb.dims();
        let hidden = hidden + time_emb.reshape([b, emb_dim, 1]);

        let hidden = self.block2.forward(hidden);

        hidden + residual
    }
}

/// Downsample block (strided conv)
#[derive(Module, Debug)]
pub struct Downsample1d<B: Backend> {
    /// Strided convolution for downsampling
    pub conv: Conv1d<B>,
}

impl<B: Backend> Downsample1d<B> {
    /// Creates a new downsample block (2x temporal reduction)
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv1dConfig::new(channels, channels, 3)
            .with_stride(2)
            .with_padding(PaddingConfig1d::Explicit(1))
            .init(device);
        Self { conv }
    }

    /// `[batch, channels, length] -> [batch, channels, length / 2]` for even `length`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.conv.forward(x)
    }
}

/// Upsample block using nearest neighbor interpolation followed by convolution
#[derive(Module, Debug)]
pub struct Upsample1d<B: Backend> {
    /// Convolution after nearest-neighbor upsample
    pub conv: Conv1d<B>,
}

impl<B: Backend> Upsample1d<B> {
    /// Creates a new upsample block (2x temporal increase)
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv1dConfig::new(channels, channels, 3)
            .with_padding(PaddingConfig1d::Explicit(1))
            .init(device);
        Self { conv }
    }

    /// `[batch, channels, length] -> [batch, channels, length * 2]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, c, l] = x.dims();

        // Nearest neighbor 2x upsample
        let x = x.reshape([b, c, l, 1]);
        let x = x.repeat_dim(3, 2);
        let x = x.reshape([b, c, l * 2]);

        self.conv.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_timestep_freqs_span() {
        let device = Default::default();
        let freqs: Vec<f32> = timestep_freqs::<TestBackend>(16, &device)
            .into_data()
            .to_vec()
            .unwrap();

        assert_eq!(freqs.len(), 8);
        assert_eq!(freqs[0], 1.0);
        assert!((freqs[7] - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn test_timestep_embedding_at_zero() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0], &device);
        let emb = timestep_embedding(t, 8, &device);
        assert_eq!(emb.dims(), [2, 8]);

        let values: Vec<f32> = emb.into_data().to_vec().unwrap();
        // sin(0) = 0 for the first half, cos(0) = 1 for the second
        for row in values.chunks(8) {
            assert_eq!(&row[..4], &[0.0; 4]);
            assert_eq!(&row[4..], &[1.0; 4]);
        }
    }

    #[test]
    fn test_time_mlp_shape() {
        let device = Default::default();
        let mlp = TimeMlp::<TestBackend>::new(16, &device).unwrap();
        let t = Tensor::<TestBackend, 1>::from_floats([0.0, 10.0, 999.0], &device);
        assert_eq!(mlp.forward(t).dims(), [3, 16]);
    }

    #[test]
    fn test_time_mlp_rejects_odd_dim() {
        let device = Default::default();
        let err = TimeMlp::<TestBackend>::new(7, &device).unwrap_err();
        assert_eq!(err, ConfigError::InvalidEmbeddingDim(7));
    }

    #[test]
    fn test_residual_block_changes_channels() {
        let device = Default::default();
        let block = ResidualTemporalBlock::<TestBackend>::new(3, 16, 8, 5, 8, &device).unwrap();
        assert!(block.residual_conv.is_some());

        let x = Tensor::<TestBackend, 3>::ones([2, 3, 12], &device);
        let t = Tensor::<TestBackend, 2>::zeros([2, 8], &device);
        assert_eq!(block.forward(x, t).dims(), [2, 16, 12]);
    }

    #[test]
    fn test_residual_block_identity_skip() {
        let device = Default::default();
        let block = ResidualTemporalBlock::<TestBackend>::new(16, 16, 8, 5, 8, &device).unwrap();
        assert!(block.residual_conv.is_none());
    }

    #[test]
    fn test_down_up_sample_lengths() {
        let device = Default::default();
        let down = Downsample1d::<TestBackend>::new(4, &device);
        let up = Upsample1d::<TestBackend>::new(4, &device);

        let x = Tensor::<TestBackend, 3>::ones([1, 4, 16], &device);
        let h = down.forward(x);
        assert_eq!(h.dims(), [1, 4, 8]);
        assert_eq!(up.forward(h).dims(), [1, 4, 16]);
    }
}
