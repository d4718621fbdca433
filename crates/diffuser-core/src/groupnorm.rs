//! Group normalization implementation
//!
//! Provides group normalization for temporal feature maps laid out as
//! `[batch, channels, length]`. Divides channels into groups and normalizes
//! within each group.

use burn::module::Param;
use burn::prelude::*;

use crate::error::ConfigError;

/// Group normalization module
///
/// Divides channels into groups and normalizes each group independently.
/// Used after every temporal convolution, where batch statistics would be
/// unreliable for the small batches typical of planning workloads.
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Param<Tensor<B, 1>>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups to divide channels into (typically 8)
    /// * `num_channels` - Total number of input channels (must be divisible by num_groups)
    /// * `device` - Device to create tensors on
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Result<Self, ConfigError> {
        if num_groups == 0 || num_channels % num_groups != 0 {
            return Err(ConfigError::GroupMismatch {
                channels: num_channels,
                groups: num_groups,
            });
        }

        Ok(Self {
            num_groups,
            weight: Param::from_tensor(Tensor::ones([num_channels], device)),
            bias: Param::from_tensor(Tensor::zeros([num_channels], device)),
            eps: 1e-5,
        })
    }

    /// Applies group normalization to a 3D tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, length]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, channels, length] = x.dims();
        let group_size = channels / self.num_groups;

        // [batch, num_groups, group_size * length]
        let x = x.reshape([batch, self.num_groups, group_size * length]);

        let mean = x.clone().mean_dim(2);
        let diff = x - mean;
        let var = (diff.clone() * diff.clone()).mean_dim(2);

        let x = diff / (var + self.eps).sqrt();
        let x = x.reshape([batch, channels, length]);

        let weight = self.weight.val().reshape([1, channels, 1]);
        let bias = self.bias.val().reshape([1, channels, 1]);

        x * weight + bias
    }
}
