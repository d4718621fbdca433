//! Weighted trajectory loss
//!
//! Scores a denoiser prediction against its target with per-timestep,
//! per-channel weights, and reports the unweighted error on the first action
//! for monitoring.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::ElementConversion;

use diffuser_core::error::{ConfigError, ShapeError};

/// Elementwise distance between a prediction and its target
pub trait ElementwiseLoss {
    /// Loss per element, same shape as the inputs
    fn compute<B: Backend, const D: usize>(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D>;
}

/// Absolute error
#[derive(Debug, Clone, Copy, Default)]
pub struct L1;

impl ElementwiseLoss for L1 {
    fn compute<B: Backend, const D: usize>(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
        (pred - target).abs()
    }
}

/// Squared error
#[derive(Debug, Clone, Copy, Default)]
pub struct L2;

impl ElementwiseLoss for L2 {
    fn compute<B: Backend, const D: usize>(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
        let diff = pred - target;
        diff.clone() * diff
    }
}

/// Loss selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossType {
    /// Absolute error
    #[default]
    L1,
    /// Squared error
    L2,
}

impl ElementwiseLoss for LossType {
    fn compute<B: Backend, const D: usize>(&self, pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            LossType::L1 => L1.compute(pred, target),
            LossType::L2 => L2.compute(pred, target),
        }
    }
}

impl FromStr for LossType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(LossType::L1),
            "l2" => Ok(LossType::L2),
            _ => Err(ConfigError::UnknownLoss(s.to_string())),
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossType::L1 => f.write_str("l1"),
            LossType::L2 => f.write_str("l2"),
        }
    }
}

/// Scalar loss plus named diagnostics
#[derive(Debug, Clone)]
pub struct LossResult<B: Backend> {
    /// Mean weighted loss, shape `[1]`
    pub loss: Tensor<B, 1>,
    /// Host-side diagnostics, never part of the gradient graph
    pub info: BTreeMap<String, f32>,
}

/// Builds the `[horizon, transition_dim]` weight table, row-major
///
/// Every channel starts at 1; observation channel `i` is scaled by
/// `obs_weights[i]`; row `t` is scaled by `discount^t` normalized so the
/// mean over the horizon is 1. Finally the action channels of the first row
/// are set to `action_weight` outright.
///
/// Fails when the discounts do not have a positive finite mean, e.g. a
/// discount of `-1` over an even horizon.
pub fn loss_weights(
    horizon: usize,
    action_dim: usize,
    observation_dim: usize,
    action_weight: f32,
    discount: f32,
    obs_weights: &BTreeMap<usize, f32>,
) -> Result<Vec<f32>, ConfigError> {
    if horizon == 0 {
        return Err(ConfigError::Zero("horizon"));
    }
    if !action_weight.is_finite() || action_weight < 0.0 {
        return Err(ConfigError::InvalidActionWeight(action_weight));
    }
    let transition_dim = action_dim + observation_dim;

    let mut dim_weights = vec![1.0f32; transition_dim];
    for (&index, &w) in obs_weights {
        if index >= observation_dim {
            return Err(ConfigError::LossWeightIndex {
                index,
                observation_dim,
            });
        }
        dim_weights[action_dim + index] *= w;
    }

    let mut discounts: Vec<f32> = (0..horizon).map(|t| discount.powi(t as i32)).collect();
    let mean = discounts.iter().sum::<f32>() / horizon as f32;
    if !mean.is_finite() || mean <= 0.0 {
        return Err(ConfigError::InvalidDiscount(discount));
    }
    for d in &mut discounts {
        *d /= mean;
    }

    let mut weights: Vec<f32> = discounts
        .iter()
        .flat_map(|d| dim_weights.iter().map(move |w| d * w))
        .collect();
    weights[..action_dim].fill(action_weight);

    Ok(weights)
}

/// Weighted elementwise loss over trajectories
#[derive(Debug, Clone)]
pub struct WeightedLoss<B: Backend> {
    weights: Tensor<B, 2>,
    action_dim: usize,
    loss_type: LossType,
}

impl<B: Backend> WeightedLoss<B> {
    /// Wraps a `[horizon, transition_dim]` weight tensor
    pub fn new(weights: Tensor<B, 2>, action_dim: usize, loss_type: LossType) -> Self {
        Self {
            weights,
            action_dim,
            loss_type,
        }
    }

    /// Builds the weights with [`loss_weights`] and uploads them to `device`
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        horizon: usize,
        action_dim: usize,
        observation_dim: usize,
        action_weight: f32,
        discount: f32,
        obs_weights: &BTreeMap<usize, f32>,
        loss_type: LossType,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let weights = loss_weights(horizon, action_dim, observation_dim, action_weight, discount, obs_weights)?;
        let transition_dim = action_dim + observation_dim;
        let weights = Tensor::from_data(TensorData::new(weights, [horizon, transition_dim]), device);
        Ok(Self::new(weights, action_dim, loss_type))
    }

    /// Weight table `[horizon, transition_dim]`
    pub fn weights(&self) -> &Tensor<B, 2> {
        &self.weights
    }

    /// Selected elementwise loss
    pub fn loss_type(&self) -> LossType {
        self.loss_type
    }

    /// Scores `pred` against `target`, both `[batch, horizon, transition_dim]`
    pub fn forward(&self, pred: Tensor<B, 3>, target: Tensor<B, 3>) -> Result<LossResult<B>, ShapeError> {
        let [batch, horizon, transition_dim] = pred.dims();
        if pred.dims() != target.dims() {
            return Err(ShapeError::Mismatch {
                pred: pred.dims().to_vec(),
                target: target.dims().to_vec(),
            });
        }
        let [w_horizon, w_transition] = self.weights.dims();
        if horizon != w_horizon {
            return Err(ShapeError::Horizon {
                expected: w_horizon,
                actual: horizon,
            });
        }
        if transition_dim != w_transition {
            return Err(ShapeError::TransitionDim {
                expected: w_transition,
                actual: transition_dim,
            });
        }

        let elementwise = self.loss_type.compute(pred, target);
        let weights = self.weights.clone().to_device(&elementwise.device());
        let loss = (elementwise.clone() * weights.clone().unsqueeze::<3>()).mean();

        // Omitted when a first-action weight is zero
        let mut info = BTreeMap::new();
        if self.action_dim > 0 {
            let a = self.action_dim;
            let first_weights = weights.detach().slice([0..1, 0..a]);
            let min_weight = first_weights.clone().abs().min().into_scalar().elem::<f32>();
            if min_weight > 0.0 {
                let first_action = elementwise.detach().slice([0..batch, 0..1, 0..a]);
                let a0_loss = (first_action / first_weights.unsqueeze::<3>())
                    .mean()
                    .into_scalar()
                    .elem::<f32>();
                info.insert("a0_loss".to_string(), a0_loss);
            }
        }

        Ok(LossResult { loss, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_loss_type_from_str() {
        assert_eq!("l1".parse::<LossType>().unwrap(), LossType::L1);
        assert_eq!("L2".parse::<LossType>().unwrap(), LossType::L2);
        assert_eq!(
            "huber".parse::<LossType>().unwrap_err(),
            ConfigError::UnknownLoss("huber".to_string())
        );
        assert_eq!(LossType::default().to_string(), "l1");
    }

    #[test]
    fn test_uniform_weights() {
        let weights = loss_weights(3, 1, 2, 1.0, 1.0, &BTreeMap::new()).unwrap();
        assert_eq!(weights, vec![1.0; 9]);
    }

    #[test]
    fn test_weights_discount_and_overrides() {
        let mut obs = BTreeMap::new();
        obs.insert(1, 3.0);
        let weights = loss_weights(2, 2, 2, 10.0, 0.5, &obs).unwrap();

        // discounts [1, 0.5] normalized by their mean 0.75
        let d0 = 1.0 / 0.75;
        let d1 = 0.5 / 0.75;
        let expected = [10.0, 10.0, d0, 3.0 * d0, d1, d1, d1, 3.0 * d1];
        for (w, e) in weights.iter().zip(expected) {
            assert!((w - e).abs() < 1e-6, "{weights:?}");
        }
    }

    #[test]
    fn test_weight_index_out_of_range() {
        let mut obs = BTreeMap::new();
        obs.insert(2, 3.0);
        assert_eq!(
            loss_weights(4, 1, 2, 1.0, 1.0, &obs).unwrap_err(),
            ConfigError::LossWeightIndex {
                index: 2,
                observation_dim: 2,
            }
        );
    }

    #[test]
    fn test_rejects_vanishing_discount_mean() {
        assert_eq!(
            loss_weights(4, 1, 2, 1.0, -1.0, &BTreeMap::new()).unwrap_err(),
            ConfigError::InvalidDiscount(-1.0)
        );
        assert!(matches!(
            loss_weights(4, 1, 2, 1.0, f32::NAN, &BTreeMap::new()).unwrap_err(),
            ConfigError::InvalidDiscount(_)
        ));
        // odd horizon keeps a positive mean
        assert!(loss_weights(3, 1, 2, 1.0, -1.0, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_rejects_bad_action_weight() {
        assert_eq!(
            loss_weights(4, 1, 2, -2.0, 1.0, &BTreeMap::new()).unwrap_err(),
            ConfigError::InvalidActionWeight(-2.0)
        );
        assert!(matches!(
            loss_weights(4, 1, 2, f32::INFINITY, 1.0, &BTreeMap::new()).unwrap_err(),
            ConfigError::InvalidActionWeight(_)
        ));
    }

    #[test]
    fn test_zero_action_weight_skips_a0_loss() {
        let device = Default::default();
        let loss_fn =
            WeightedLoss::<TestBackend>::init(2, 1, 1, 0.0, 1.0, &BTreeMap::new(), LossType::L1, &device)
                .unwrap();

        let pred = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device);
        let target = Tensor::<TestBackend, 3>::zeros([1, 2, 2], &device);
        let out = loss_fn.forward(pred, target).unwrap();

        // weights [[0, 1], [1, 1]], absolute error 1 everywhere
        assert!((out.loss.into_scalar() - 0.75).abs() < 1e-6);
        assert!(!out.info.contains_key("a0_loss"));
    }

    #[test]
    fn test_identical_tensors_give_zero_loss() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 1, Int>::arange(0..24, &device)
            .float()
            .reshape([2, 4, 3])
            .mul_scalar(0.25);

        for loss_type in [LossType::L1, LossType::L2] {
            let loss_fn =
                WeightedLoss::<TestBackend>::init(4, 1, 2, 10.0, 0.99, &BTreeMap::new(), loss_type, &device)
                    .unwrap();
            let out = loss_fn.forward(pred.clone(), pred.clone()).unwrap();
            assert_eq!(out.loss.into_scalar(), 0.0);
            assert_eq!(out.info["a0_loss"], 0.0);
        }
    }

    #[test]
    fn test_weighted_l2_and_a0_loss() {
        let device = Default::default();
        let loss_fn =
            WeightedLoss::<TestBackend>::init(2, 1, 1, 4.0, 1.0, &BTreeMap::new(), LossType::L2, &device)
                .unwrap();

        let pred = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device).mul_scalar(2.0);
        let target = Tensor::<TestBackend, 3>::zeros([1, 2, 2], &device);
        let out = loss_fn.forward(pred, target).unwrap();

        // weights [[4, 1], [1, 1]], squared error 4 everywhere
        assert!((out.loss.into_scalar() - 7.0).abs() < 1e-6);
        assert!((out.info["a0_loss"] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_a0_loss_without_actions() {
        let device = Default::default();
        let loss_fn =
            WeightedLoss::<TestBackend>::init(2, 0, 3, 1.0, 1.0, &BTreeMap::new(), LossType::L1, &device)
                .unwrap();
        let x = Tensor::<TestBackend, 3>::ones([1, 2, 3], &device);
        let out = loss_fn.forward(x.clone(), x).unwrap();
        assert!(out.info.is_empty());
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Default::default();
        let loss_fn =
            WeightedLoss::<TestBackend>::init(4, 1, 2, 1.0, 1.0, &BTreeMap::new(), LossType::L1, &device)
                .unwrap();

        let a = Tensor::<TestBackend, 3>::zeros([1, 4, 3], &device);
        let b = Tensor::<TestBackend, 3>::zeros([2, 4, 3], &device);
        assert!(matches!(
            loss_fn.forward(a, b).unwrap_err(),
            ShapeError::Mismatch { .. }
        ));

        let c = Tensor::<TestBackend, 3>::zeros([1, 8, 3], &device);
        assert_eq!(
            loss_fn.forward(c.clone(), c).unwrap_err(),
            ShapeError::Horizon {
                expected: 4,
                actual: 8,
            }
        );
    }
}
