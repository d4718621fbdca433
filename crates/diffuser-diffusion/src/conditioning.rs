//! Pinning known observations inside a trajectory
//!
//! Conditions map a trajectory timestep to the (already normalized)
//! observation every batch element must have there. They are enforced from the
//! outside of the denoiser, before and after every network evaluation.

use std::collections::BTreeMap;

use burn::prelude::*;

use diffuser_core::error::ShapeError;

/// Observation values keyed by trajectory timestep, each `[batch, observation_dim]`
pub type Conditions<B> = BTreeMap<usize, Tensor<B, 2>>;

/// Overwrites `x[:, t, action_dim..]` with `conditions[t]` for every condition
///
/// Computed as `x * mask + values` rather than by slice assignment into `x`,
/// so the gradient with respect to `x` stays intact at every position that is
/// not conditioned (and is exactly zero at those that are). Positions outside
/// the conditioned slots are passed through bit-identical.
///
/// # Arguments
/// * `x` - Trajectories `[batch, horizon, transition_dim]`
/// * `conditions` - Observations to pin, keyed by timestep
/// * `action_dim` - Number of leading action channels, left untouched
pub fn apply_conditioning<B: Backend>(
    x: Tensor<B, 3>,
    conditions: &Conditions<B>,
    action_dim: usize,
) -> Result<Tensor<B, 3>, ShapeError> {
    if conditions.is_empty() {
        return Ok(x);
    }

    let [batch, horizon, transition_dim] = x.dims();
    let observation_dim = transition_dim.saturating_sub(action_dim);
    let device = x.device();

    let mut mask = vec![1.0f32; horizon * transition_dim];
    let mut values = Tensor::<B, 3>::zeros([batch, horizon, transition_dim], &device);

    for (&step, value) in conditions {
        if step >= horizon {
            return Err(ShapeError::ConditionStep { step, horizon });
        }
        let [value_batch, width] = value.dims();
        if width != observation_dim {
            return Err(ShapeError::ConditionDim {
                step,
                expected: observation_dim,
                actual: width,
            });
        }
        if value_batch != batch {
            return Err(ShapeError::ConditionBatch {
                step,
                expected: batch,
                actual: value_batch,
            });
        }

        let row = step * transition_dim;
        mask[row + action_dim..row + transition_dim].fill(0.0);

        values = values.slice_assign(
            [0..batch, step..step + 1, action_dim..transition_dim],
            value.clone().reshape([batch, 1, observation_dim]),
        );
    }

    let mask = Tensor::<B, 3>::from_data(TensorData::new(mask, [1, horizon, transition_dim]), &device);

    Ok(x * mask + values)
}
