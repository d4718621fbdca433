//! Injected random source
//!
//! Every stochastic operation of the diffusion process draws from a
//! [`NoiseSource`] passed in by the caller, never from global RNG state, so a
//! fixed seed reproduces a sampling run or a training batch exactly.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Source of the randomness consumed by the diffusion process
pub trait NoiseSource {
    /// Draws one standard-normal value
    fn next_normal(&mut self) -> f32;

    /// Draws one timestep uniformly from `[0, num_steps)`
    fn next_timestep(&mut self, num_steps: usize) -> usize;

    /// Standard-normal tensor of the given shape
    fn standard_normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D>
    where
        Self: Sized,
    {
        let len = shape.iter().product();
        let values: Vec<f32> = (0..len).map(|_| self.next_normal()).collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// One uniform timestep per batch element
    fn timesteps<B: Backend>(
        &mut self,
        batch: usize,
        num_steps: usize,
        device: &B::Device,
    ) -> Tensor<B, 1, Int>
    where
        Self: Sized,
    {
        let values: Vec<i64> = (0..batch)
            .map(|_| self.next_timestep(num_steps) as i64)
            .collect();
        Tensor::from_data(TensorData::new(values, [batch]), device)
    }
}

/// Seedable noise backed by [`StdRng`]
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    /// Creates a source whose samples are fully determined by `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn next_normal(&mut self) -> f32 {
        self.rng.sample(StandardNormal)
    }

    fn next_timestep(&mut self, num_steps: usize) -> usize {
        self.rng.gen_range(0..num_steps)
    }
}
