//! Exponential moving average of model weights
//!
//! The shadow model is an independently owned snapshot of the live model.
//! burn tensors are immutable values, so a clone taken here never observes
//! later optimizer updates of the live module.

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::prelude::*;

use diffuser_core::error::ConfigError;

/// EMA configuration
#[derive(Debug, Clone)]
pub struct EmaConfig {
    /// Weight of the previous shadow value
    pub decay: f32,
    /// Steps before averaging begins; until then the shadow tracks the live model
    pub step_start: usize,
    /// Only every `update_every`-th step touches the shadow
    pub update_every: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            decay: 0.995,
            step_start: 2000,
            update_every: 10,
        }
    }
}

impl EmaConfig {
    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_step_start(mut self, step_start: usize) -> Self {
        self.step_start = step_start;
        self
    }

    pub fn with_update_every(mut self, update_every: usize) -> Self {
        self.update_every = update_every;
        self
    }

    /// Snapshots `live` into a new shadow model
    pub fn init<B: Backend, M: Module<B>>(&self, live: &M) -> Result<Ema<B, M>, ConfigError> {
        Ema::new(self.clone(), live)
    }
}

/// What a call to [`Ema::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmaUpdate {
    /// Not an update step
    Skipped,
    /// Warm-up: shadow replaced by a copy of the live model
    Reset,
    /// Shadow moved towards the live model
    Averaged,
}

/// Shadow model updated as `shadow = shadow * decay + live * (1 - decay)`
#[derive(Debug)]
pub struct Ema<B: Backend, M: Module<B>> {
    shadow: M,
    config: EmaConfig,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> Ema<B, M> {
    /// Creates the shadow model as a copy of `live`
    pub fn new(config: EmaConfig, live: &M) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&config.decay) {
            return Err(ConfigError::InvalidDecay(config.decay));
        }
        if config.update_every == 0 {
            return Err(ConfigError::Zero("update_every"));
        }

        Ok(Self {
            shadow: live.clone().no_grad(),
            config,
            _backend: PhantomData,
        })
    }

    pub fn config(&self) -> &EmaConfig {
        &self.config
    }

    /// The averaged model
    pub fn shadow(&self) -> &M {
        &self.shadow
    }

    pub fn into_shadow(self) -> M {
        self.shadow
    }

    /// Replaces the shadow with a copy of `live`
    pub fn reset(&mut self, live: &M) {
        self.shadow = live.clone().no_grad();
    }

    /// Advances the average after training step `step`
    pub fn step(&mut self, live: &M, step: usize) -> EmaUpdate {
        if step % self.config.update_every != 0 {
            return EmaUpdate::Skipped;
        }
        if step < self.config.step_start {
            tracing::trace!(step, "resetting ema shadow");
            self.reset(live);
            return EmaUpdate::Reset;
        }

        let mut collector = ParamCollector::default();
        live.visit(&mut collector);

        let mut averager = ParamAverager {
            live: collector.params,
            decay: self.config.decay,
        };
        self.shadow = self.shadow.clone().map(&mut averager);

        tracing::trace!(step, decay = self.config.decay, "updated ema shadow");
        EmaUpdate::Averaged
    }
}

/// Flattened, detached copies of every float parameter
struct ParamCollector<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> Default for ParamCollector<B> {
    fn default() -> Self {
        Self {
            params: HashMap::new(),
        }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let value = param.val().detach();
        let numel = value.shape().num_elements();
        self.params.insert(param.id, value.reshape([numel]));
    }
}

struct ParamAverager<B: Backend> {
    live: HashMap<ParamId, Tensor<B, 1>>,
    decay: f32,
}

impl<B: Backend> ModuleMapper<B> for ParamAverager<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(live) = self.live.remove(&param.id) else {
            return param;
        };
        let decay = self.decay;

        param.map(|shadow| {
            let live: Tensor<B, D> = live.reshape(shadow.dims());
            (shadow.mul_scalar(decay) + live.mul_scalar(1.0 - decay)).detach()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Adds a constant to every float parameter
    struct Shift(f32);

    impl<B: Backend> ModuleMapper<B> for Shift {
        fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
            let shift = self.0;
            param.map(|t| t.add_scalar(shift))
        }
    }

    fn weights(linear: &Linear<TestBackend>) -> Vec<f32> {
        linear.weight.val().into_data().to_vec().unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        let device = Default::default();
        let live: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);

        let err = EmaConfig::default().with_decay(1.5).init(&live).unwrap_err();
        assert_eq!(err, ConfigError::InvalidDecay(1.5));

        let err = EmaConfig::default().with_update_every(0).init(&live).unwrap_err();
        assert_eq!(err, ConfigError::Zero("update_every"));
    }

    #[test]
    fn test_shadow_is_independent_copy() {
        let device = Default::default();
        let live: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let ema = EmaConfig::default().init(&live).unwrap();

        let before = weights(&live);
        let live = live.map(&mut Shift(1.0));

        assert_eq!(weights(ema.shadow()), before);
        assert_ne!(weights(&live), before);
    }

    #[test]
    fn test_skips_and_resets_during_warmup() {
        let device = Default::default();
        let live: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let mut ema = EmaConfig::default()
            .with_step_start(100)
            .with_update_every(10)
            .init(&live)
            .unwrap();
        let original = weights(ema.shadow());

        let live = live.map(&mut Shift(1.0));
        assert_eq!(ema.step(&live, 5), EmaUpdate::Skipped);
        assert_eq!(weights(ema.shadow()), original);

        assert_eq!(ema.step(&live, 10), EmaUpdate::Reset);
        assert_eq!(weights(ema.shadow()), weights(&live));
    }

    #[test]
    fn test_averages_after_warmup() {
        let device = Default::default();
        let live: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let mut ema = EmaConfig::default()
            .with_decay(0.75)
            .with_step_start(0)
            .with_update_every(1)
            .init(&live)
            .unwrap();

        let bias = |linear: &Linear<TestBackend>| -> Vec<f32> {
            linear.bias.as_ref().unwrap().val().into_data().to_vec().unwrap()
        };
        let weight_before = weights(ema.shadow());
        let bias_before = bias(ema.shadow());

        let live = live.map(&mut Shift(4.0));
        assert_eq!(ema.step(&live, 1), EmaUpdate::Averaged);

        // 0.75 * w + 0.25 * (w + 4) = w + 1
        for (after, before) in weights(ema.shadow()).iter().zip(weight_before) {
            assert!((after - (before + 1.0)).abs() < 1e-5);
        }
        for (after, before) in bias(ema.shadow()).iter().zip(bias_before) {
            assert!((after - (before + 1.0)).abs() < 1e-5);
        }
    }
}
