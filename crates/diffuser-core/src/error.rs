//! Error types shared by the trajectory diffusion crates
//!
//! Configuration problems are reported when a model is built and are never
//! retried. Shape problems are caller errors detected when a tensor enters
//! the diffusion core.

use thiserror::Error;

/// Invalid construction-time configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("diffusion needs at least 2 steps, got {0}")]
    TooFewSteps(usize),

    #[error("schedule offset must be finite and non-negative, got {0}")]
    InvalidScheduleOffset(f64),

    #[error("degenerate noise schedule: {0}")]
    DegenerateSchedule(String),

    #[error("horizon {horizon} is not divisible by {factor} ({downsamples} down-samplings)")]
    HorizonNotDivisible {
        horizon: usize,
        factor: usize,
        downsamples: usize,
    },

    #[error("dimension multipliers must not be empty")]
    EmptyDimMults,

    #[error("embedding width must be even and at least 4, got {0}")]
    InvalidEmbeddingDim(usize),

    #[error("{channels} channels cannot be split into {groups} normalization groups")]
    GroupMismatch { channels: usize, groups: usize },

    #[error("unknown loss type: {0}")]
    UnknownLoss(String),

    #[error("loss weight index {index} is outside the observation ({observation_dim} dims)")]
    LossWeightIndex { index: usize, observation_dim: usize },

    #[error("loss discount {0} gives a non-positive mean over the horizon")]
    InvalidDiscount(f32),

    #[error("action weight must be finite and non-negative, got {0}")]
    InvalidActionWeight(f32),

    #[error("EMA decay must lie in [0, 1], got {0}")]
    InvalidDecay(f32),

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Tensor shape that does not match the model it is passed to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("trajectory has {actual} channels, expected transition dim {expected}")]
    TransitionDim { expected: usize, actual: usize },

    #[error("trajectory horizon {actual} does not match {expected}")]
    Horizon { expected: usize, actual: usize },

    #[error("trajectory horizon must be non-zero")]
    ZeroHorizon,

    #[error("horizon {horizon} is not divisible by the denoiser's down-sampling factor {factor}")]
    HorizonNotDivisible { horizon: usize, factor: usize },

    #[error("timestep batch of {actual} does not match trajectory batch {expected}")]
    TimestepBatch { expected: usize, actual: usize },

    #[error("condition at step {step} is outside horizon {horizon}")]
    ConditionStep { step: usize, horizon: usize },

    #[error("condition at step {step} has width {actual}, expected observation dim {expected}")]
    ConditionDim {
        step: usize,
        expected: usize,
        actual: usize,
    },

    #[error("condition at step {step} has batch {actual}, expected {expected}")]
    ConditionBatch {
        step: usize,
        expected: usize,
        actual: usize,
    },

    #[error("conditional sampling needs at least one condition to infer the batch size")]
    EmptyConditions,

    #[error("prediction shape {pred:?} does not match target shape {target:?}")]
    Mismatch { pred: Vec<usize>, target: Vec<usize> },
}

/// Any failure raised by the diffusion core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffusionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}
