//! Per-gene model fitting and the likelihood-ratio test built on it.

pub mod glm;

pub mod lrt;

pub use glm::{FittedModelPair, GlmFit, GlmFitParams, MAX_ABS_COEFFICIENT};
