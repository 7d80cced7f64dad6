//! Error types for expression comparisons.
//!
//! Only whole-run failures are errors. Per-gene trouble (non-convergence, zero counts in a
//! group) is reported on the gene's result row via [`crate::testing::GeneStatus`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompareError {
    #[error("Input mismatch: {reason}")]
    InputMismatch { reason: String },

    #[error("Invalid model parameters: {reason}")]
    InvalidModelParams { reason: String },

    #[error("Invalid count matrix: {reason}")]
    InvalidCounts { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompareError {
    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        CompareError::InputMismatch {
            reason: reason.into(),
        }
    }
}

/// Result type alias for comparison operations
pub type Result<T> = std::result::Result<T, CompareError>;
