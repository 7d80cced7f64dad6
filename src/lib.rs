//! # single-nblrt
//!
//! Negative binomial likelihood-ratio differential expression testing for single-cell data, part
//! of the single-rust ecosystem.
//!
//! Given a sparse gene × cell count matrix, per-gene dispersions and per-cell offsets from an
//! upstream variance-stabilizing regression, and two groups of cells, every gene is tested for a
//! difference in mean expression. Two nested negative binomial models with the gene's fixed
//! dispersion and offsets are fitted, an intercept-only null and an intercept plus group
//! indicator alternative, and compared with a likelihood-ratio test. The group coefficient gives
//! the log2 fold-change.
//!
//! ## Quick Start
//!
//! Build a [`input::CountMatrix`], [`input::ModelParams`] and [`input::CellLabeling`], describe
//! both sides with [`input::GroupSpec`] and call [`testing::compare_expression`] (or the
//! [`testing::CompareExpression`] trait method on the count matrix). The returned
//! [`testing::ResultTable`] is sorted by p-value.
//!
//! ## Module Organization
//!
//! - **[`input`]**: input types, group resolution and alignment
//! - **[`testing`]**: model fitting, likelihood-ratio test, correction, ranking
//! - **[`config`]**: comparison options
//! - **[`error`]**: error type

pub mod config;
pub mod error;
pub mod input;
pub mod testing;

pub use config::CompareConfig;
pub use error::{CompareError, Result};
pub use input::{CellLabeling, CountMatrix, GroupSpec, ModelParams, OffsetSource};
pub use testing::{CompareExpression, GeneStatus, ResultRow, ResultTable, compare_expression};
