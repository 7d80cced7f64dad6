use std::fmt;

use single_utilities::traits::FloatOpsTS;

use crate::config::CompareConfig;
use crate::error::Result;
use crate::input::{CellLabeling, CountMatrix, GroupSpec, ModelParams, align_inputs};
use crate::testing::effect::GroupSummary;

pub mod correction;
pub mod effect;
pub mod inference;
pub mod parallel;
pub mod ranking;

pub mod utils;

pub use ranking::{Direction, ResultRow, ResultTable};

/// Per-gene outcome flag. Flagged genes still get a row with finite values.
///
/// A gene that is both degenerate and not converged has status `NotConverged`; the row's
/// `degenerate` field keeps the other flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneStatus {
    Ok,
    /// A group had only zero counts; the fold-change is the finite sentinel
    /// `±MAX_ABS_COEFFICIENT / ln 2`
    Degenerate,
    /// A fit did not converge even after the damped retry
    NotConverged,
}

impl GeneStatus {
    pub fn is_flagged(&self) -> bool {
        !matches!(self, GeneStatus::Ok)
    }
}

impl fmt::Display for GeneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GeneStatus::Ok => "ok",
            GeneStatus::Degenerate => "degenerate",
            GeneStatus::NotConverged => "not_converged",
        };
        f.write_str(s)
    }
}

/// Test outcome of one gene before ranking and multiple testing correction.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneTest {
    pub gene_id: String,
    /// Group 1 intercept of the alternative model (natural log scale)
    pub intercept: f64,
    /// Group 2 vs group 1 coefficient (natural log scale)
    pub coefficient: f64,
    /// `coefficient / ln 2`, positive when higher in group 2
    pub log_fc: f64,
    /// Likelihood-ratio statistic
    pub statistic: f64,
    pub p_value: f64,
    pub null_log_likelihood: f64,
    pub alt_log_likelihood: f64,
    pub summary: GroupSummary,
    pub status: GeneStatus,
    /// A group had only zero counts, whatever the status
    pub degenerate: bool,
}

/// Two-group differential expression with a negative binomial likelihood-ratio test.
pub trait CompareExpression {
    fn compare_expression(
        &self,
        params: &ModelParams,
        labeling: &CellLabeling,
        group1: &GroupSpec,
        group2: &GroupSpec,
        config: &CompareConfig,
    ) -> Result<ResultTable>;
}

impl<T> CompareExpression for CountMatrix<T>
where
    T: FloatOpsTS,
{
    fn compare_expression(
        &self,
        params: &ModelParams,
        labeling: &CellLabeling,
        group1: &GroupSpec,
        group2: &GroupSpec,
        config: &CompareConfig,
    ) -> Result<ResultTable> {
        compare_expression(self, params, labeling, group1, group2, config)
    }
}

/// Test every gene for a difference in mean expression between `group1` and `group2`.
///
/// For each gene a null (`log mu = b0 + offset`) and an alternative
/// (`log mu = b1 + b2 * x + offset`, `x = 1` in group 2) negative binomial model are fitted with
/// the gene's fixed dispersion. Rows come back sorted by p-value.
///
/// Input problems fail the whole call before any gene is fitted; per-gene problems are flagged
/// on the gene's row.
pub fn compare_expression<T>(
    counts: &CountMatrix<T>,
    params: &ModelParams,
    labeling: &CellLabeling,
    group1: &GroupSpec,
    group2: &GroupSpec,
    config: &CompareConfig,
) -> Result<ResultTable>
where
    T: FloatOpsTS,
{
    let aligned = align_inputs(counts, params, labeling, group1, group2, config)?;
    let tests = parallel::test_all_genes(&aligned, config)?;

    let (n_cells1, n_cells2) = aligned.group_sizes();
    let table = ResultTable::build(tests, config.correction)?
        .with_group_sizes(n_cells1, n_cells2)
        .with_filtered_genes(aligned.n_filtered());

    Ok(table)
}
