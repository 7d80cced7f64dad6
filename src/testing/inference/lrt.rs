//! Likelihood-ratio test between the null and the alternative fit of one gene.
//!
//! `D = 2 * (logL_alt - logL_null)` is referred to a chi-square distribution with one degree of
//! freedom. The alternative nests the null, so a negative `D` can only be rounding error; it is
//! clamped to 0 with p = 1.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use super::glm::FittedModelPair;
use crate::testing::effect::{GroupSummary, coefficient_to_log2_fc};
use crate::testing::{GeneStatus, GeneTest};

/// Upper tail of chi-square(1) at `statistic`, in [0, 1].
pub fn chi_square_p_value(statistic: f64) -> f64 {
    if !(statistic > 0.0) {
        return 1.0;
    }
    if statistic.is_infinite() {
        return 0.0;
    }
    match ChiSquared::new(1.0) {
        Ok(dist) => dist.sf(statistic).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// `2 * (ll_alt - ll_null)` clamped at zero. `None` when either likelihood is not finite.
pub fn lr_statistic(ll_null: f64, ll_alt: f64) -> Option<f64> {
    let d = 2.0 * (ll_alt - ll_null);
    if d.is_finite() { Some(d.max(0.0)) } else { None }
}

/// Turn the fitted pair of one gene into its test row.
pub fn assemble(gene_id: &str, pair: &FittedModelPair, summary: GroupSummary) -> GeneTest {
    let mut status = if !pair.converged() {
        GeneStatus::NotConverged
    } else if pair.degenerate() {
        GeneStatus::Degenerate
    } else {
        GeneStatus::Ok
    };

    let (statistic, p_value) =
        match lr_statistic(pair.null.log_likelihood, pair.alternative.log_likelihood) {
            Some(d) => (d, chi_square_p_value(d)),
            None => {
                status = GeneStatus::NotConverged;
                (0.0, 1.0)
            }
        };

    let finite_or = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };
    let intercept = finite_or(pair.alternative.coefficients[0], 0.0);
    let coefficient = finite_or(pair.alternative.coefficients[1], 0.0);
    if !pair.alternative.coefficients[1].is_finite() {
        status = GeneStatus::NotConverged;
    }

    GeneTest {
        gene_id: gene_id.to_string(),
        intercept,
        coefficient,
        log_fc: coefficient_to_log2_fc(coefficient),
        statistic,
        p_value,
        null_log_likelihood: pair.null.log_likelihood,
        alt_log_likelihood: pair.alternative.log_likelihood,
        summary,
        status,
        degenerate: pair.degenerate(),
    }
}
