//! Negative binomial GLM fitting with fixed offsets and fixed dispersion.
//!
//! Each gene gets two fits that share the offsets `o_i` and the dispersion `theta`:
//!
//! - null: `log(mu_i) = b0 + o_i`
//! - alternative: `log(mu_i) = b1 + b2 * x_i + o_i` with `x_i = 1` for group 2
//!
//! Coefficients are found by IRLS (Fisher scoring). The log-likelihood is concave in the
//! coefficients, so a run that fails is retried once with damped, step-halving updates before the
//! fit is reported as not converged.

use statrs::function::gamma::ln_gamma;

use crate::input::GeneData;
use crate::testing::utils::split_by_indicator;

/// Magnitude at which the group coefficient is considered diverged. Also the value reported for the
/// group coefficient when one group has no counts at all (|log2 FC| = 30 / ln 2, about 43.3).
pub const MAX_ABS_COEFFICIENT: f64 = 30.0;

/// Linear predictor clamp against `exp` overflow
const MAX_ETA: f64 = 700.0;

/// Step halvings per damped iteration
const MAX_STEP_HALVINGS: usize = 30;

/// Added to the group sums when computing starting values
const START_PSEUDO_COUNT: f64 = 0.1;

/// IRLS controls.
#[derive(Debug, Clone)]
pub struct GlmFitParams {
    /// Iteration cap of the first attempt. The damped retry gets twice as many.
    pub max_iter: usize,
    /// Relative deviance change at which a fit counts as converged
    pub tolerance: f64,
    /// Initial step factor of the damped retry
    pub damping: f64,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        GlmFitParams {
            max_iter: 100,
            tolerance: 1e-8,
            damping: 0.5,
        }
    }
}

/// Log-likelihood of one count under NB(mean `mu`, size `theta`).
///
/// `lgamma(y+theta) - lgamma(theta) - lgamma(y+1) + theta*ln(theta/(theta+mu)) + y*ln(mu/(theta+mu))`.
/// The `y = 0, mu = 0` limit is 0.
pub fn nb_log_likelihood(y: f64, mu: f64, theta: f64) -> f64 {
    if theta <= 0.0 || mu < 0.0 {
        return f64::NEG_INFINITY;
    }
    if mu == 0.0 {
        return if y == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0) + nb_kernel(y, mu, theta)
}

/// The part of the NB log-likelihood that depends on `mu`
#[inline]
fn nb_kernel(y: f64, mu: f64, theta: f64) -> f64 {
    let denom = theta + mu;
    let mut ll = theta * (theta / denom).ln();
    if y > 0.0 {
        ll += y * (mu / denom).ln();
    }
    ll
}

/// One fitted model.
#[derive(Debug, Clone, PartialEq)]
pub struct GlmFit {
    pub coefficients: Vec<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Whether the damped retry was needed
    pub damped: bool,
    /// A group had only zero counts; diverging coefficients are reported as
    /// `±MAX_ABS_COEFFICIENT`
    pub degenerate: bool,
}

impl GlmFit {
    fn boundary(coefficients: Vec<f64>, log_likelihood: f64) -> Self {
        GlmFit {
            coefficients,
            log_likelihood,
            iterations: 0,
            converged: true,
            damped: false,
            degenerate: true,
        }
    }
}

/// Null and alternative fit of one gene.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModelPair {
    pub null: GlmFit,
    pub alternative: GlmFit,
}

impl FittedModelPair {
    pub fn converged(&self) -> bool {
        self.null.converged && self.alternative.converged
    }

    pub fn degenerate(&self) -> bool {
        self.null.degenerate || self.alternative.degenerate
    }
}

/// Fit both models for one gene.
pub fn fit_gene(
    data: &GeneData,
    indicator: &[bool],
    theta: f64,
    params: &GlmFitParams,
) -> FittedModelPair {
    FittedModelPair {
        null: fit_null(&data.counts, &data.offsets, theta, params),
        alternative: fit_alternative(&data.counts, &data.offsets, indicator, theta, params),
    }
}

/// Intercept-only model `log(mu_i) = b0 + o_i`.
pub fn fit_null(counts: &[f64], offsets: &[f64], theta: f64, params: &GlmFitParams) -> GlmFit {
    if counts.iter().all(|&y| y == 0.0) {
        // sup of the likelihood is at mu = 0, where every term is exactly 0
        return GlmFit::boundary(vec![-MAX_ABS_COEFFICIENT], 0.0);
    }
    let obs = Observations::new(counts, offsets, Design::Intercept, theta);
    obs.fit(params)
}

/// Two-group model `log(mu_i) = b1 + b2 * x_i + o_i`.
///
/// A group whose counts are all zero makes its mean estimate 0 and `b2` diverge. That group then
/// contributes exactly 0 to the maximized log-likelihood, the other group is fitted on its own,
/// and `b2` is reported as `±MAX_ABS_COEFFICIENT` with `b1 + b2` still the group-2 intercept.
pub fn fit_alternative(
    counts: &[f64],
    offsets: &[f64],
    indicator: &[bool],
    theta: f64,
    params: &GlmFitParams,
) -> GlmFit {
    let (group1, group2) = split_by_indicator(indicator);

    if group1.is_empty() || group2.is_empty() {
        // b2 is not identifiable; the model collapses onto the null
        let mut fit = fit_null(counts, offsets, theta, params);
        fit.coefficients.push(0.0);
        fit.degenerate = true;
        return fit;
    }

    let zero1 = group1.iter().all(|&i| counts[i] == 0.0);
    let zero2 = group2.iter().all(|&i| counts[i] == 0.0);

    match (zero1, zero2) {
        (true, true) => GlmFit::boundary(vec![-MAX_ABS_COEFFICIENT, 0.0], 0.0),
        (false, true) => {
            let mut fit = fit_subset(counts, offsets, &group1, theta, params);
            let b1 = fit.coefficients[0];
            fit.coefficients = vec![b1, -MAX_ABS_COEFFICIENT];
            fit.degenerate = true;
            fit
        }
        (true, false) => {
            let mut fit = fit_subset(counts, offsets, &group2, theta, params);
            let b = fit.coefficients[0];
            fit.coefficients = vec![b - MAX_ABS_COEFFICIENT, MAX_ABS_COEFFICIENT];
            fit.degenerate = true;
            fit
        }
        (false, false) => {
            let obs = Observations::new(counts, offsets, Design::GroupIndicator(indicator), theta);
            obs.fit(params)
        }
    }
}

fn fit_subset(
    counts: &[f64],
    offsets: &[f64],
    members: &[usize],
    theta: f64,
    params: &GlmFitParams,
) -> GlmFit {
    let y: Vec<f64> = members.iter().map(|&i| counts[i]).collect();
    let o: Vec<f64> = members.iter().map(|&i| offsets[i]).collect();
    Observations::new(&y, &o, Design::Intercept, theta).fit(params)
}

#[derive(Debug, Clone, Copy)]
enum Design<'a> {
    Intercept,
    GroupIndicator(&'a [bool]),
}

impl Design<'_> {
    fn n_coef(&self) -> usize {
        match self {
            Design::Intercept => 1,
            Design::GroupIndicator(_) => 2,
        }
    }

    #[inline]
    fn row(&self, i: usize) -> [f64; 2] {
        match self {
            Design::Intercept => [1.0, 0.0],
            Design::GroupIndicator(x) => [1.0, if x[i] { 1.0 } else { 0.0 }],
        }
    }

    /// Only the group coefficient is bounded; the intercept follows the offsets' scale.
    fn slope_diverged(&self, beta: &[f64]) -> bool {
        match self {
            Design::Intercept => false,
            Design::GroupIndicator(_) => beta[1].abs() > MAX_ABS_COEFFICIENT,
        }
    }

    #[inline]
    fn linear(&self, i: usize, beta: &[f64]) -> f64 {
        let x = self.row(i);
        (0..self.n_coef()).map(|j| x[j] * beta[j]).sum()
    }
}

/// Counts, offsets and design of one fit, with the coefficient-free part of the
/// log-likelihood precomputed.
struct Observations<'a> {
    counts: &'a [f64],
    offsets: &'a [f64],
    design: Design<'a>,
    theta: f64,
    constant: f64,
}

/// Outcome of one IRLS run
struct IrlsRun {
    beta: Vec<f64>,
    log_likelihood: f64,
    iterations: usize,
    converged: bool,
}

impl<'a> Observations<'a> {
    fn new(counts: &'a [f64], offsets: &'a [f64], design: Design<'a>, theta: f64) -> Self {
        let constant = counts
            .iter()
            .map(|&y| ln_gamma(y + theta) - ln_gamma(theta) - ln_gamma(y + 1.0))
            .sum();
        Observations {
            counts,
            offsets,
            design,
            theta,
            constant,
        }
    }

    #[inline]
    fn mu(&self, i: usize, beta: &[f64]) -> f64 {
        let eta = self.design.linear(i, beta) + self.offsets[i];
        eta.clamp(-MAX_ETA, MAX_ETA).exp()
    }

    fn log_likelihood(&self, beta: &[f64]) -> f64 {
        let kernel: f64 = (0..self.counts.len())
            .map(|i| nb_kernel(self.counts[i], self.mu(i, beta), self.theta))
            .sum();
        self.constant + kernel
    }

    /// Group-wise `ln((sum y + 0.1) / sum exp(o))`
    fn starting_values(&self) -> Vec<f64> {
        let mut sums = [0.0; 2];
        let mut expected = [0.0; 2];
        for i in 0..self.counts.len() {
            let g = self.design.row(i)[1] as usize;
            sums[g] += self.counts[i];
            expected[g] += self.offsets[i].clamp(-MAX_ETA, MAX_ETA).exp();
        }
        let log_rate = |g: usize| ((sums[g] + START_PSEUDO_COUNT) / expected[g]).ln();
        match self.design {
            Design::Intercept => vec![log_rate(0)],
            Design::GroupIndicator(_) => {
                let b1 = log_rate(0);
                vec![b1, log_rate(1) - b1]
            }
        }
    }

    fn fit(&self, params: &GlmFitParams) -> GlmFit {
        let start = self.starting_values();

        let plain = self.irls(&start, params.max_iter, None, params.tolerance);
        if plain.converged {
            return self.finish(plain, false);
        }

        let retry = self.irls(
            &start,
            2 * params.max_iter,
            Some(params.damping),
            params.tolerance,
        );
        if retry.converged || !plain.log_likelihood.is_finite() {
            return self.finish(retry, true);
        }
        // neither converged; report whichever got further up the likelihood
        if retry.log_likelihood >= plain.log_likelihood {
            self.finish(retry, true)
        } else {
            let mut fit = self.finish(plain, true);
            fit.iterations += 2 * params.max_iter;
            fit
        }
    }

    fn finish(&self, run: IrlsRun, damped: bool) -> GlmFit {
        GlmFit {
            coefficients: run.beta,
            log_likelihood: run.log_likelihood,
            iterations: run.iterations,
            converged: run.converged,
            damped,
            degenerate: false,
        }
    }

    /// Fisher scoring from `start`. With `damping`, each update is scaled by the damping factor
    /// and halved further until the log-likelihood does not decrease.
    fn irls(&self, start: &[f64], max_iter: usize, damping: Option<f64>, tol: f64) -> IrlsRun {
        let p = self.design.n_coef();
        let n = self.counts.len();

        let mut beta = start.to_vec();
        let mut ll = self.log_likelihood(&beta);
        let mut best = IrlsRun {
            beta: beta.clone(),
            log_likelihood: ll,
            iterations: 0,
            converged: false,
        };
        if !ll.is_finite() {
            return best;
        }

        for iter in 1..=max_iter {
            let mut xtwx = [0.0; 4];
            let mut xtwz = [0.0; 2];
            for i in 0..n {
                let x = self.design.row(i);
                let eta = self.design.linear(i, &beta);
                let mu = self.mu(i, &beta);
                let w = mu / (1.0 + mu / self.theta);
                let z = eta + (self.counts[i] - mu) / mu;
                for j in 0..p {
                    for k in 0..p {
                        xtwx[j * p + k] += x[j] * w * x[k];
                    }
                    xtwz[j] += x[j] * w * z;
                }
            }

            let proposal = match solve_symmetric(&xtwx[..p * p], &xtwz[..p]) {
                Some(b) if b.iter().all(|v| v.is_finite()) => b,
                _ => break,
            };

            let (candidate, candidate_ll) = match damping {
                None => {
                    let ll_new = self.log_likelihood(&proposal);
                    (proposal, ll_new)
                }
                Some(factor) => {
                    let mut step = factor;
                    let mut halvings = 0;
                    loop {
                        let trial: Vec<f64> = beta
                            .iter()
                            .zip(&proposal)
                            .map(|(b, t)| b + step * (t - b))
                            .collect();
                        let trial_ll = self.log_likelihood(&trial);
                        if (trial_ll.is_finite() && trial_ll >= ll) || halvings >= MAX_STEP_HALVINGS {
                            break (trial, trial_ll);
                        }
                        step *= 0.5;
                        halvings += 1;
                    }
                }
            };

            if self.design.slope_diverged(&candidate)
                || candidate.iter().any(|b| !b.is_finite())
                || !candidate_ll.is_finite()
            {
                break;
            }

            let dev = -2.0 * candidate_ll;
            let dev_old = -2.0 * ll;
            let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);

            beta = candidate;
            ll = candidate_ll;
            if ll >= best.log_likelihood {
                best.beta.clone_from(&beta);
                best.log_likelihood = ll;
            }
            best.iterations = iter;

            if conv_test < tol {
                best.beta = beta;
                best.log_likelihood = ll;
                best.converged = true;
                return best;
            }
        }

        best
    }
}

/// Solve `a x = b` for a small symmetric positive definite `a` (row-major) by Cholesky.
/// Returns `None` when `a` is not positive definite.
fn solve_symmetric(a: &[f64], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let mut l = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if !(sum > 0.0) {
                    return None;
                }
                l[i * n + j] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * y[j];
        }
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn total_ll(counts: &[f64], mus: &[f64], theta: f64) -> f64 {
        counts
            .iter()
            .zip(mus)
            .map(|(&y, &mu)| nb_log_likelihood(y, mu, theta))
            .sum()
    }

    #[test]
    fn test_nb_log_likelihood_matches_pmf() {
        // NB(mu = 2, theta = 1) is geometric with p = 1/3: P(0) = 1/3, P(1) = 2/9
        assert_abs_diff_eq!(nb_log_likelihood(0.0, 2.0, 1.0), (1.0f64 / 3.0).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(nb_log_likelihood(1.0, 2.0, 1.0), (2.0f64 / 9.0).ln(), epsilon = 1e-12);
        assert_eq!(nb_log_likelihood(0.0, 0.0, 3.0), 0.0);
        assert_eq!(nb_log_likelihood(2.0, 0.0, 3.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_null_fit_recovers_rate_with_zero_offsets() {
        // with equal offsets the intercept MLE is ln(mean) for any theta
        let counts = [3.0, 5.0, 4.0, 8.0, 0.0, 4.0];
        let offsets = [0.0; 6];
        let fit = fit_null(&counts, &offsets, 2.0, &GlmFitParams::default());
        assert!(fit.converged);
        assert!(!fit.degenerate);
        assert_abs_diff_eq!(fit.coefficients[0], 4.0f64.ln(), epsilon = 1e-6);

        let mus = vec![fit.coefficients[0].exp(); 6];
        assert_abs_diff_eq!(fit.log_likelihood, total_ll(&counts, &mus, 2.0), epsilon = 1e-8);
    }

    #[test]
    fn test_alternative_fit_recovers_group_means() {
        let counts = [2.0, 4.0, 3.0, 9.0, 12.0, 15.0];
        let offsets = [0.5; 6];
        let indicator = [false, false, false, true, true, true];
        let fit = fit_alternative(&counts, &offsets, &indicator, 4.0, &GlmFitParams::default());
        assert!(fit.converged);
        assert_abs_diff_eq!(fit.coefficients[0], 3.0f64.ln() - 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.coefficients[1], (12.0f64 / 3.0).ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_offsets_are_respected() {
        // counts proportional to exp(offset): the intercept absorbs nothing but the common rate
        let offsets = [0.0, 1.0, 2.0, 0.5];
        let counts: Vec<f64> = offsets.iter().map(|o: &f64| (2.0 * o.exp()).round()).collect();
        let fit = fit_null(&counts, &offsets, 50.0, &GlmFitParams::default());
        assert!(fit.converged);
        assert!((fit.coefficients[0] - 2.0f64.ln()).abs() < 0.1);
    }

    #[test]
    fn test_alternative_never_below_null() {
        let counts = [1.0, 0.0, 7.0, 2.0, 3.0, 0.0, 1.0, 5.0];
        let offsets = [-0.2, 0.1, 0.3, 0.0, 0.2, -0.1, 0.0, 0.4];
        let indicator = [false, true, false, true, false, true, false, true];
        let params = GlmFitParams::default();
        let null = fit_null(&counts, &offsets, 1.5, &params);
        let alt = fit_alternative(&counts, &offsets, &indicator, 1.5, &params);
        assert!(alt.log_likelihood >= null.log_likelihood - 1e-9);
    }

    #[test]
    fn test_zero_group_reports_sentinel() {
        let counts = [4.0, 6.0, 5.0, 0.0, 0.0, 0.0];
        let offsets = [0.0; 6];
        let indicator = [false, false, false, true, true, true];
        let params = GlmFitParams::default();
        let fit = fit_alternative(&counts, &offsets, &indicator, 5.0, &params);
        assert!(fit.degenerate);
        assert!(fit.converged);
        assert_eq!(fit.coefficients[1], -MAX_ABS_COEFFICIENT);
        assert_abs_diff_eq!(fit.coefficients[0], 5.0f64.ln(), epsilon = 1e-6);

        // group 1 alone carries the whole likelihood
        let group1 = fit_null(&counts[..3], &offsets[..3], 5.0, &params);
        assert_abs_diff_eq!(fit.log_likelihood, group1.log_likelihood, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_first_group_keeps_group2_intercept() {
        let counts = [0.0, 0.0, 2.0, 4.0];
        let offsets = [0.0; 4];
        let indicator = [false, false, true, true];
        let fit = fit_alternative(&counts, &offsets, &indicator, 5.0, &GlmFitParams::default());
        assert!(fit.degenerate);
        assert_eq!(fit.coefficients[1], MAX_ABS_COEFFICIENT);
        assert_abs_diff_eq!(fit.coefficients[0] + fit.coefficients[1], 3.0f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_all_zero_gene() {
        let counts = [0.0; 4];
        let offsets = [0.0; 4];
        let indicator = [false, false, true, true];
        let pair = fit_gene(
            &GeneData {
                counts: counts.to_vec(),
                offsets: offsets.to_vec(),
            },
            &indicator,
            1.0,
            &GlmFitParams::default(),
        );
        assert!(pair.degenerate());
        assert_eq!(pair.null.log_likelihood, 0.0);
        assert_eq!(pair.alternative.log_likelihood, 0.0);
        assert_eq!(pair.alternative.coefficients[1], 0.0);
    }

    #[test]
    fn test_starved_iterations_fall_back_to_damped_retry() {
        let counts = [10.0, 40.0, 25.0, 300.0, 280.0, 350.0];
        let offsets = [0.0; 6];
        let indicator = [false, false, false, true, true, true];
        let params = GlmFitParams {
            max_iter: 1,
            tolerance: 1e-14,
            damping: 0.5,
        };
        let fit = fit_alternative(&counts, &offsets, &indicator, 3.0, &params);
        assert!(fit.damped);
        assert!(!fit.converged);
        assert!(fit.log_likelihood.is_finite());
        assert!(fit.coefficients.iter().all(|b| b.is_finite()));
    }

    #[test]
    fn test_far_offsets_put_intercept_beyond_bound() {
        // mean counts of 5.5 and 9.5 against expected counts of exp(-32)
        let counts = [4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0];
        let offsets = [-32.0; 8];
        let indicator = [false, false, false, false, true, true, true, true];
        let params = GlmFitParams::default();

        let null = fit_null(&counts, &offsets, 5.0, &params);
        assert!(null.converged);
        assert!(!null.damped);
        assert!(null.iterations > 0);
        assert_abs_diff_eq!(null.coefficients[0], 7.5f64.ln() + 32.0, epsilon = 1e-6);

        let alt = fit_alternative(&counts, &offsets, &indicator, 5.0, &params);
        assert!(alt.converged);
        assert!(!alt.degenerate);
        assert_abs_diff_eq!(alt.coefficients[0], 5.5f64.ln() + 32.0, epsilon = 1e-6);
        assert_abs_diff_eq!(alt.coefficients[1], (9.5f64 / 5.5).ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_solve_symmetric() {
        let x = solve_symmetric(&[4.0, 2.0, 2.0, 3.0], &[2.0, 1.0]).unwrap();
        assert_abs_diff_eq!(x[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-12);
        assert!(solve_symmetric(&[1.0, 1.0, 1.0, 1.0], &[1.0, 1.0]).is_none());
    }
}
