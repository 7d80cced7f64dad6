use anyhow::{Result, anyhow};
use std::cmp::Ordering;

/// Multiple testing correction applied across all genes of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorrectionMethod {
    Bonferroni,
    Holm,
    #[default]
    BenjaminiHochberg,
    BenjaminiYekutieli,
}

impl CorrectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            CorrectionMethod::Bonferroni => "bonferroni",
            CorrectionMethod::Holm => "holm",
            CorrectionMethod::BenjaminiHochberg => "benjamini_hochberg",
            CorrectionMethod::BenjaminiYekutieli => "benjamini_yekutieli",
        }
    }
}

/// Adjust `p_values` with `method`. An empty slice gives an empty result.
pub fn adjust_p_values(p_values: &[f64], method: CorrectionMethod) -> Result<Vec<f64>> {
    if p_values.is_empty() {
        return Ok(Vec::new());
    }
    match method {
        CorrectionMethod::Bonferroni => bonferroni_correction(p_values),
        CorrectionMethod::Holm => holm_bonferroni_correction(p_values),
        CorrectionMethod::BenjaminiHochberg => benjamini_hochberg_correction(p_values),
        CorrectionMethod::BenjaminiYekutieli => benjamini_yekutieli_correction(p_values),
    }
}

fn validate(p_values: &[f64]) -> Result<()> {
    if p_values.is_empty() {
        return Err(anyhow!("Empty p-value array"));
    }
    for (i, &p) in p_values.iter().enumerate() {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("Invalid p-value at index {}: {}", i, p));
        }
    }
    Ok(())
}

/// Index-value pairs sorted by ascending p-value
fn sorted_ascending(p_values: &[f64]) -> Vec<(usize, f64)> {
    let mut indexed: Vec<(usize, f64)> = p_values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    indexed
}

/// Apply Bonferroni correction to p-values
///
/// Multiplies each p-value by the number of tests, capping at 1.
pub fn bonferroni_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len() as f64;
    Ok(p_values.iter().map(|&p| (p * n).min(1.0)).collect())
}

/// Apply Benjamini-Hochberg (BH) procedure for controlling false discovery rate
///
/// # Example
/// ```
/// use single_nblrt::testing::correction::benjamini_hochberg_correction;
///
/// let adjusted = benjamini_hochberg_correction(&[0.01, 0.03, 0.05]).unwrap();
/// assert!((adjusted[0] - 0.03).abs() < 1e-12);
/// ```
pub fn benjamini_hochberg_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    step_up(p_values, 1.0)
}

/// Apply Benjamini-Yekutieli (BY) procedure, valid under arbitrary dependence between tests
pub fn benjamini_yekutieli_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    let c_n: f64 = (1..=p_values.len()).map(|i| 1.0 / i as f64).sum();
    step_up(p_values, c_n)
}

fn step_up(p_values: &[f64], factor: f64) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();
    let indexed = sorted_ascending(p_values);

    let mut adjusted_p_values = vec![0.0; n];
    let mut current_min = 1.0f64;

    // Process from largest to smallest p-value
    for i in (0..n).rev() {
        let (orig_idx, p_val) = indexed[i];
        let rank = i + 1;
        let adjustment = (p_val * factor * n as f64 / rank as f64).min(1.0);
        current_min = adjustment.min(current_min);
        adjusted_p_values[orig_idx] = current_min;
    }

    Ok(adjusted_p_values)
}

/// Apply Holm-Bonferroni (step-down) method for controlling family-wise error rate
pub fn holm_bonferroni_correction(p_values: &[f64]) -> Result<Vec<f64>> {
    validate(p_values)?;
    let n = p_values.len();
    let indexed = sorted_ascending(p_values);

    let mut adjusted_p_values = vec![0.0; n];
    let mut current_max = 0.0f64;
    for (i, &(orig_idx, p_val)) in indexed.iter().enumerate() {
        let adjustment = (p_val * (n - i) as f64).min(1.0);
        current_max = current_max.max(adjustment);
        adjusted_p_values[orig_idx] = current_max;
    }

    Ok(adjusted_p_values)
}
