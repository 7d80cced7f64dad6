//! Effect sizes reported next to the likelihood-ratio test.
//!
//! The fold-change of a row comes from the fitted group coefficient. The raw per-group means and
//! detection rates are descriptive only; they ignore the offsets.

use std::f64::consts::LN_2;

use crate::input::GeneData;

/// Natural-log coefficient to log2 fold-change
#[inline]
pub fn coefficient_to_log2_fc(coefficient: f64) -> f64 {
    coefficient / LN_2
}

/// Raw expression summary of one gene in both groups.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroupSummary {
    /// Mean count in group 1
    pub mean1: f64,
    /// Mean count in group 2
    pub mean2: f64,
    /// Fraction of group 1 cells with a non-zero count
    pub detection1: f64,
    /// Fraction of group 2 cells with a non-zero count
    pub detection2: f64,
}

impl GroupSummary {
    /// Log2 ratio of the raw group means, `log2((mean2 + pc) / (mean1 + pc))`.
    pub fn empirical_log2_fc(&self, pseudo_count: f64) -> f64 {
        ((self.mean2 + pseudo_count) / (self.mean1 + pseudo_count)).log2()
    }
}

pub fn summarize_groups(data: &GeneData, indicator: &[bool]) -> GroupSummary {
    let mut sums = [0.0; 2];
    let mut detected = [0usize; 2];
    let mut sizes = [0usize; 2];

    for (&y, &x) in data.counts.iter().zip(indicator) {
        let g = x as usize;
        sizes[g] += 1;
        sums[g] += y;
        if y > 0.0 {
            detected[g] += 1;
        }
    }

    let ratio = |num: f64, n: usize| if n == 0 { 0.0 } else { num / n as f64 };

    GroupSummary {
        mean1: ratio(sums[0], sizes[0]),
        mean2: ratio(sums[1], sizes[1]),
        detection1: ratio(detected[0] as f64, sizes[0]),
        detection2: ratio(detected[1] as f64, sizes[1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_summarize_groups() {
        let data = GeneData {
            counts: vec![0.0, 2.0, 4.0, 10.0, 0.0, 0.0],
            offsets: vec![0.0; 6],
        };
        let indicator = [false, false, false, true, true, true];
        let s = summarize_groups(&data, &indicator);
        assert_abs_diff_eq!(s.mean1, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.mean2, 10.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.detection1, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.detection2, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log2_fc_conversion() {
        assert_abs_diff_eq!(coefficient_to_log2_fc(2.0f64.ln()), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(coefficient_to_log2_fc(-(4.0f64.ln())), -2.0, epsilon = 1e-12);

        let s = GroupSummary {
            mean1: 5.0,
            mean2: 10.0,
            ..Default::default()
        };
        assert_abs_diff_eq!(s.empirical_log2_fc(0.0), 1.0, epsilon = 1e-12);
    }
}
