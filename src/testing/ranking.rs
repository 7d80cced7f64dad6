//! Ranked result table.
//!
//! Rows are ordered by p-value, then by decreasing absolute log2 fold-change, then by gene
//! identifier, so the table does not depend on the order in which workers finished.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;

use crate::testing::GeneStatus;
use crate::testing::GeneTest;
use crate::testing::correction::{CorrectionMethod, adjust_p_values};

/// Sign of the fold-change. `Up` means higher in group 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn contains(&self, log_fc: f64) -> bool {
        match self {
            Direction::Up => log_fc > 0.0,
            Direction::Down => log_fc < 0.0,
        }
    }
}

/// One gene of a finished comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub gene_id: String,
    pub intercept: f64,
    pub coefficient: f64,
    pub log_fc: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub adjusted_p_value: f64,
    /// Mean raw count in group 1 / group 2
    pub mean1: f64,
    pub mean2: f64,
    /// Fraction of cells with a non-zero count in group 1 / group 2
    pub detection1: f64,
    pub detection2: f64,
    pub status: GeneStatus,
    /// A group had only zero counts; set even when `status` is `NotConverged`
    pub degenerate: bool,
    /// 1-based position in the table
    pub rank: usize,
}

impl ResultRow {
    fn new(test: GeneTest, adjusted_p_value: f64, rank: usize) -> Self {
        ResultRow {
            gene_id: test.gene_id,
            intercept: test.intercept,
            coefficient: test.coefficient,
            log_fc: test.log_fc,
            statistic: test.statistic,
            p_value: test.p_value,
            adjusted_p_value,
            mean1: test.summary.mean1,
            mean2: test.summary.mean2,
            detection1: test.summary.detection1,
            detection2: test.summary.detection2,
            status: test.status,
            degenerate: test.degenerate,
            rank,
        }
    }
}

/// Table order: p-value ascending, |log_fc| descending, gene id ascending.
pub fn compare_tests(a: &GeneTest, b: &GeneTest) -> Ordering {
    a.p_value
        .total_cmp(&b.p_value)
        .then_with(|| b.log_fc.abs().total_cmp(&a.log_fc.abs()))
        .then_with(|| a.gene_id.cmp(&b.gene_id))
}

/// Ranked results of one comparison.
#[derive(Debug, Clone)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
    index: HashMap<String, usize>,
    correction: CorrectionMethod,
    n_cells1: usize,
    n_cells2: usize,
    n_filtered: usize,
}

impl ResultTable {
    /// Correct, sort and rank the per-gene tests.
    pub fn build(mut tests: Vec<GeneTest>, correction: CorrectionMethod) -> Result<Self> {
        tests.sort_by(compare_tests);

        let p_values: Vec<f64> = tests.iter().map(|t| t.p_value).collect();
        let adjusted = adjust_p_values(&p_values, correction)?;

        let rows: Vec<ResultRow> = tests
            .into_iter()
            .zip(adjusted)
            .enumerate()
            .map(|(i, (test, adj))| ResultRow::new(test, adj, i + 1))
            .collect();

        let index = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.gene_id.clone(), i))
            .collect();

        Ok(ResultTable {
            rows,
            index,
            correction,
            n_cells1: 0,
            n_cells2: 0,
            n_filtered: 0,
        })
    }

    pub fn with_group_sizes(mut self, n_cells1: usize, n_cells2: usize) -> Self {
        self.n_cells1 = n_cells1;
        self.n_cells2 = n_cells2;
        self
    }

    pub fn with_filtered_genes(mut self, n_filtered: usize) -> Self {
        self.n_filtered = n_filtered;
        self
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultRow> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, gene_id: &str) -> Option<&ResultRow> {
        self.index.get(gene_id).map(|&i| &self.rows[i])
    }

    /// Cells compared in group 1 and group 2
    pub fn group_sizes(&self) -> (usize, usize) {
        (self.n_cells1, self.n_cells2)
    }

    /// Genes dropped by the detection filter
    pub fn n_filtered(&self) -> usize {
        self.n_filtered
    }

    pub fn correction(&self) -> CorrectionMethod {
        self.correction
    }

    /// First `n` rows
    pub fn top(&self, n: usize) -> &[ResultRow] {
        &self.rows[..n.min(self.rows.len())]
    }

    /// Rows whose fold-change points in `direction`, in table order
    pub fn by_direction(&self, direction: Direction) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(move |r| direction.contains(r.log_fc))
    }

    /// Top `n` rows up and top `n` rows down
    pub fn top_per_direction(&self, n: usize) -> (Vec<&ResultRow>, Vec<&ResultRow>) {
        (
            self.by_direction(Direction::Up).take(n).collect(),
            self.by_direction(Direction::Down).take(n).collect(),
        )
    }

    /// Rows with adjusted p-value below `alpha`
    pub fn significant(&self, alpha: f64) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(move |r| r.adjusted_p_value < alpha)
    }

    /// Rows flagged degenerate or not converged
    pub fn flagged(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(|r| r.status.is_flagged())
    }
}

impl<'a> IntoIterator for &'a ResultTable {
    type Item = &'a ResultRow;
    type IntoIter = std::slice::Iter<'a, ResultRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::effect::GroupSummary;

    fn test_row(gene_id: &str, p_value: f64, log_fc: f64) -> GeneTest {
        GeneTest {
            gene_id: gene_id.to_string(),
            intercept: 0.0,
            coefficient: log_fc * std::f64::consts::LN_2,
            log_fc,
            statistic: 0.0,
            p_value,
            null_log_likelihood: 0.0,
            alt_log_likelihood: 0.0,
            summary: GroupSummary::default(),
            status: GeneStatus::Ok,
            degenerate: false,
        }
    }

    #[test]
    fn test_ties_broken_by_fold_change_then_id() {
        let tests = vec![
            test_row("b", 0.01, 1.0),
            test_row("a", 0.01, 1.0),
            test_row("c", 0.01, -3.0),
            test_row("d", 0.001, 0.1),
            test_row("e", 0.5, 5.0),
        ];
        let table = ResultTable::build(tests, CorrectionMethod::BenjaminiHochberg).unwrap();
        let order: Vec<&str> = table.iter().map(|r| r.gene_id.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "a", "b", "e"]);
        assert_eq!(table.get("a").unwrap().rank, 3);
        assert!(table.iter().all(|r| r.adjusted_p_value >= r.p_value));
    }

    #[test]
    fn test_direction_filters() {
        let tests = vec![
            test_row("up1", 0.001, 2.0),
            test_row("down1", 0.002, -1.0),
            test_row("up2", 0.003, 0.5),
            test_row("flat", 0.9, 0.0),
        ];
        let table = ResultTable::build(tests, CorrectionMethod::Bonferroni).unwrap();
        let (up, down) = table.top_per_direction(1);
        assert_eq!(up[0].gene_id, "up1");
        assert_eq!(down[0].gene_id, "down1");
        assert_eq!(table.by_direction(Direction::Up).count(), 2);
        assert_eq!(table.top(10).len(), 4);
        assert_eq!(table.significant(0.01).count(), 2);
    }

    #[test]
    fn test_empty_table() {
        let table = ResultTable::build(Vec::new(), CorrectionMethod::BenjaminiHochberg).unwrap();
        assert!(table.is_empty());
        assert!(table.top(3).is_empty());
    }
}
