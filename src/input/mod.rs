//! Inputs of a comparison and their alignment.
//!
//! A comparison reads three things: the sparse counts ([`CountMatrix`]), the per-gene model
//! supplied by an upstream variance-stabilizing regression ([`ModelParams`]), and a cell
//! labeling reduced to two groups ([`GroupSpec`]). [`align_inputs`] checks that they describe the
//! same genes and cells and produces an [`AlignedInput`], a borrowing view that maps every tested
//! gene and compared cell back into both inputs without copying either of them.

mod groups;

pub use groups::{CellLabeling, GroupSpec};

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, Array2};
use num_traits::ToPrimitive;
use rand::SeedableRng;
use rand::rngs::StdRng;
use single_utilities::traits::FloatOpsTS;

use crate::config::CompareConfig;
use crate::error::{CompareError, Result};

/// Sparse counts, genes × cells, with identifiers for both axes.
#[derive(Debug, Clone)]
pub struct CountMatrix<T> {
    counts: CsrMatrix<T>,
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
}

impl<T> CountMatrix<T>
where
    T: FloatOpsTS,
{
    /// Wrap a CSR matrix. Entries have to be non-negative whole numbers and identifiers unique.
    pub fn new(counts: CsrMatrix<T>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        if counts.nrows() != gene_ids.len() || counts.ncols() != cell_ids.len() {
            return Err(CompareError::mismatch(format!(
                "count matrix is {}x{} but {} gene and {} cell identifiers were given",
                counts.nrows(),
                counts.ncols(),
                gene_ids.len(),
                cell_ids.len()
            )));
        }
        ensure_unique("gene", &gene_ids)?;
        ensure_unique("cell", &cell_ids)?;

        for (row, lane) in counts.row_iter().enumerate() {
            for (&col, value) in lane.col_indices().iter().zip(lane.values()) {
                let v = ToPrimitive::to_f64(value).unwrap_or(f64::NAN);
                if !v.is_finite() || v < 0.0 || v.fract() != 0.0 {
                    return Err(CompareError::InvalidCounts {
                        reason: format!(
                            "entry ({}, {}) for gene '{}' is {}, expected a non-negative integer",
                            row, col, gene_ids[row], v
                        ),
                    });
                }
            }
        }

        Ok(CountMatrix {
            counts,
            gene_ids,
            cell_ids,
        })
    }

    pub fn counts(&self) -> &CsrMatrix<T> {
        &self.counts
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }
}

/// Per-gene, per-cell log offsets.
#[derive(Debug, Clone)]
pub enum OffsetSource {
    /// genes × cells matrix of log expected counts
    Dense(Array2<f64>),
    /// Offsets as `coefficients[g, ..] · regressors[c, ..]`, the linear predictor of the upstream
    /// regression. Evaluated on demand, so no genes × cells matrix is ever held.
    Factorized {
        /// genes × k
        coefficients: Array2<f64>,
        /// cells × k
        regressors: Array2<f64>,
    },
}

impl OffsetSource {
    #[inline]
    pub fn value(&self, gene: usize, cell: usize) -> f64 {
        match self {
            OffsetSource::Dense(m) => m[[gene, cell]],
            OffsetSource::Factorized {
                coefficients,
                regressors,
            } => coefficients.row(gene).dot(&regressors.row(cell)),
        }
    }

    fn shape(&self) -> (usize, usize) {
        match self {
            OffsetSource::Dense(m) => m.dim(),
            OffsetSource::Factorized {
                coefficients,
                regressors,
            } => (coefficients.nrows(), regressors.nrows()),
        }
    }
}

/// The fixed part of every per-gene model: dispersion and offsets.
#[derive(Debug, Clone)]
pub struct ModelParams {
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
    dispersions: Array1<f64>,
    offsets: OffsetSource,
}

impl ModelParams {
    pub fn new(
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
        dispersions: Array1<f64>,
        offsets: OffsetSource,
    ) -> Result<Self> {
        ensure_unique("gene", &gene_ids)?;
        ensure_unique("cell", &cell_ids)?;

        if dispersions.len() != gene_ids.len() {
            return Err(CompareError::mismatch(format!(
                "{} dispersions for {} genes",
                dispersions.len(),
                gene_ids.len()
            )));
        }
        if offsets.shape() != (gene_ids.len(), cell_ids.len()) {
            return Err(CompareError::mismatch(format!(
                "offsets cover {:?} (genes, cells) but model parameters name {} genes and {} cells",
                offsets.shape(),
                gene_ids.len(),
                cell_ids.len()
            )));
        }
        if let OffsetSource::Factorized {
            coefficients,
            regressors,
        } = &offsets
        {
            if coefficients.ncols() != regressors.ncols() {
                return Err(CompareError::mismatch(format!(
                    "offset factorization has {} coefficient columns but {} regressor columns",
                    coefficients.ncols(),
                    regressors.ncols()
                )));
            }
        }

        for (g, &theta) in dispersions.iter().enumerate() {
            if !theta.is_finite() || theta <= 0.0 {
                return Err(CompareError::InvalidModelParams {
                    reason: format!("dispersion of gene '{}' is {}", gene_ids[g], theta),
                });
            }
        }

        let finite = match &offsets {
            OffsetSource::Dense(m) => m.iter().all(|v| v.is_finite()),
            OffsetSource::Factorized {
                coefficients,
                regressors,
            } => coefficients.iter().chain(regressors.iter()).all(|v| v.is_finite()),
        };
        if !finite {
            return Err(CompareError::InvalidModelParams {
                reason: "offsets contain non-finite values".to_string(),
            });
        }

        Ok(ModelParams {
            gene_ids,
            cell_ids,
            dispersions,
            offsets,
        })
    }

    /// Build from expected counts (genes × cells) instead of log offsets.
    pub fn from_expected_counts(
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
        dispersions: Array1<f64>,
        mut expected: Array2<f64>,
    ) -> Result<Self> {
        if let Some(bad) = expected.iter().find(|&&v| !(v > 0.0) || !v.is_finite()) {
            return Err(CompareError::InvalidModelParams {
                reason: format!("expected counts must be positive and finite, found {}", bad),
            });
        }
        // the log offsets reuse the caller's buffer
        expected.mapv_inplace(f64::ln);
        Self::new(gene_ids, cell_ids, dispersions, OffsetSource::Dense(expected))
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn dispersions(&self) -> &Array1<f64> {
        &self.dispersions
    }

    pub fn offsets(&self) -> &OffsetSource {
        &self.offsets
    }
}

/// A compared cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedCell {
    pub matrix_col: usize,
    pub model_col: usize,
    /// `true` for group 2 (indicator x = 1)
    pub in_group2: bool,
}

/// A tested gene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedGene {
    pub matrix_row: usize,
    pub model_row: usize,
    pub theta: f64,
}

/// Counts and offsets of one gene over the compared cells.
#[derive(Debug, Clone)]
pub struct GeneData {
    pub counts: Vec<f64>,
    pub offsets: Vec<f64>,
}

/// Read-only view of the inputs restricted to the compared cells and tested genes.
#[derive(Debug)]
pub struct AlignedInput<'a, T> {
    counts: &'a CountMatrix<T>,
    params: &'a ModelParams,
    cells: Vec<SelectedCell>,
    indicator: Vec<bool>,
    column_position: Vec<Option<usize>>,
    genes: Vec<AlignedGene>,
    n_filtered: usize,
}

impl<'a, T> AlignedInput<'a, T>
where
    T: FloatOpsTS,
{
    pub fn cells(&self) -> &[SelectedCell] {
        &self.cells
    }

    pub fn genes(&self) -> &[AlignedGene] {
        &self.genes
    }

    /// Group indicator per compared cell (`true` = group 2)
    pub fn indicator(&self) -> &[bool] {
        &self.indicator
    }

    pub fn gene_id(&self, gene: &AlignedGene) -> &'a str {
        let counts: &'a CountMatrix<T> = self.counts;
        &counts.gene_ids[gene.matrix_row]
    }

    pub fn group_sizes(&self) -> (usize, usize) {
        let n2 = self.indicator.iter().filter(|&&x| x).count();
        (self.indicator.len() - n2, n2)
    }

    /// Genes removed by the detection filter
    pub fn n_filtered(&self) -> usize {
        self.n_filtered
    }

    /// Dense counts and offsets of `gene` over the compared cells.
    pub fn gene_data(&self, gene: &AlignedGene) -> GeneData {
        let mut counts = vec![0.0; self.cells.len()];
        let lane = self.counts.counts.row(gene.matrix_row);
        for (&col, value) in lane.col_indices().iter().zip(lane.values()) {
            if let Some(pos) = self.column_position[col] {
                counts[pos] = ToPrimitive::to_f64(value).unwrap_or(0.0);
            }
        }

        let offsets = self
            .cells
            .iter()
            .map(|cell| self.params.offsets.value(gene.model_row, cell.model_col))
            .collect();

        GeneData { counts, offsets }
    }

    fn detected_cells(&self, matrix_row: usize) -> usize {
        let lane = self.counts.counts.row(matrix_row);
        lane.col_indices()
            .iter()
            .zip(lane.values())
            .filter(|(col, value)| {
                self.column_position[**col].is_some() && ToPrimitive::to_f64(*value).unwrap_or(0.0) > 0.0
            })
            .count()
    }
}

/// Check the inputs against each other and resolve the two groups.
///
/// Fails with [`CompareError::InputMismatch`] when gene or cell sets of counts and model
/// parameters differ, when a matrix cell has no label, or when a requested group matches no
/// cells. Genes detected in fewer than `config.min_cells` compared cells are dropped.
pub fn align_inputs<'a, T>(
    counts: &'a CountMatrix<T>,
    params: &'a ModelParams,
    labeling: &CellLabeling,
    group1: &GroupSpec,
    group2: &GroupSpec,
    config: &CompareConfig,
) -> Result<AlignedInput<'a, T>>
where
    T: FloatOpsTS,
{
    config.validate()?;

    let gene_rows = match_identifiers("gene", counts.gene_ids(), params.gene_ids())?;
    let cell_cols = match_identifiers("cell", counts.cell_ids(), params.cell_ids())?;

    let mut cell_labels = Vec::with_capacity(counts.n_cells());
    for cell in counts.cell_ids() {
        match labeling.label(cell) {
            Some(label) => cell_labels.push(label),
            None => {
                return Err(CompareError::mismatch(format!(
                    "cell '{}' has no label",
                    cell
                )));
            }
        }
    }

    let membership = groups::resolve_groups(&cell_labels, group1, group2)?;
    let mut members1 = Vec::new();
    let mut members2 = Vec::new();
    for (col, m) in membership.iter().enumerate() {
        match m {
            Some(false) => members1.push(col),
            Some(true) => members2.push(col),
            None => {}
        }
    }

    if let Some(max_cells) = config.max_cells_per_group {
        let mut rng = StdRng::seed_from_u64(config.seed);
        members1 = groups::subsample_members(members1, max_cells, &mut rng);
        members2 = groups::subsample_members(members2, max_cells, &mut rng);
        debug!(
            "subsampled groups to {} and {} cells (seed {})",
            members1.len(),
            members2.len(),
            config.seed
        );
    }

    let mut selected: Vec<(usize, bool)> = members1
        .into_iter()
        .map(|c| (c, false))
        .chain(members2.into_iter().map(|c| (c, true)))
        .collect();
    selected.sort_unstable_by_key(|&(c, _)| c);

    let mut column_position = vec![None; counts.n_cells()];
    let mut cells = Vec::with_capacity(selected.len());
    let mut indicator = Vec::with_capacity(selected.len());
    for (pos, &(col, in_group2)) in selected.iter().enumerate() {
        column_position[col] = Some(pos);
        cells.push(SelectedCell {
            matrix_col: col,
            model_col: cell_cols[col],
            in_group2,
        });
        indicator.push(in_group2);
    }

    let candidate_rows: Vec<usize> = match &config.genes {
        Some(requested) => {
            let index: HashMap<&str, usize> = counts
                .gene_ids()
                .iter()
                .enumerate()
                .map(|(i, g)| (g.as_str(), i))
                .collect();
            let mut rows = Vec::with_capacity(requested.len());
            let mut seen = HashSet::new();
            for gene in requested {
                let row = *index.get(gene.as_str()).ok_or_else(|| {
                    CompareError::mismatch(format!("requested gene '{}' is not in the count matrix", gene))
                })?;
                if seen.insert(row) {
                    rows.push(row);
                }
            }
            rows
        }
        None => (0..counts.n_genes()).collect(),
    };

    let mut aligned = AlignedInput {
        counts,
        params,
        cells,
        indicator,
        column_position,
        genes: Vec::with_capacity(candidate_rows.len()),
        n_filtered: 0,
    };

    let mut genes = Vec::with_capacity(candidate_rows.len());
    for row in candidate_rows {
        if aligned.detected_cells(row) < config.min_cells {
            aligned.n_filtered += 1;
            continue;
        }
        let model_row = gene_rows[row];
        genes.push(AlignedGene {
            matrix_row: row,
            model_row,
            theta: params.dispersions[model_row],
        });
    }
    aligned.genes = genes;

    let (n1, n2) = aligned.group_sizes();
    info!(
        "comparing {} ({} cells) vs {} ({} cells) over {} genes, {} below detection filter",
        group1,
        n1,
        group2,
        n2,
        aligned.genes.len(),
        aligned.n_filtered
    );

    Ok(aligned)
}

fn ensure_unique(kind: &str, ids: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.as_str()) {
            return Err(CompareError::mismatch(format!(
                "duplicate {} identifier '{}'",
                kind, id
            )));
        }
    }
    Ok(())
}

/// Position in `model` of every identifier of `matrix`; both have to name the same set.
fn match_identifiers(kind: &str, matrix: &[String], model: &[String]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = model
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut positions = Vec::with_capacity(matrix.len());
    let mut missing = Vec::new();
    for id in matrix {
        match index.get(id.as_str()) {
            Some(&i) => positions.push(i),
            None => missing.push(id.as_str()),
        }
    }

    if !missing.is_empty() || matrix.len() != model.len() {
        let extra = model.len() + missing.len() - matrix.len();
        return Err(CompareError::mismatch(format!(
            "{} sets differ: {} in the count matrix only (e.g. {:?}), {} in the model parameters only",
            kind,
            missing.len(),
            missing.iter().take(3).collect::<Vec<_>>(),
            extra
        )));
    }

    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn small_counts() -> CountMatrix<f64> {
        // 3 genes x 4 cells, gene2 is all zero
        let coo = CooMatrix::try_from_triplets(
            3,
            4,
            vec![0, 0, 1, 1, 1],
            vec![0, 3, 0, 1, 2],
            vec![2.0, 5.0, 1.0, 1.0, 4.0],
        )
        .unwrap();
        CountMatrix::new(CsrMatrix::from(&coo), ids("g", 3), ids("c", 4)).unwrap()
    }

    fn small_params(genes: Vec<String>, cells: Vec<String>) -> ModelParams {
        let (ng, nc) = (genes.len(), cells.len());
        ModelParams::new(
            genes,
            cells,
            Array1::from_elem(ng, 5.0),
            OffsetSource::Dense(Array2::zeros((ng, nc))),
        )
        .unwrap()
    }

    fn labeling() -> CellLabeling {
        CellLabeling::from_aligned(&ids("c", 4), &["a", "a", "b", "b"]).unwrap()
    }

    #[test]
    fn test_fractional_counts_rejected() {
        let coo = CooMatrix::try_from_triplets(1, 2, vec![0], vec![1], vec![1.5]).unwrap();
        let res = CountMatrix::new(CsrMatrix::from(&coo), ids("g", 1), ids("c", 2));
        assert!(matches!(res, Err(CompareError::InvalidCounts { .. })));
    }

    #[test]
    fn test_nonpositive_dispersion_rejected() {
        let res = ModelParams::new(
            ids("g", 2),
            ids("c", 2),
            array![1.0, 0.0],
            OffsetSource::Dense(Array2::zeros((2, 2))),
        );
        assert!(matches!(res, Err(CompareError::InvalidModelParams { .. })));
    }

    #[test]
    fn test_alignment_tolerates_reordered_identifiers() {
        let counts = small_counts();
        let mut genes = ids("g", 3);
        genes.reverse();
        let mut cells = ids("c", 4);
        cells.rotate_left(1);
        let params = small_params(genes, cells);

        let aligned = align_inputs(
            &counts,
            &params,
            &labeling(),
            &GroupSpec::label("a"),
            &GroupSpec::label("b"),
            &CompareConfig::default(),
        )
        .unwrap();

        assert_eq!(aligned.genes().len(), 2);
        assert_eq!(aligned.n_filtered(), 1);
        assert_eq!(aligned.genes()[0].model_row, 2);
        assert_eq!(aligned.cells()[0].model_col, 3);
        assert_eq!(aligned.indicator(), &[false, false, true, true]);

        let data = aligned.gene_data(&aligned.genes()[0]);
        assert_eq!(data.counts, vec![2.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_gene_set_mismatch() {
        let counts = small_counts();
        let params = small_params(vec!["g0".into(), "g1".into(), "other".into()], ids("c", 4));
        let res = align_inputs(
            &counts,
            &params,
            &labeling(),
            &GroupSpec::label("a"),
            &GroupSpec::label("b"),
            &CompareConfig::default(),
        );
        assert!(matches!(res, Err(CompareError::InputMismatch { .. })));
    }

    #[test]
    fn test_unlabeled_cell_is_mismatch() {
        let counts = small_counts();
        let params = small_params(ids("g", 3), ids("c", 4));
        let labels = CellLabeling::from_pairs([("c0", "a"), ("c1", "a"), ("c2", "b")]);
        let res = align_inputs(
            &counts,
            &params,
            &labels,
            &GroupSpec::label("a"),
            &GroupSpec::label("b"),
            &CompareConfig::default(),
        );
        assert!(matches!(res, Err(CompareError::InputMismatch { .. })));
    }

    #[test]
    fn test_factorized_offsets_match_dense() {
        let coefficients = array![[1.0, 0.5], [0.0, 2.0]];
        let regressors = array![[1.0, 0.0], [1.0, 1.0], [1.0, -1.0]];
        let dense = coefficients.dot(&regressors.t());
        let factorized = OffsetSource::Factorized {
            coefficients,
            regressors,
        };
        for g in 0..2 {
            for c in 0..3 {
                assert_eq!(factorized.value(g, c), dense[[g, c]]);
            }
        }
    }

    #[test]
    fn test_expected_counts_become_log_offsets_in_place() {
        let expected = array![[1.0, std::f64::consts::E], [2.0, 0.5]];
        let buffer = expected.as_ptr();
        let params = ModelParams::from_expected_counts(
            ids("g", 2),
            ids("c", 2),
            array![1.0, 1.0],
            expected,
        )
        .unwrap();

        match params.offsets() {
            OffsetSource::Dense(m) => assert_eq!(m.as_ptr(), buffer),
            OffsetSource::Factorized { .. } => panic!("expected dense offsets"),
        }
        assert_eq!(params.offsets().value(0, 0), 0.0);
        assert!((params.offsets().value(0, 1) - 1.0).abs() < 1e-12);
        assert!((params.offsets().value(1, 1) - 0.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_requested_gene_must_exist() {
        let counts = small_counts();
        let params = small_params(ids("g", 3), ids("c", 4));
        let res = align_inputs(
            &counts,
            &params,
            &labeling(),
            &GroupSpec::label("a"),
            &GroupSpec::label("b"),
            &CompareConfig::default().with_genes(["g0", "nope"]),
        );
        assert!(matches!(res, Err(CompareError::InputMismatch { .. })));
    }
}
