use crate::error::{CompareError, Result};
use crate::testing::correction::CorrectionMethod;
use crate::testing::inference::glm::GlmFitParams;

/// Genes per parallel work unit unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Options for a two-group comparison.
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// Minimum number of compared cells with a non-zero count for a gene to be tested
    pub min_cells: usize,
    /// Subsample each group down to this many cells
    pub max_cells_per_group: Option<usize>,
    /// Seed for subsampling
    pub seed: u64,
    /// Restrict testing to these genes
    pub genes: Option<Vec<String>>,
    /// Genes per parallel work unit
    pub chunk_size: usize,
    /// Run on a dedicated pool with this many threads instead of the global rayon pool
    pub n_threads: Option<usize>,
    pub glm: GlmFitParams,
    pub correction: CorrectionMethod,
}

impl Default for CompareConfig {
    fn default() -> Self {
        CompareConfig {
            min_cells: 1,
            max_cells_per_group: None,
            seed: 42,
            genes: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            n_threads: None,
            glm: GlmFitParams::default(),
            correction: CorrectionMethod::BenjaminiHochberg,
        }
    }
}

impl CompareConfig {
    pub fn with_min_cells(mut self, min_cells: usize) -> Self {
        self.min_cells = min_cells;
        self
    }

    pub fn with_subsampling(mut self, max_cells_per_group: usize, seed: u64) -> Self {
        self.max_cells_per_group = Some(max_cells_per_group);
        self.seed = seed;
        self
    }

    pub fn with_genes<I, S>(mut self, genes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.genes = Some(genes.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    pub fn with_glm_params(mut self, glm: GlmFitParams) -> Self {
        self.glm = glm;
        self
    }

    pub fn with_correction(mut self, correction: CorrectionMethod) -> Self {
        self.correction = correction;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(CompareError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.chunk_size == 0 {
            return invalid("chunk_size must be at least 1");
        }
        if self.max_cells_per_group == Some(0) {
            return invalid("max_cells_per_group must be at least 1");
        }
        if self.n_threads == Some(0) {
            return invalid("n_threads must be at least 1");
        }
        if self.glm.max_iter == 0 {
            return invalid("max_iter must be at least 1");
        }
        if !(self.glm.tolerance > 0.0) {
            return invalid("tolerance must be positive");
        }
        if !(self.glm.damping > 0.0 && self.glm.damping < 1.0) {
            return invalid("damping must lie in (0, 1)");
        }
        Ok(())
    }
}
