//! Fan-out of the per-gene tests over a rayon pool.
//!
//! Genes are handed out in chunks; each task reads the shared aligned input and produces its own
//! rows. Rows come back in no particular order, ranking sorts them afterwards.

use log::{debug, warn};
use rayon::prelude::*;
use single_utilities::traits::FloatOpsTS;

use crate::config::CompareConfig;
use crate::error::Result;
use crate::input::{AlignedGene, AlignedInput};
use crate::testing::effect::summarize_groups;
use crate::testing::inference::{glm, lrt};
use crate::testing::{GeneStatus, GeneTest};

/// Fit and test one gene
pub fn test_gene<T>(aligned: &AlignedInput<'_, T>, gene: &AlignedGene, config: &CompareConfig) -> GeneTest
where
    T: FloatOpsTS,
{
    let data = aligned.gene_data(gene);
    let pair = glm::fit_gene(&data, aligned.indicator(), gene.theta, &config.glm);
    let summary = summarize_groups(&data, aligned.indicator());
    lrt::assemble(aligned.gene_id(gene), &pair, summary)
}

/// Test every aligned gene, on a dedicated pool when `config.n_threads` is set.
pub fn test_all_genes<T>(aligned: &AlignedInput<'_, T>, config: &CompareConfig) -> Result<Vec<GeneTest>>
where
    T: FloatOpsTS,
{
    let tests = match config.n_threads {
        Some(n_threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .build()?;
            pool.install(|| run_chunks(aligned, config))
        }
        None => run_chunks(aligned, config),
    };

    let not_converged = tests
        .iter()
        .filter(|t| t.status == GeneStatus::NotConverged)
        .count();
    if not_converged > 0 {
        warn!(
            "{} of {} genes did not converge; their rows are flagged",
            not_converged,
            tests.len()
        );
    }

    Ok(tests)
}

fn run_chunks<T>(aligned: &AlignedInput<'_, T>, config: &CompareConfig) -> Vec<GeneTest>
where
    T: FloatOpsTS,
{
    debug!(
        "testing {} genes in chunks of {} on {} threads",
        aligned.genes().len(),
        config.chunk_size,
        rayon::current_num_threads()
    );

    aligned
        .genes()
        .par_chunks(config.chunk_size)
        .flat_map_iter(|chunk| chunk.iter().map(move |gene| test_gene(aligned, gene, config)))
        .collect()
}
