use rand::prelude::*;
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson};
use rayon::prelude::*;

use crate::core::data::structures::{ExpressionMatrix, GeneSet, Layout};
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Parameters of the synthetic expression data
///
/// ### Fields
///
/// * `n_genes` - Number of genes.
/// * `n_samples` - Number of samples (or cells).
/// * `layout` - `GeneMajor` for bulk-like data, `SampleMajor` for single
///   cell-like data.
/// * `dropout` - Probability to zero out a count. Only sensible for single
///   cell data.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct SyntheticExpressionParams {
    pub n_genes: usize,
    pub n_samples: usize,
    pub layout: Layout,
    pub dropout: Option<f64>,
    pub seed: u64,
}

/// Parameters of the synthetic gene sets
///
/// ### Fields
///
/// * `n_gene_sets` - Number of gene sets.
/// * `min_size` - Minimum number of members.
/// * `max_size` - Maximum number of members; capped at `n_genes - 1`.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug)]
pub struct SyntheticGeneSetParams {
    pub n_gene_sets: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub seed: u64,
}

fn dist_err<E: std::fmt::Display>(err: E) -> GseaError {
    GseaError::Distribution(err.to_string())
}

/////////////////////
// Expression data //
/////////////////////

/// Generate synthetic counts from a gamma-poisson model
///
/// Every gene draws a mean expression from a gamma distribution; every
/// sample then draws its count from a gamma-poisson mixture with gene
/// specific dispersion. Genes are processed in parallel with a per gene
/// seed, so the output only depends on the seed.
///
/// ### Params
///
/// * `params` - The `SyntheticExpressionParams`.
///
/// ### Returns
///
/// The `ExpressionMatrix` with genes `gene_<i>` and samples `sample_<j>`.
pub fn generate_expression(params: &SyntheticExpressionParams) -> Result<ExpressionMatrix> {
    let n_genes = params.n_genes;
    let n_samples = params.n_samples;
    let seed = params.seed;

    let mut rng = StdRng::seed_from_u64(seed);
    let gamma = Gamma::new(2.0, 25.0).map_err(dist_err)?;
    let mean_exp: Vec<f64> = (0..n_genes).map(|_| gamma.sample(&mut rng)).collect();

    let dropout = params
        .dropout
        .map(|p| Bernoulli::new(p).map_err(dist_err))
        .transpose()?;

    let gene_data: Vec<Vec<f64>> = mean_exp
        .par_iter()
        .enumerate()
        .map(|(i, &mean)| -> Result<Vec<f64>> {
            let mut local_rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64 + 1));
            let dispersion = 1.0 / (0.2 + mean * 0.3);
            let r = 1.0 / dispersion;
            let base = Gamma::new(r, mean / r).map_err(dist_err)?;

            let mut counts = Vec::with_capacity(n_samples);
            for _ in 0..n_samples {
                let lambda = base.sample(&mut local_rng);
                let mut count = if lambda > 0.0 {
                    Poisson::new(lambda)
                        .map_err(dist_err)?
                        .sample(&mut local_rng)
                } else {
                    0.0
                };
                if let Some(dropout) = &dropout {
                    if dropout.sample(&mut local_rng) {
                        count = 0.0;
                    }
                }
                counts.push(count);
            }
            Ok(counts)
        })
        .collect::<Result<Vec<_>>>()?;

    let gene_ids: Vec<String> = (0..n_genes).map(|i| format!("gene_{}", i)).collect();
    let sample_ids: Vec<String> = (0..n_samples).map(|j| format!("sample_{}", j)).collect();

    let values = match params.layout {
        Layout::GeneMajor => gene_data.into_iter().flatten().collect(),
        Layout::SampleMajor => {
            let mut values = Vec::with_capacity(n_genes * n_samples);
            for j in 0..n_samples {
                values.extend(gene_data.iter().map(|counts| counts[j]));
            }
            values
        }
    };

    ExpressionMatrix::new(params.layout, gene_ids, sample_ids, values)
}

///////////////
// Gene sets //
///////////////

/// Draw random gene sets over a gene universe
///
/// Sizes are drawn uniformly from `min_size..=max_size`, clamped to
/// `1..=n_genes - 1`, so no gene set is degenerate.
///
/// ### Params
///
/// * `gene_ids` - The gene universe.
/// * `params` - The `SyntheticGeneSetParams`.
///
/// ### Returns
///
/// Vector of gene sets named `gene_set_<k>`.
pub fn generate_gene_sets(
    gene_ids: &[String],
    params: &SyntheticGeneSetParams,
) -> Result<Vec<GeneSet>> {
    let n_genes = gene_ids.len();
    if n_genes < 2 {
        return Err(GseaError::PreconditionViolation(format!(
            "need at least 2 genes to draw gene sets, got {}",
            n_genes
        )));
    }
    let max_size = params.max_size.clamp(1, n_genes - 1);
    let min_size = params.min_size.clamp(1, max_size);

    let mut rng = StdRng::seed_from_u64(params.seed);
    let gene_sets = (0..params.n_gene_sets)
        .map(|k| {
            let size = rng.random_range(min_size..=max_size);
            let members = rand::seq::index::sample(&mut rng, n_genes, size)
                .into_iter()
                .map(|i| gene_ids[i].as_str());
            GeneSet::new(format!("gene_set_{}", k), members)
        })
        .collect();

    Ok(gene_sets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(layout: Layout, dropout: Option<f64>) -> SyntheticExpressionParams {
        SyntheticExpressionParams {
            n_genes: 20,
            n_samples: 6,
            layout,
            dropout,
            seed: 42,
        }
    }

    #[test]
    fn test_expression_is_reproducible() {
        let a = generate_expression(&params(Layout::GeneMajor, None)).unwrap();
        let b = generate_expression(&params(Layout::GeneMajor, None)).unwrap();
        assert_eq!(a.n_genes(), 20);
        assert_eq!(a.n_samples(), 6);
        for g in 0..20 {
            for s in 0..6 {
                assert_eq!(a.get(g, s), b.get(g, s));
                assert!(a.get(g, s) >= 0.0);
            }
        }
    }

    #[test]
    fn test_layouts_hold_same_counts() {
        let bulk = generate_expression(&params(Layout::GeneMajor, None)).unwrap();
        let sc = generate_expression(&params(Layout::SampleMajor, None)).unwrap();
        for g in 0..20 {
            for s in 0..6 {
                assert_eq!(bulk.get(g, s), sc.get(g, s));
            }
        }
    }

    #[test]
    fn test_full_dropout() {
        let sc = generate_expression(&params(Layout::SampleMajor, Some(1.0))).unwrap();
        for g in 0..20 {
            for s in 0..6 {
                assert_eq!(sc.get(g, s), 0.0);
            }
        }
        assert!(generate_expression(&params(Layout::SampleMajor, Some(1.5))).is_err());
    }

    #[test]
    fn test_gene_sets_are_never_degenerate() {
        let genes: Vec<String> = (0..5).map(|i| format!("g{}", i)).collect();
        let gene_sets = generate_gene_sets(
            &genes,
            &SyntheticGeneSetParams {
                n_gene_sets: 50,
                min_size: 0,
                max_size: 100,
                seed: 7,
            },
        )
        .unwrap();
        assert_eq!(gene_sets.len(), 50);
        for gs in &gene_sets {
            assert!(!gs.is_empty());
            assert!(gs.len() < genes.len());
        }
    }
}
