use log::warn;
use std::ops::Range;

use crate::core::data::structures::{ExpressionMatrix, GeneSample, GeneSet, ScoreMatrix};
use crate::core::enrichment::scheduler::{dispatch, ProgressLog};
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Increments of the running sum for one gene set
///
/// ### Fields
///
/// * `pos` - Added when the ranked gene is a member: `sqrt((G - s) / s)`.
/// * `neg` - Added otherwise: `-sqrt(s / (G - s))`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunningSumSteps {
    pub pos: f64,
    pub neg: f64,
}

/// Options for the walk along a ranked sample profile
///
/// ### Fields
///
/// * `stop_at_zero` - Stop the walk at the first zero count. Sparse single
///   cell profiles use the first zero as the end of the expressed genes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalkOptions {
    pub stop_at_zero: bool,
}

/// A gene set resolved against the gene universe
///
/// ### Fields
///
/// * `id` - Identifier of the gene set.
/// * `members` - Membership mask over the gene indices of the universe.
/// * `size` - Number of members present in the universe.
/// * `steps` - The running sum increments for this set.
#[derive(Clone, Debug)]
pub struct ResolvedGeneSet {
    pub id: String,
    pub members: Vec<bool>,
    pub size: usize,
    pub steps: RunningSumSteps,
}

/// Gene sets ready for scoring against a fixed gene universe
///
/// ### Fields
///
/// * `sets` - The scorable gene sets, in input order.
/// * `n_genes` - Size of the gene universe.
#[derive(Clone, Debug)]
pub struct GeneSetCatalog {
    sets: Vec<ResolvedGeneSet>,
    n_genes: usize,
}

impl GeneSetCatalog {
    /// Resolve gene sets against the gene universe
    ///
    /// Members that are not part of the universe are ignored. Sets that end
    /// up with no member or with every gene of the universe have undefined
    /// steps; they are dropped with a warning.
    ///
    /// ### Params
    ///
    /// * `gene_ids` - The gene universe.
    /// * `gene_sets` - The gene sets to resolve.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(gene_ids: &[String], gene_sets: &[GeneSet]) -> Self {
        let n_genes = gene_ids.len();
        let mut sets = Vec::with_capacity(gene_sets.len());

        for gene_set in gene_sets {
            let members: Vec<bool> = gene_ids.iter().map(|g| gene_set.contains(g)).collect();
            let size = members.iter().filter(|&&m| m).count();

            match running_sum_steps(size, n_genes) {
                Some(steps) => sets.push(ResolvedGeneSet {
                    id: gene_set.id.clone(),
                    members,
                    size,
                    steps,
                }),
                None => warn!(
                    "Skipping gene set {}: {} of {} genes present in the universe",
                    gene_set.id, size, n_genes
                ),
            }
        }

        Self { sets, n_genes }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn get(&self, idx: usize) -> &ResolvedGeneSet {
        &self.sets[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedGeneSet> {
        self.sets.iter()
    }

    /// Identifiers of the gene sets in scoring order
    pub fn ids(&self) -> Vec<String> {
        self.sets.iter().map(|s| s.id.clone()).collect()
    }
}

//////////////////////
// Helper functions //
//////////////////////

/// Calculate the running sum increments
///
/// ### Params
///
/// * `set_size` - Number of gene set members in the universe (`s`).
/// * `n_genes` - Size of the universe (`G`).
///
/// ### Returns
///
/// `None` for `s == 0` or `s >= G` where the increments are undefined.
pub fn running_sum_steps(set_size: usize, n_genes: usize) -> Option<RunningSumSteps> {
    if set_size == 0 || set_size >= n_genes {
        return None;
    }
    let s = set_size as f64;
    let g = n_genes as f64;

    Some(RunningSumSteps {
        pos: ((g - s) / s).sqrt(),
        neg: -(s / (g - s)).sqrt(),
    })
}

/// Rank a sample profile by descending expression
///
/// The sort is stable, tied genes keep their input order. Uses the IEEE
/// total order, so NaN counts rank first instead of breaking the sort.
pub fn rank_profile(profile: &mut [GeneSample]) {
    profile.sort_by(|a, b| b.count.total_cmp(&a.count));
}

/// Calculate the maximum running sum of a gene set over a ranked profile
///
/// Only the maximum of the running sum is tracked (not the maximum absolute
/// deviation). The maximum starts at the first step, so a walk that never
/// becomes positive yields a negative score. A walk without any step (the
/// first gene is a zero under `stop_at_zero`) scores `0.0`.
///
/// ### Params
///
/// * `ranked` - Profile sorted with `rank_profile()`.
/// * `gene_set` - The resolved gene set.
/// * `options` - Walk options.
///
/// ### Returns
///
/// The enrichment score
pub fn running_sum_max(
    ranked: &[GeneSample],
    gene_set: &ResolvedGeneSet,
    options: WalkOptions,
) -> f64 {
    let RunningSumSteps { pos, neg } = gene_set.steps;
    let mut current = 0.0;
    let mut max_value = 0.0;

    for (i, gene) in ranked.iter().enumerate() {
        if options.stop_at_zero && gene.count == 0.0 {
            break;
        }
        current += if gene_set.members[gene.gene_idx] {
            pos
        } else {
            neg
        };
        if i == 0 || current > max_value {
            max_value = current;
        }
    }

    max_value
}

/// Score every gene set for one sample
///
/// ### Params
///
/// * `profile` - The unranked sample profile, ranked in place.
/// * `catalog` - The gene sets.
/// * `options` - Walk options.
/// * `out` - Slot of length `catalog.len()` that receives the scores.
pub fn score_profile(
    profile: &mut [GeneSample],
    catalog: &GeneSetCatalog,
    options: WalkOptions,
    out: &mut [f64],
) {
    rank_profile(profile);
    for (slot, gene_set) in out.iter_mut().zip(catalog.iter()) {
        *slot = running_sum_max(profile, gene_set, options);
    }
}

/// Score a contiguous range of samples
///
/// This is the job executed by a single worker. It writes only into `out`,
/// which holds the sample-major slots of exactly the samples in `samples`.
///
/// ### Params
///
/// * `matrix` - The expression matrix.
/// * `catalog` - The gene sets.
/// * `options` - Walk options.
/// * `samples` - Range of sample indices to score.
/// * `out` - The worker's slice of the result matrix.
/// * `progress` - Set for the designated reporter only.
///
/// ### Returns
///
/// `PreconditionViolation` if the range or slice do not match the matrix.
pub fn score_sample_range(
    matrix: &ExpressionMatrix,
    catalog: &GeneSetCatalog,
    options: WalkOptions,
    samples: Range<usize>,
    out: &mut [f64],
    progress: Option<&ProgressLog>,
) -> Result<()> {
    if samples.end > matrix.n_samples() {
        return Err(GseaError::PreconditionViolation(format!(
            "sample range {:?} exceeds the {} samples of the matrix",
            samples,
            matrix.n_samples()
        )));
    }
    if matrix.n_genes() != catalog.n_genes() {
        return Err(GseaError::PreconditionViolation(format!(
            "matrix has {} genes, gene sets were resolved against {}",
            matrix.n_genes(),
            catalog.n_genes()
        )));
    }
    let n_sets = catalog.len();
    if out.len() != samples.len() * n_sets {
        return Err(GseaError::PreconditionViolation(format!(
            "result slice of length {} does not fit {} samples x {} gene sets",
            out.len(),
            samples.len(),
            n_sets
        )));
    }
    if n_sets == 0 {
        return Ok(());
    }

    for (done, (sample_idx, slot)) in samples.zip(out.chunks_mut(n_sets)).enumerate() {
        let mut profile = matrix.sample_profile(sample_idx);
        score_profile(&mut profile, catalog, options, slot);
        if let Some(progress) = progress {
            progress.tick(done + 1);
        }
    }

    Ok(())
}

///////////////////
// Main function //
///////////////////

/// Score every sample of a matrix against every gene set in parallel
///
/// The samples are split over `n_threads` workers (see
/// `scheduler::dispatch()`); each worker ranks its samples and walks all gene
/// sets. The call returns once all workers are done.
///
/// ### Params
///
/// * `matrix` - The expression matrix.
/// * `catalog` - The gene sets resolved against the matrix' genes.
/// * `options` - Walk options.
/// * `n_threads` - Number of workers, `0` for all hardware threads.
/// * `progress_interval` - Samples between progress lines of the reporter.
///
/// ### Returns
///
/// The `ScoreMatrix` with one score per sample and gene set.
pub fn score_matrix(
    matrix: &ExpressionMatrix,
    catalog: &GeneSetCatalog,
    options: WalkOptions,
    n_threads: usize,
    progress_interval: usize,
) -> Result<ScoreMatrix> {
    let mut scores = ScoreMatrix::new(catalog.ids(), matrix.sample_ids().to_vec());
    if catalog.is_empty() || matrix.n_samples() == 0 {
        return Ok(scores);
    }

    dispatch(n_threads, catalog.len(), scores.data_mut(), |task| {
        let progress = task
            .reporter
            .then(|| ProgressLog::new("Sample", task.samples.len(), progress_interval));
        score_sample_range(
            matrix,
            catalog,
            options,
            task.samples,
            task.out,
            progress.as_ref(),
        )
    })?;

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::structures::Layout;
    use approx::assert_relative_eq;

    fn universe(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn profile(counts: &[f64]) -> Vec<GeneSample> {
        counts
            .iter()
            .enumerate()
            .map(|(gene_idx, &count)| GeneSample { gene_idx, count })
            .collect()
    }

    #[test]
    fn test_four_gene_example() {
        // A=10, B=1, C=8, D=2 -> A, C, D, B
        let genes = universe(&["A", "B", "C", "D"]);
        let catalog = GeneSetCatalog::new(&genes, &[GeneSet::new("AC", ["A", "C"])]);
        let steps = catalog.get(0).steps;
        assert_relative_eq!(steps.pos, 1.0);
        assert_relative_eq!(steps.neg, -1.0);

        let mut p = profile(&[10.0, 1.0, 8.0, 2.0]);
        rank_profile(&mut p);
        let order: Vec<usize> = p.iter().map(|g| g.gene_idx).collect();
        assert_eq!(order, vec![0, 2, 3, 1]);

        let es = running_sum_max(&p, catalog.get(0), WalkOptions::default());
        assert_relative_eq!(es, 2.0);
    }

    #[test]
    fn test_complementary_sets() {
        // G = 5, g = E; singleton steps: +2, -0.5; complement steps: +0.5, -2
        let genes = universe(&["A", "B", "C", "D", "E"]);
        let catalog = GeneSetCatalog::new(
            &genes,
            &[
                GeneSet::new("single", ["E"]),
                GeneSet::new("complement", ["A", "B", "C", "D"]),
            ],
        );
        let single = catalog.get(0);
        let complement = catalog.get(1);
        assert_relative_eq!(single.steps.pos, 2.0);
        assert_relative_eq!(single.steps.neg, -0.5);
        assert_relative_eq!(complement.steps.pos, 0.5);
        assert_relative_eq!(complement.steps.neg, -2.0);

        // E ranked first
        let mut first = profile(&[1.0, 2.0, 3.0, 4.0, 9.0]);
        rank_profile(&mut first);
        let opts = WalkOptions::default();
        assert_relative_eq!(running_sum_max(&first, single, opts), 2.0);
        // -2, -1.5, -1, -0.5, 0
        assert_relative_eq!(running_sum_max(&first, complement, opts), 0.0, epsilon = 1e-12);

        // E ranked last
        let mut last = profile(&[4.0, 3.0, 2.0, 1.0, 0.5]);
        rank_profile(&mut last);
        // -0.5, -1, -1.5, -2, 0
        assert_relative_eq!(running_sum_max(&last, single, opts), 0.0, epsilon = 1e-12);
        assert_relative_eq!(running_sum_max(&last, complement, opts), 2.0);
    }

    #[test]
    fn test_maximum_starts_at_first_step() {
        // member ranked last: every partial sum is negative except the last
        let genes = universe(&["A", "B", "C"]);
        let catalog = GeneSetCatalog::new(&genes, &[GeneSet::new("C", ["C"])]);
        let mut p = profile(&[3.0, 2.0, 1.0]);
        rank_profile(&mut p);
        let es = running_sum_max(&p, catalog.get(0), WalkOptions::default());
        // steps: +sqrt(2), -sqrt(1/2) -> -0.707, -1.414, 0.0
        assert_relative_eq!(es, 0.0, epsilon = 1e-12);

        let catalog = GeneSetCatalog::new(&genes, &[GeneSet::new("B", ["B"])]);
        let mut p = profile(&[3.0, 2.0, 1.0]);
        rank_profile(&mut p);
        let es = running_sum_max(&p, catalog.get(0), WalkOptions::default());
        // -0.707, 0.707, 0.0
        assert_relative_eq!(es, 0.5_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_stop_at_zero_is_opt_in() {
        let genes = universe(&["A", "B", "C", "D"]);
        let catalog = GeneSetCatalog::new(&genes, &[GeneSet::new("CD", ["C", "D"])]);
        // ranked: A(5), B(1), C(0), D(0)
        let mut p = profile(&[5.0, 1.0, 0.0, 0.0]);
        rank_profile(&mut p);

        let full = running_sum_max(&p, catalog.get(0), WalkOptions::default());
        let sparse = running_sum_max(&p, catalog.get(0), WalkOptions { stop_at_zero: true });
        // full walk: -1, -2, -1, 0 -> 0; truncated: -1, -2 -> -1
        assert_relative_eq!(full, 0.0);
        assert_relative_eq!(sparse, -1.0);

        let mut empty = profile(&[0.0, 0.0, 0.0, 0.0]);
        rank_profile(&mut empty);
        let es = running_sum_max(&empty, catalog.get(0), WalkOptions { stop_at_zero: true });
        assert_eq!(es, 0.0);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let mut p = profile(&[1.0, 5.0, 1.0, 5.0, 1.0]);
        rank_profile(&mut p);
        let order: Vec<usize> = p.iter().map(|g| g.gene_idx).collect();
        assert_eq!(order, vec![1, 3, 0, 2, 4]);
    }

    #[test]
    fn test_nan_counts_do_not_break_ranking() {
        let n = 64;
        let genes: Vec<String> = (0..n).map(|i| format!("g{}", i)).collect();
        let catalog = GeneSetCatalog::new(
            &genes,
            &[GeneSet::new("first", ["g0", "g1", "g2"])],
        );
        let counts: Vec<f64> = (0..n)
            .map(|i| if i % 3 == 0 { f64::NAN } else { i as f64 })
            .collect();
        let mut p = profile(&counts);
        rank_profile(&mut p);
        assert!(p[0].count.is_nan());
        assert_eq!(p[p.len() - 1].gene_idx, 1);

        let matrix = ExpressionMatrix::from_rows(
            Layout::SampleMajor,
            genes,
            universe(&["s0", "s1"]),
            vec![counts.clone(), counts],
        )
        .unwrap();
        let scores = score_matrix(&matrix, &catalog, WalkOptions::default(), 2, 0).unwrap();
        assert_eq!(scores.get(0, 0), scores.get(0, 1));
        assert!(scores.get(0, 0).is_finite());
    }

    #[test]
    fn test_degenerate_sets_are_dropped() {
        let genes = universe(&["A", "B", "C"]);
        let catalog = GeneSetCatalog::new(
            &genes,
            &[
                GeneSet::new("none", ["X", "Y"]),
                GeneSet::new("all", ["A", "B", "C", "X"]),
                GeneSet::new("ok", ["A", "X"]),
            ],
        );
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.ids(), vec!["ok".to_string()]);
        // unknown member X does not count towards the size
        assert_eq!(catalog.get(0).size, 1);
        assert!(running_sum_steps(0, 3).is_none());
        assert!(running_sum_steps(3, 3).is_none());
    }

    #[test]
    fn test_size_one_and_universe_minus_one() {
        let genes = universe(&["A", "B", "C", "D"]);
        let catalog = GeneSetCatalog::new(
            &genes,
            &[
                GeneSet::new("one", ["B"]),
                GeneSet::new("three", ["A", "C", "D"]),
            ],
        );
        assert_eq!(catalog.len(), 2);
        let mut p = profile(&[4.0, 3.0, 2.0, 1.0]);
        let mut out = vec![f64::NAN; 2];
        score_profile(&mut p, &catalog, WalkOptions::default(), &mut out);
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_score_sample_range_bounds() {
        let genes = universe(&["A", "B"]);
        let catalog = GeneSetCatalog::new(&genes, &[GeneSet::new("A", ["A"])]);
        let matrix = ExpressionMatrix::from_rows(
            Layout::SampleMajor,
            genes.clone(),
            universe(&["s0"]),
            vec![vec![1.0, 2.0]],
        )
        .unwrap();

        let mut out = vec![0.0; 2];
        let res = score_sample_range(
            &matrix,
            &catalog,
            WalkOptions::default(),
            0..2,
            &mut out,
            None,
        );
        assert!(matches!(res, Err(GseaError::PreconditionViolation(_))));

        let mut out = vec![0.0; 1];
        score_sample_range(
            &matrix,
            &catalog,
            WalkOptions::default(),
            0..1,
            &mut out,
            None,
        )
        .unwrap();
        // B, A -> -1, 0
        assert_relative_eq!(out[0], 0.0);
    }

    #[test]
    fn test_thread_count_does_not_change_scores() {
        let genes: Vec<String> = (0..6).map(|i| format!("g{}", i)).collect();
        let samples: Vec<String> = (0..5).map(|i| format!("s{}", i)).collect();
        let rows: Vec<Vec<f64>> = (0..6)
            .map(|g| (0..5).map(|s| ((g * 7 + s * 3) % 11) as f64).collect())
            .collect();
        let matrix = ExpressionMatrix::from_rows(Layout::GeneMajor, genes.clone(), samples, rows)
            .unwrap();
        let catalog = GeneSetCatalog::new(
            &genes,
            &[
                GeneSet::new("a", ["g0", "g1"]),
                GeneSet::new("b", ["g2", "g4", "g5"]),
                GeneSet::new("c", ["g3"]),
            ],
        );

        let reference = score_matrix(&matrix, &catalog, WalkOptions::default(), 1, 0).unwrap();
        for n_threads in 2..=7 {
            let scores =
                score_matrix(&matrix, &catalog, WalkOptions::default(), n_threads, 0).unwrap();
            for k in 0..catalog.len() {
                for j in 0..matrix.n_samples() {
                    assert_relative_eq!(scores.get(k, j), reference.get(k, j));
                }
            }
        }
    }
}
