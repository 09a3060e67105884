use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::core::base::normalisation::normalise_expression;
use crate::core::data::structures::{ExpressionMatrix, GeneSet, Layout, ScoreMatrix};
use crate::core::data::table_io::write_scores;
use crate::core::enrichment::chunked::{spill_batch, ChunkRunContext};
use crate::core::enrichment::gsea::{score_matrix, GeneSetCatalog, WalkOptions};
use crate::core::enrichment::variance_filter::{
    filter_chunks, filter_score_matrix, FilterSummary,
};
use crate::error::{GseaError, Result};

////////////
// Params //
////////////

/// Immutable parameters of an engine
///
/// ### Fields
///
/// * `n_threads` - Number of workers, `0` for all hardware threads.
/// * `progress_interval` - Samples between progress lines, `0` disables them.
/// * `single_cell_early_exit` - Stop the walk at the first zero count for
///   sample-major (single cell) data.
/// * `batch_size` - Samples per worker and batch in the chunked mode.
/// * `output_sep` - Separator of the result tables.
#[derive(Clone, Debug, PartialEq)]
pub struct GseaParams {
    pub n_threads: usize,
    pub progress_interval: usize,
    pub single_cell_early_exit: bool,
    pub batch_size: usize,
    pub output_sep: u8,
}

impl Default for GseaParams {
    fn default() -> Self {
        Self {
            n_threads: 0,
            progress_interval: 100,
            single_cell_early_exit: true,
            batch_size: 50,
            output_sep: b',',
        }
    }
}

////////////
// Engine //
////////////

/// Scores expression data against a fixed collection of gene sets
///
/// The engine itself never changes after construction; the state of a
/// chunked run lives in a `ChunkRunContext`.
///
/// ### Fields
///
/// * `params` - The `GseaParams`.
/// * `gene_ids` - The gene universe.
/// * `catalog` - The gene sets resolved against the universe.
#[derive(Clone, Debug)]
pub struct GseaEngine {
    params: GseaParams,
    gene_ids: Vec<String>,
    catalog: GeneSetCatalog,
}

impl GseaEngine {
    /// Create a new engine
    ///
    /// ### Params
    ///
    /// * `gene_ids` - The gene universe, in the column (or row) order of the
    ///   matrices that will be scored.
    /// * `gene_sets` - The gene sets.
    /// * `params` - The `GseaParams`.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(gene_ids: Vec<String>, gene_sets: &[GeneSet], params: GseaParams) -> Result<Self> {
        if gene_ids.is_empty() {
            return Err(GseaError::PreconditionViolation(
                "the gene universe is empty".to_string(),
            ));
        }
        let catalog = GeneSetCatalog::new(&gene_ids, gene_sets);
        info!(
            "Scoring {} of {} gene sets over {} genes",
            catalog.len(),
            gene_sets.len(),
            gene_ids.len()
        );

        Ok(Self {
            params,
            gene_ids,
            catalog,
        })
    }

    /// Create a new engine over the genes of a matrix
    pub fn from_matrix(
        matrix: &ExpressionMatrix,
        gene_sets: &[GeneSet],
        params: GseaParams,
    ) -> Result<Self> {
        Self::new(matrix.gene_ids().to_vec(), gene_sets, params)
    }

    pub fn params(&self) -> &GseaParams {
        &self.params
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn catalog(&self) -> &GeneSetCatalog {
        &self.catalog
    }

    /// Identifiers of the scored gene sets, one per row of every result
    pub fn gene_set_ids(&self) -> Vec<String> {
        self.catalog.ids()
    }

    /// Walk options for data of a given layout
    pub fn walk_options(&self, layout: Layout) -> WalkOptions {
        WalkOptions {
            stop_at_zero: self.params.single_cell_early_exit && layout == Layout::SampleMajor,
        }
    }

    fn check_genes(&self, matrix: &ExpressionMatrix) -> Result<()> {
        if matrix.gene_ids() != self.gene_ids.as_slice() {
            return Err(GseaError::PreconditionViolation(format!(
                "matrix genes do not match the {} genes of the engine",
                self.gene_ids.len()
            )));
        }
        Ok(())
    }

    /// Score all samples of a matrix in memory
    ///
    /// ### Params
    ///
    /// * `matrix` - The expression matrix over the engine's genes.
    ///
    /// ### Returns
    ///
    /// The `ScoreMatrix`.
    pub fn run(&self, matrix: &ExpressionMatrix) -> Result<ScoreMatrix> {
        self.check_genes(matrix)?;
        debug!(
            "Scoring {} samples with {:?} layout",
            matrix.n_samples(),
            matrix.layout()
        );
        score_matrix(
            matrix,
            &self.catalog,
            self.walk_options(matrix.layout()),
            self.params.n_threads,
            self.params.progress_interval,
        )
    }

    /// Score a matrix and write the result table
    ///
    /// Bulk results hold one row per gene set, single cell results one row
    /// per sample.
    ///
    /// ### Params
    ///
    /// * `matrix` - The expression matrix over the engine's genes.
    /// * `output` - Path of the result table.
    ///
    /// ### Returns
    ///
    /// The `ScoreMatrix` that was written.
    pub fn run_to_file(&self, matrix: &ExpressionMatrix, output: &Path) -> Result<ScoreMatrix> {
        let scores = self.run(matrix)?;
        write_scores(output, self.params.output_sep, &scores, matrix.layout())?;
        info!("Results written to {}", output.display());
        Ok(scores)
    }

    /// Score one sample-major batch and spill it as the next chunk
    pub fn run_chunked(
        &self,
        ctx: &mut ChunkRunContext,
        batch: &ExpressionMatrix,
    ) -> Result<PathBuf> {
        self.check_genes(batch)?;
        spill_batch(self, ctx, batch)
    }

    /// Keep the `n_keep` most variable gene sets of a chunked run
    ///
    /// ### Params
    ///
    /// * `chunk_dir` - Directory of the chunks written by this engine.
    /// * `sample_ids` - Sample ids in arrival order.
    /// * `n_keep` - Number of gene sets to keep.
    /// * `output` - Path of the merged result table.
    /// * `ranking_path` - Path of the variance ranking.
    ///
    /// ### Returns
    ///
    /// The `FilterSummary`.
    pub fn filter_results(
        &self,
        chunk_dir: &Path,
        sample_ids: &[String],
        n_keep: usize,
        output: &Path,
        ranking_path: &Path,
    ) -> Result<FilterSummary> {
        filter_chunks(
            chunk_dir,
            &self.gene_set_ids(),
            sample_ids,
            n_keep,
            output,
            ranking_path,
            self.params.output_sep,
        )
    }

    /// Like `filter_results()`, but a run without chunks is not an error
    ///
    /// A missing chunk directory, or one without chunks, is logged as
    /// "no data to filter" and gives `None`.
    ///
    /// ### Params
    ///
    /// * `chunk_dir` - Directory of the chunks written by this engine.
    /// * `sample_ids` - Sample ids in arrival order.
    /// * `n_keep` - Number of gene sets to keep.
    /// * `output` - Path of the merged result table.
    /// * `ranking_path` - Path of the variance ranking.
    ///
    /// ### Returns
    ///
    /// The `FilterSummary` if there was anything to merge.
    pub fn try_filter_results(
        &self,
        chunk_dir: &Path,
        sample_ids: &[String],
        n_keep: usize,
        output: &Path,
        ranking_path: &Path,
    ) -> Result<Option<FilterSummary>> {
        match self.filter_results(chunk_dir, sample_ids, n_keep, output, ranking_path) {
            Ok(summary) => Ok(Some(summary)),
            Err(GseaError::NoChunkData { path }) => {
                warn!("no data to filter in {}", path.display());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Keep the `n_keep` most variable gene sets of an in-memory result
    ///
    /// ### Params
    ///
    /// * `scores` - Scores produced by this engine.
    /// * `n_keep` - Number of gene sets to keep.
    /// * `ranking_path` - Path of the variance ranking.
    ///
    /// ### Returns
    ///
    /// The reduced `ScoreMatrix` in catalog order.
    pub fn keep_most_variable(
        &self,
        scores: &ScoreMatrix,
        n_keep: usize,
        ranking_path: &Path,
    ) -> Result<ScoreMatrix> {
        let (filtered, _) = filter_score_matrix(scores, n_keep, ranking_path)?;
        Ok(filtered)
    }

    /// Reads per million followed by per gene mean centring, in place
    pub fn normalise(matrix: &mut ExpressionMatrix) {
        normalise_expression(matrix);
    }
}
