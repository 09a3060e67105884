use log::info;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::core::data::structures::{ExpressionMatrix, Layout, ScoreMatrix};
use crate::core::data::table_io::write_atomically;
use crate::core::engine::GseaEngine;
use crate::core::enrichment::scheduler::{linear_eta, resolve_threads};
use crate::core::enrichment::variance_filter::list_chunk_files;
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Mutable state of one spilling run
///
/// Kept apart from the (immutable) engine and passed explicitly to every
/// call, so that several runs can share one engine.
///
/// ### Fields
///
/// * `chunk_dir` - Directory of the chunk files; derived from the run start
///   time on the first batch if not given.
/// * `next_chunk` - Number of the next chunk file.
/// * `samples_done` - Samples written so far.
/// * `expected_samples` - Total samples of the run if known, used for the ETA.
/// * `started` - Start of the first batch.
/// * `run_start` - Wall clock start of the run, names the default directory.
#[derive(Debug, Clone)]
pub struct ChunkRunContext {
    chunk_dir: Option<PathBuf>,
    next_chunk: usize,
    samples_done: usize,
    expected_samples: Option<usize>,
    started: Option<Instant>,
    run_start: SystemTime,
}

impl ChunkRunContext {
    /// Create a new run context
    ///
    /// ### Params
    ///
    /// * `chunk_dir` - Explicit chunk directory; `None` derives
    ///   `<tmp>/chunks<unix seconds>` on the first batch.
    /// * `expected_samples` - Total number of samples if known.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(chunk_dir: Option<PathBuf>, expected_samples: Option<usize>) -> Self {
        Self {
            chunk_dir,
            next_chunk: 0,
            samples_done: 0,
            expected_samples,
            started: None,
            run_start: SystemTime::now(),
        }
    }

    pub fn chunk_dir(&self) -> Option<&Path> {
        self.chunk_dir.as_deref()
    }

    pub fn n_chunks(&self) -> usize {
        self.next_chunk
    }

    pub fn samples_done(&self) -> usize {
        self.samples_done
    }

    /// Return the chunk directory, creating it if required
    ///
    /// Before the first chunk of a run, a directory that already holds
    /// chunk files is refused.
    fn ensure_chunk_dir(&mut self) -> Result<PathBuf> {
        let dir = match &self.chunk_dir {
            Some(dir) => dir.clone(),
            None => {
                let secs = self
                    .run_start
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                std::env::temp_dir().join(format!("chunks{}", secs))
            }
        };
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        } else if self.next_chunk == 0 {
            match list_chunk_files(&dir) {
                Ok(existing) => {
                    return Err(GseaError::PreconditionViolation(format!(
                        "chunk directory {} already holds {} chunks",
                        dir.display(),
                        existing.len()
                    )))
                }
                Err(GseaError::NoChunkData { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.chunk_dir = Some(dir.clone());

        Ok(dir)
    }
}

/// Outcome of a complete chunked run
///
/// ### Fields
///
/// * `chunk_dir` - Directory holding the chunks, `None` if no sample arrived.
/// * `n_chunks` - Number of chunk files written.
/// * `sample_ids` - Sample ids in arrival order.
#[derive(Debug, Clone)]
pub struct ChunkedRunSummary {
    pub chunk_dir: Option<PathBuf>,
    pub n_chunks: usize,
    pub sample_ids: Vec<String>,
}

/////////////////
// Chunk files //
/////////////////

/// Write the scores of one batch as a chunk file
///
/// One line per gene set with the comma separated scores of the batch'
/// samples in arrival order.
///
/// ### Params
///
/// * `path` - Path of the chunk.
/// * `scores` - The scores of the batch.
pub fn write_chunk(path: &Path, scores: &ScoreMatrix) -> Result<()> {
    write_atomically(path, |w| {
        for k in 0..scores.n_gene_sets() {
            for j in 0..scores.n_samples() {
                if j != 0 {
                    w.write_all(b",")?;
                }
                write!(w, "{}", scores.get(k, j))?;
            }
            w.write_all(b"\n")?;
        }
        Ok(())
    })
}

/// Score one batch and spill it to the next chunk file
///
/// ### Params
///
/// * `engine` - The engine holding the gene sets and parameters.
/// * `ctx` - The run context, updated with the new chunk.
/// * `batch` - The samples of this batch.
///
/// ### Returns
///
/// Path of the written chunk.
pub fn spill_batch(
    engine: &GseaEngine,
    ctx: &mut ChunkRunContext,
    batch: &ExpressionMatrix,
) -> Result<PathBuf> {
    let started = *ctx.started.get_or_insert_with(Instant::now);
    let first = ctx.next_chunk == 0;
    let dir = ctx.ensure_chunk_dir()?;
    if first {
        info!("Chunks path: {}", dir.display());
    }

    let scores = engine.run(batch)?;
    let path = dir.join(ctx.next_chunk.to_string());
    write_chunk(&path, &scores)?;

    ctx.samples_done += batch.n_samples();
    ctx.next_chunk += 1;

    match ctx.expected_samples {
        Some(total) => {
            let eta = linear_eta(ctx.samples_done, total, started.elapsed());
            info!(
                "Sample: {} ETA: {:.1} min",
                ctx.samples_done,
                eta.as_secs_f64() / 60.0
            );
        }
        None => info!(
            "Sample: {} ({} chunks, {:.1} s elapsed)",
            ctx.samples_done,
            ctx.next_chunk,
            started.elapsed().as_secs_f64()
        ),
    }

    Ok(path)
}

//////////////
// Pipeline //
//////////////

/// Batches streamed samples and spills every batch to disk
///
/// A batch holds `threads * batch_size` samples. Each full batch is scored
/// and written before the next one is collected; the last, possibly partial
/// batch is flushed by `finish()`.
pub struct ChunkedPipeline<'a> {
    engine: &'a GseaEngine,
    ctx: ChunkRunContext,
    capacity: usize,
    sample_ids: Vec<String>,
    batch_ids: Vec<String>,
    batch_values: Vec<f64>,
}

impl<'a> ChunkedPipeline<'a> {
    /// Create a new pipeline
    ///
    /// ### Params
    ///
    /// * `engine` - The engine to score with.
    /// * `ctx` - Run context, usually fresh.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(engine: &'a GseaEngine, ctx: ChunkRunContext) -> Self {
        let params = engine.params();
        let capacity = resolve_threads(params.n_threads) * params.batch_size.max(1);
        Self {
            engine,
            ctx,
            capacity,
            sample_ids: Vec::new(),
            batch_ids: Vec::with_capacity(capacity),
            batch_values: Vec::with_capacity(capacity * engine.gene_ids().len()),
        }
    }

    /// Number of samples per batch
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add one sample; flushes when the batch is full
    ///
    /// ### Params
    ///
    /// * `sample_id` - Id of the sample.
    /// * `counts` - Counts of the sample in the engine's gene order.
    pub fn push(&mut self, sample_id: String, counts: Vec<f64>) -> Result<()> {
        let n_genes = self.engine.gene_ids().len();
        if counts.len() != n_genes {
            return Err(GseaError::PreconditionViolation(format!(
                "sample {} holds {} counts, expected {}",
                sample_id,
                counts.len(),
                n_genes
            )));
        }
        self.batch_ids.push(sample_id);
        self.batch_values.extend(counts);

        if self.batch_ids.len() == self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch_ids.is_empty() {
            return Ok(());
        }
        let batch_ids = std::mem::take(&mut self.batch_ids);
        let batch_values = std::mem::take(&mut self.batch_values);
        let batch = ExpressionMatrix::new(
            Layout::SampleMajor,
            self.engine.gene_ids().to_vec(),
            batch_ids,
            batch_values,
        )?;
        spill_batch(self.engine, &mut self.ctx, &batch)?;
        self.sample_ids.extend_from_slice(batch.sample_ids());

        Ok(())
    }

    /// Flush the final batch and return the run summary
    pub fn finish(mut self) -> Result<ChunkedRunSummary> {
        self.flush()?;
        Ok(ChunkedRunSummary {
            chunk_dir: self.ctx.chunk_dir().map(Path::to_path_buf),
            n_chunks: self.ctx.n_chunks(),
            sample_ids: self.sample_ids,
        })
    }

    /// Feed a complete stream of samples through the pipeline
    ///
    /// ### Params
    ///
    /// * `rows` - Iterator over `(sample_id, counts)`.
    ///
    /// ### Returns
    ///
    /// The run summary.
    pub fn run<I>(mut self, rows: I) -> Result<ChunkedRunSummary>
    where
        I: IntoIterator<Item = Result<(String, Vec<f64>)>>,
    {
        for row in rows {
            let (sample_id, counts) = row?;
            self.push(sample_id, counts)?;
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::structures::GeneSet;
    use crate::core::engine::GseaParams;
    use std::fs;
    use tempfile::tempdir;

    fn engine(n_threads: usize, batch_size: usize) -> GseaEngine {
        let genes: Vec<String> = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
        let gene_sets = vec![
            GeneSet::new("AB", ["A", "B"]),
            GeneSet::new("C", ["C"]),
            GeneSet::new("BCD", ["B", "C", "D"]),
        ];
        let params = GseaParams {
            n_threads,
            batch_size,
            ..GseaParams::default()
        };
        GseaEngine::new(genes, &gene_sets, params).unwrap()
    }

    fn rows(n: usize) -> Vec<Result<(String, Vec<f64>)>> {
        (0..n)
            .map(|i| {
                let counts = (0..4).map(|g| ((i * 5 + g * 3) % 7) as f64 + 1.0).collect();
                Ok((format!("cell{}", i), counts))
            })
            .collect()
    }

    #[test]
    fn test_batches_of_threads_times_batch_size() {
        let dir = tempdir().unwrap();
        let engine = engine(2, 2);
        let ctx = ChunkRunContext::new(Some(dir.path().to_path_buf()), Some(5));
        let pipeline = ChunkedPipeline::new(&engine, ctx);
        assert_eq!(pipeline.capacity(), 4);

        let summary = pipeline.run(rows(5)).unwrap();
        assert_eq!(summary.n_chunks, 2);
        assert_eq!(summary.sample_ids.len(), 5);

        let chunk0 = fs::read_to_string(dir.path().join("0")).unwrap();
        let chunk1 = fs::read_to_string(dir.path().join("1")).unwrap();
        assert_eq!(chunk0.lines().count(), 3);
        assert_eq!(chunk1.lines().count(), 3);
        assert!(chunk0.lines().all(|l| l.split(',').count() == 4));
        assert!(chunk1.lines().all(|l| l.split(',').count() == 1));
    }

    #[test]
    fn test_chunk_matches_in_memory_scores() {
        let dir = tempdir().unwrap();
        let engine = engine(3, 1);
        let mut ctx = ChunkRunContext::new(Some(dir.path().to_path_buf()), None);

        let batch = ExpressionMatrix::from_rows(
            Layout::SampleMajor,
            engine.gene_ids().to_vec(),
            vec!["x".to_string(), "y".to_string()],
            vec![vec![4.0, 3.0, 2.0, 1.0], vec![0.0, 1.0, 5.0, 0.0]],
        )
        .unwrap();
        let path = spill_batch(&engine, &mut ctx, &batch).unwrap();
        assert_eq!(path, dir.path().join("0"));
        assert_eq!(ctx.n_chunks(), 1);
        assert_eq!(ctx.samples_done(), 2);

        let scores = engine.run(&batch).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        for (k, line) in content.lines().enumerate() {
            let parsed: Vec<f64> = line.split(',').map(|v| v.parse().unwrap()).collect();
            assert_eq!(parsed, scores.gene_set_row(k));
        }
    }

    #[test]
    fn test_default_chunk_dir_is_created() {
        let engine = engine(1, 1);
        let mut ctx = ChunkRunContext::new(None, None);
        let batch = ExpressionMatrix::from_rows(
            Layout::SampleMajor,
            engine.gene_ids().to_vec(),
            vec!["x".to_string()],
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        )
        .unwrap();
        let path = spill_batch(&engine, &mut ctx, &batch).unwrap();
        let dir = ctx.chunk_dir().unwrap().to_path_buf();
        assert!(dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("chunks")));
        assert!(path.exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_push_rejects_wrong_width() {
        let engine = engine(1, 1);
        let mut pipeline = ChunkedPipeline::new(&engine, ChunkRunContext::new(None, None));
        let res = pipeline.push("bad".to_string(), vec![1.0]);
        assert!(matches!(res, Err(GseaError::PreconditionViolation(_))));
    }

    #[test]
    fn test_used_chunk_dir_is_refused() {
        let dir = tempdir().unwrap();
        let engine = engine(2, 1);

        let first = ChunkedPipeline::new(
            &engine,
            ChunkRunContext::new(Some(dir.path().to_path_buf()), None),
        );
        assert_eq!(first.run(rows(4)).unwrap().n_chunks, 2);

        let second = ChunkedPipeline::new(
            &engine,
            ChunkRunContext::new(Some(dir.path().to_path_buf()), None),
        );
        let res = second.run(rows(2));
        assert!(matches!(res, Err(GseaError::PreconditionViolation(_))));

        // the chunks of the first run are untouched
        let chunk0 = fs::read_to_string(dir.path().join("0")).unwrap();
        assert!(chunk0.lines().all(|l| l.split(',').count() == 2));
        assert!(!dir.path().join("2").exists());

        // an existing directory without chunks is fine
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let third = ChunkedPipeline::new(&engine, ChunkRunContext::new(Some(empty), None));
        assert_eq!(third.run(rows(1)).unwrap().n_chunks, 1);
    }
}
