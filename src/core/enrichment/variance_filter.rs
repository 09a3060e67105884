use csv::WriterBuilder;
use faer::Mat;
use log::{debug, info};
use statrs::statistics::Statistics;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::core::data::structures::ScoreMatrix;
use crate::core::data::table_io::{parse_value, write_atomically};
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Variance of one gene set's scores over all samples
///
/// ### Fields
///
/// * `gene_set_idx` - Index of the gene set in catalog order.
/// * `variance` - Population variance of the gene set's scores.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneSetVariance {
    pub gene_set_idx: usize,
    pub variance: f64,
}

/// What the filter wrote
///
/// ### Fields
///
/// * `ranking` - All gene sets ordered by descending variance.
/// * `kept` - Indices of the emitted gene sets in catalog order.
/// * `n_chunks` - Number of chunk files consumed.
#[derive(Clone, Debug)]
pub struct FilterSummary {
    pub ranking: Vec<GeneSetVariance>,
    pub kept: Vec<usize>,
    pub n_chunks: usize,
}

/// Line cursor over one chunk file that can be rewound
struct ChunkCursor {
    path: PathBuf,
    reader: BufReader<File>,
    line: usize,
    buf: String,
}

impl ChunkCursor {
    fn open(path: PathBuf) -> Result<Self> {
        let reader = BufReader::new(File::open(&path)?);
        Ok(Self {
            path,
            reader,
            line: 0,
            buf: String::new(),
        })
    }

    /// Append the scores of the next line to `row`
    fn read_scores(&mut self, row: &mut Vec<f64>) -> Result<()> {
        self.buf.clear();
        self.line += 1;
        let source_name = self.path.display().to_string();
        if self.reader.read_line(&mut self.buf)? == 0 {
            return Err(GseaError::MalformedInput {
                source_name,
                line: self.line,
                column: 1,
                value: String::new(),
            });
        }
        for (column, field) in self.buf.trim_end().split(',').enumerate() {
            row.push(parse_value(field, &source_name, self.line, column + 1)?);
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.line = 0;
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// List the chunk files of a directory in numeric order
///
/// Files whose name is not a number are ignored.
///
/// ### Params
///
/// * `chunk_dir` - The chunk directory.
///
/// ### Returns
///
/// The chunk paths ordered by chunk number; `GseaError::NoChunkData` if the
/// directory is missing or holds no chunk.
pub fn list_chunk_files(chunk_dir: &Path) -> Result<Vec<PathBuf>> {
    if !chunk_dir.is_dir() {
        return Err(GseaError::NoChunkData {
            path: chunk_dir.to_path_buf(),
        });
    }

    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(chunk_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(number) = number {
            numbered.push((number, path));
        }
    }

    if numbered.is_empty() {
        return Err(GseaError::NoChunkData {
            path: chunk_dir.to_path_buf(),
        });
    }
    numbered.sort_unstable_by_key(|(number, _)| *number);

    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

/// Read the complete row of one gene set across all chunks
fn read_row(cursors: &mut [ChunkCursor], row: &mut Vec<f64>, n_samples: usize) -> Result<()> {
    row.clear();
    for cursor in cursors.iter_mut() {
        cursor.read_scores(row)?;
    }
    if row.len() != n_samples {
        let last = &cursors[cursors.len() - 1];
        return Err(GseaError::MalformedInput {
            source_name: last.path.display().to_string(),
            line: last.line,
            column: row.len(),
            value: format!("{} scores for {} samples", row.len(), n_samples),
        });
    }
    Ok(())
}

/// Rank gene sets by descending variance, ties in catalog order
pub fn rank_by_variance(variances: &[f64]) -> Vec<GeneSetVariance> {
    let mut ranking: Vec<GeneSetVariance> = variances
        .iter()
        .enumerate()
        .map(|(gene_set_idx, &variance)| GeneSetVariance {
            gene_set_idx,
            variance,
        })
        .collect();
    ranking.sort_by(|a, b| b.variance.total_cmp(&a.variance));
    ranking
}

/// Write the ranking file, `<gene_set_id> <variance>` per line
fn write_ranking(path: &Path, gene_set_ids: &[String], ranking: &[GeneSetVariance]) -> Result<()> {
    write_atomically(path, |w| {
        for entry in ranking {
            writeln!(w, "{} {}", gene_set_ids[entry.gene_set_idx], entry.variance)?;
        }
        Ok(())
    })
}

/// Population variance of every row of a matrix
///
/// ### Params
///
/// * `mat` - Matrix with one gene set per row and one sample per column.
///
/// ### Returns
///
/// Vector of the row variances; zero for a matrix without columns.
pub fn row_variances(mat: &Mat<f64>) -> Vec<f64> {
    let n_cols = mat.ncols();
    if n_cols == 0 {
        return vec![0.0; mat.nrows()];
    }
    let ones = Mat::from_fn(n_cols, 1, |_, _| 1.0);
    let means = (mat * &ones) / n_cols as f64;

    (0..mat.nrows())
        .map(|i| {
            let mean = means[(i, 0)];
            mat.row(i).iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n_cols as f64
        })
        .collect()
}

////////////
// Filter //
////////////

/// Select the most variable gene sets from the chunk files and merge them
///
/// Two streaming passes over the chunks: the first computes the population
/// variance of every gene set's row and writes the ranking file
/// (`<gene_set_id> <variance>` per line, descending); the second rewinds the
/// chunks and writes the selected rows in catalog order under a header of
/// sample ids. Only one row is held in memory at a time.
///
/// ### Params
///
/// * `chunk_dir` - Directory of the chunk files.
/// * `gene_set_ids` - Gene set ids in catalog order, one per chunk line.
/// * `sample_ids` - Sample ids in arrival order.
/// * `n_keep` - Number of gene sets to keep.
/// * `output` - Path of the merged result table.
/// * `ranking_path` - Path of the ranking file.
/// * `sep` - Separator of the result table.
///
/// ### Returns
///
/// The `FilterSummary`.
pub fn filter_chunks(
    chunk_dir: &Path,
    gene_set_ids: &[String],
    sample_ids: &[String],
    n_keep: usize,
    output: &Path,
    ranking_path: &Path,
    sep: u8,
) -> Result<FilterSummary> {
    let n_gene_sets = gene_set_ids.len();
    if n_keep > n_gene_sets {
        return Err(GseaError::PreconditionViolation(format!(
            "cannot keep {} of {} gene sets",
            n_keep, n_gene_sets
        )));
    }

    let chunk_paths = list_chunk_files(chunk_dir)?;
    let n_chunks = chunk_paths.len();
    debug!("Filtering {} chunks in {}", n_chunks, chunk_dir.display());
    let mut cursors = chunk_paths
        .into_iter()
        .map(ChunkCursor::open)
        .collect::<Result<Vec<_>>>()?;

    let n_samples = sample_ids.len();
    let mut row: Vec<f64> = Vec::with_capacity(n_samples);

    // pass 1
    let mut variances = Vec::with_capacity(n_gene_sets);
    for _ in 0..n_gene_sets {
        read_row(&mut cursors, &mut row, n_samples)?;
        variances.push(row.iter().population_variance());
    }
    let ranking = rank_by_variance(&variances);

    write_ranking(ranking_path, gene_set_ids, &ranking)?;

    let mut selected = vec![false; n_gene_sets];
    for entry in ranking.iter().take(n_keep) {
        selected[entry.gene_set_idx] = true;
    }

    // pass 2
    for cursor in cursors.iter_mut() {
        cursor.rewind()?;
    }
    let mut kept = Vec::with_capacity(n_keep);

    write_atomically(output, |w| {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .delimiter(sep)
            .from_writer(w);
        writer.write_record(sample_ids)?;
        for (k, gene_set_id) in gene_set_ids.iter().enumerate() {
            read_row(&mut cursors, &mut row, n_samples)?;
            if !selected[k] {
                continue;
            }
            let values = row.iter().map(|v| v.to_string());
            writer.write_record(std::iter::once(gene_set_id.clone()).chain(values))?;
            kept.push(k);
        }
        writer.flush()?;
        Ok(())
    })?;

    info!(
        "Kept {} of {} gene sets over {} samples",
        kept.len(),
        n_gene_sets,
        n_samples
    );

    Ok(FilterSummary {
        ranking,
        kept,
        n_chunks,
    })
}

/// Keep the most variable gene sets of an in-memory result
///
/// Same ranking and selection as `filter_chunks()`, for scores that were
/// never spilled.
///
/// ### Params
///
/// * `scores` - The full score matrix.
/// * `n_keep` - Number of gene sets to keep.
/// * `ranking_path` - Path of the ranking file.
///
/// ### Returns
///
/// Tuple of the reduced `ScoreMatrix` (catalog order) and the ranking.
pub fn filter_score_matrix(
    scores: &ScoreMatrix,
    n_keep: usize,
    ranking_path: &Path,
) -> Result<(ScoreMatrix, Vec<GeneSetVariance>)> {
    let n_gene_sets = scores.n_gene_sets();
    if n_keep > n_gene_sets {
        return Err(GseaError::PreconditionViolation(format!(
            "cannot keep {} of {} gene sets",
            n_keep, n_gene_sets
        )));
    }

    let ranking = rank_by_variance(&row_variances(&scores.to_faer()));
    write_ranking(ranking_path, scores.gene_set_ids(), &ranking)?;

    let mut kept: Vec<usize> = ranking.iter().take(n_keep).map(|e| e.gene_set_idx).collect();
    kept.sort_unstable();
    info!("Kept {} of {} gene sets", kept.len(), n_gene_sets);

    Ok((scores.select_gene_sets(&kept), ranking))
}
