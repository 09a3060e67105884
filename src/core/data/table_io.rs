use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::core::data::structures::{ExpressionMatrix, GeneSet, Layout, ScoreMatrix};
use crate::error::{GseaError, Result};

/////////////
// Helpers //
/////////////

/// Parse a single numeric field of a table
///
/// ### Params
///
/// * `field` - The raw field.
/// * `source_name` - Name of the table for the error message.
/// * `line` - 1-based line number.
/// * `column` - 1-based column number.
///
/// ### Returns
///
/// The value, or `MalformedInput` if the field is not a finite number.
pub fn parse_value(field: &str, source_name: &str, line: usize, column: usize) -> Result<f64> {
    match field.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(GseaError::MalformedInput {
            source_name: source_name.to_string(),
            line,
            column,
            value: field.to_string(),
        }),
    }
}

/// Fields of a record without a trailing empty field
fn record_fields(record: &StringRecord) -> Vec<&str> {
    let mut fields: Vec<&str> = record.iter().collect();
    if fields.len() > 1 && fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }
    fields
}

/// Parse a labelled data row: the first field is the id, the rest values
fn parse_labelled_row(
    record: &StringRecord,
    source_name: &str,
    line: usize,
) -> Result<(String, Vec<f64>)> {
    let fields = record_fields(record);
    let label = fields.first().map(|s| s.to_string()).unwrap_or_default();
    let values = fields
        .iter()
        .enumerate()
        .skip(1)
        .map(|(col, field)| parse_value(field, source_name, line, col + 1))
        .collect::<Result<Vec<f64>>>()?;
    Ok((label, values))
}

/// Resolve the header against the width of the data rows
///
/// Headers may or may not carry a leading corner cell above the id column.
fn header_ids(header: &StringRecord, n_values: usize, source_name: &str) -> Result<Vec<String>> {
    let fields = record_fields(header);
    if fields.len() == n_values + 1 {
        Ok(fields[1..].iter().map(|s| s.to_string()).collect())
    } else if fields.len() == n_values {
        Ok(fields.iter().map(|s| s.to_string()).collect())
    } else {
        Err(GseaError::PreconditionViolation(format!(
            "{}: header has {} fields but data rows hold {} values",
            source_name,
            fields.len(),
            n_values
        )))
    }
}

fn open_reader(path: &Path, sep: u8) -> Result<csv::Reader<File>> {
    Ok(ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sep)
        .from_path(path)?)
}

/// Write a file so that it either appears complete or not at all
///
/// The content goes to a temporary file in the target directory that is
/// renamed onto `path` once fully written and flushed.
///
/// ### Params
///
/// * `path` - Final location of the file.
/// * `write` - Closure producing the content.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/////////////
// Readers //
/////////////

/// Read a bulk expression matrix
///
/// The header holds the sample ids, every further row a gene id followed by
/// the counts of that gene. Genes without a single non-zero count are
/// dropped.
///
/// ### Params
///
/// * `path` - Path to the table.
/// * `sep` - Field separator.
///
/// ### Returns
///
/// A gene-major `ExpressionMatrix`.
pub fn read_bulk_matrix(path: &Path, sep: u8) -> Result<ExpressionMatrix> {
    let source_name = path.display().to_string();
    let mut reader = open_reader(path, sep)?;
    let mut records = reader.records();

    let header = match records.next() {
        Some(record) => record?,
        None => return ExpressionMatrix::new(Layout::GeneMajor, vec![], vec![], vec![]),
    };

    let mut gene_ids = Vec::new();
    let mut values = Vec::new();
    let mut n_values: Option<usize> = None;
    let mut dropped = 0_usize;

    for (i, record) in records.enumerate() {
        let (gene_id, row) = parse_labelled_row(&record?, &source_name, i + 2)?;
        let width = *n_values.get_or_insert(row.len());
        if row.len() != width {
            return Err(GseaError::PreconditionViolation(format!(
                "{}: line {} holds {} values, expected {}",
                source_name,
                i + 2,
                row.len(),
                width
            )));
        }
        if row.iter().all(|&v| v == 0.0) {
            dropped += 1;
            continue;
        }
        gene_ids.push(gene_id);
        values.extend(row);
    }

    let sample_ids = header_ids(&header, n_values.unwrap_or(0), &source_name)?;
    if dropped > 0 {
        debug!("Dropped {} genes without expression from {}", dropped, source_name);
    }

    ExpressionMatrix::new(Layout::GeneMajor, gene_ids, sample_ids, values)
}

/// Streaming reader over a single cell expression matrix
///
/// The header holds the gene ids, every further row a sample id followed by
/// the counts of that sample. Rows are yielded one by one so the matrix never
/// needs to be held in memory.
pub struct SingleCellRowReader {
    reader: csv::Reader<File>,
    gene_ids: Vec<String>,
    source_name: String,
    pending: Option<StringRecord>,
    line: usize,
}

impl SingleCellRowReader {
    /// Open the table and read the gene ids
    ///
    /// ### Params
    ///
    /// * `path` - Path to the table.
    /// * `sep` - Field separator.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn open(path: &Path, sep: u8) -> Result<Self> {
        let source_name = path.display().to_string();
        let mut reader = open_reader(path, sep)?;

        let mut header = StringRecord::new();
        if !reader.read_record(&mut header)? {
            return Ok(Self {
                reader,
                gene_ids: Vec::new(),
                source_name,
                pending: None,
                line: 1,
            });
        }

        let mut first = StringRecord::new();
        let pending = if reader.read_record(&mut first)? {
            Some(first)
        } else {
            None
        };
        let n_values = pending
            .as_ref()
            .map(|r| record_fields(r).len().saturating_sub(1))
            .unwrap_or_else(|| record_fields(&header).len());
        let gene_ids = header_ids(&header, n_values, &source_name)?;

        Ok(Self {
            reader,
            gene_ids,
            source_name,
            pending,
            line: 1,
        })
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    fn next_row(&mut self) -> Result<Option<(String, Vec<f64>)>> {
        let record = match self.pending.take() {
            Some(record) => record,
            None => {
                let mut record = StringRecord::new();
                if !self.reader.read_record(&mut record)? {
                    return Ok(None);
                }
                record
            }
        };
        self.line += 1;

        let (sample_id, row) = parse_labelled_row(&record, &self.source_name, self.line)?;
        if row.len() != self.gene_ids.len() {
            return Err(GseaError::PreconditionViolation(format!(
                "{}: line {} holds {} values, expected {}",
                self.source_name,
                self.line,
                row.len(),
                self.gene_ids.len()
            )));
        }
        Ok(Some((sample_id, row)))
    }
}

impl Iterator for SingleCellRowReader {
    type Item = Result<(String, Vec<f64>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Read a complete single cell expression matrix into memory
pub fn read_single_cell_matrix(path: &Path, sep: u8) -> Result<ExpressionMatrix> {
    let rows = SingleCellRowReader::open(path, sep)?;
    let gene_ids = rows.gene_ids().to_vec();
    let mut sample_ids = Vec::new();
    let mut values = Vec::new();
    for row in rows {
        let (sample_id, counts) = row?;
        sample_ids.push(sample_id);
        values.extend(counts);
    }

    ExpressionMatrix::new(Layout::SampleMajor, gene_ids, sample_ids, values)
}

/// Read only the sample ids (first column) of a single cell matrix
pub fn read_single_cell_sample_ids(path: &Path, sep: u8) -> Result<Vec<String>> {
    let mut reader = open_reader(path, sep)?;
    let mut sample_ids = Vec::new();
    for record in reader.records().skip(1) {
        let record = record?;
        if let Some(id) = record.get(0) {
            sample_ids.push(id.to_string());
        }
    }
    Ok(sample_ids)
}

/// Read gene sets, one per row: `<set_id>,<gene_id>,<gene_id>,...`
pub fn read_gene_sets(path: &Path, sep: u8) -> Result<Vec<GeneSet>> {
    let mut reader = open_reader(path, sep)?;
    let mut gene_sets = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut fields = record.iter();
        let Some(id) = fields.next() else {
            continue;
        };
        if id.is_empty() {
            continue;
        }
        gene_sets.push(GeneSet::new(id, fields.filter(|f| !f.is_empty())));
    }
    info!("Read {} gene sets from {}", gene_sets.len(), path.display());

    Ok(gene_sets)
}

/////////////
// Writers //
/////////////

/// Write gene sets, members in sorted order
pub fn write_gene_sets(path: &Path, sep: u8, gene_sets: &[GeneSet]) -> Result<()> {
    write_atomically(path, |w| {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .delimiter(sep)
            .from_writer(w);
        for gene_set in gene_sets {
            let mut members: Vec<&String> = gene_set.members.iter().collect();
            members.sort();
            writer.write_record(std::iter::once(&gene_set.id).chain(members))?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// Write an expression matrix in its own layout
pub fn write_expression_matrix(path: &Path, sep: u8, matrix: &ExpressionMatrix) -> Result<()> {
    write_atomically(path, |w| {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .delimiter(sep)
            .from_writer(w);
        match matrix.layout() {
            Layout::GeneMajor => {
                writer.write_record(matrix.sample_ids())?;
                for (i, gene_id) in matrix.gene_ids().iter().enumerate() {
                    let row = (0..matrix.n_samples()).map(|j| matrix.get(i, j).to_string());
                    writer.write_record(std::iter::once(gene_id.clone()).chain(row))?;
                }
            }
            Layout::SampleMajor => {
                writer.write_record(matrix.gene_ids())?;
                for (j, sample_id) in matrix.sample_ids().iter().enumerate() {
                    let row = (0..matrix.n_genes()).map(|i| matrix.get(i, j).to_string());
                    writer.write_record(std::iter::once(sample_id.clone()).chain(row))?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    })
}

/// Write a result table
///
/// For `Layout::GeneMajor` the header holds the sample ids and every row one
/// gene set; for `Layout::SampleMajor` the header holds the gene set ids and
/// every row one sample.
///
/// ### Params
///
/// * `path` - Output path.
/// * `sep` - Field separator.
/// * `scores` - The scores.
/// * `layout` - Orientation of the output.
pub fn write_scores(path: &Path, sep: u8, scores: &ScoreMatrix, layout: Layout) -> Result<()> {
    write_atomically(path, |w| {
        let mut writer = WriterBuilder::new()
            .flexible(true)
            .delimiter(sep)
            .from_writer(w);
        match layout {
            Layout::GeneMajor => {
                writer.write_record(scores.sample_ids())?;
                for (k, gene_set_id) in scores.gene_set_ids().iter().enumerate() {
                    let row = scores.gene_set_row(k).into_iter().map(|v| v.to_string());
                    writer.write_record(std::iter::once(gene_set_id.clone()).chain(row))?;
                }
            }
            Layout::SampleMajor => {
                writer.write_record(scores.gene_set_ids())?;
                for (j, sample_id) in scores.sample_ids().iter().enumerate() {
                    let row = scores.sample_scores(j).iter().map(|v| v.to_string());
                    writer.write_record(std::iter::once(sample_id.clone()).chain(row))?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_read_bulk_drops_silent_genes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bulk.csv");
        fs::write(&path, "s1,s2\nA,1,2\nB,0,0\nC,3.5,0\n").unwrap();

        let matrix = read_bulk_matrix(&path, b',').unwrap();
        assert_eq!(matrix.gene_ids(), &["A".to_string(), "C".to_string()]);
        assert_eq!(matrix.sample_ids(), &["s1".to_string(), "s2".to_string()]);
        assert_eq!(matrix.get(1, 0), 3.5);
    }

    #[test]
    fn test_read_bulk_with_corner_cell() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bulk.tsv");
        fs::write(&path, "gene\ts1\ts2\nA\t1\t2\n").unwrap();

        let matrix = read_bulk_matrix(&path, b'\t').unwrap();
        assert_eq!(matrix.sample_ids(), &["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_malformed_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bulk.csv");
        fs::write(&path, "s1,s2\nA,1,two\n").unwrap();

        match read_bulk_matrix(&path, b',') {
            Err(GseaError::MalformedInput {
                line,
                column,
                value,
                ..
            }) => {
                assert_eq!(line, 2);
                assert_eq!(column, 3);
                assert_eq!(value, "two");
            }
            other => panic!("expected malformed input, got {:?}", other),
        }

        fs::write(&path, "s1\nA,NaN\n").unwrap();
        assert!(matches!(
            read_bulk_matrix(&path, b','),
            Err(GseaError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_single_cell_streaming() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sc.csv");
        fs::write(&path, "A,B,C\nc1,1,0,2\nc2,0,0,5\n").unwrap();

        let reader = SingleCellRowReader::open(&path, b',').unwrap();
        assert_eq!(reader.gene_ids().len(), 3);
        let rows: Vec<(String, Vec<f64>)> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, "c2");
        assert_eq!(rows[1].1, vec![0.0, 0.0, 5.0]);

        let matrix = read_single_cell_matrix(&path, b',').unwrap();
        assert_eq!(matrix.layout(), Layout::SampleMajor);
        assert_eq!(matrix.get(2, 0), 2.0);

        let ids = read_single_cell_sample_ids(&path, b',').unwrap();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn test_gene_sets_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sets.csv");
        fs::write(&path, "set1,B,A,C\nset2,D\n").unwrap();

        let sets = read_gene_sets(&path, b',').unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0], GeneSet::new("set1", ["A", "B", "C"]));

        let out = dir.path().join("sets_out.csv");
        write_gene_sets(&out, b',', &sets).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "set1,A,B,C\nset2,D\n");
    }

    #[test]
    fn test_write_scores_layouts() {
        let dir = tempdir().unwrap();
        let scores = ScoreMatrix::new(
            vec!["gs1".to_string(), "gs2".to_string()],
            vec!["s1".to_string()],
        );

        let bulk = dir.path().join("bulk.csv");
        write_scores(&bulk, b',', &scores, Layout::GeneMajor).unwrap();
        assert_eq!(fs::read_to_string(&bulk).unwrap(), "s1\ngs1,0\ngs2,0\n");

        let sc = dir.path().join("sc.csv");
        write_scores(&sc, b',', &scores, Layout::SampleMajor).unwrap();
        assert_eq!(fs::read_to_string(&sc).unwrap(), "gs1,gs2\ns1,0,0\n");
    }
}
