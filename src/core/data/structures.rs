use faer::Mat;
use rustc_hash::FxHashSet;

use crate::error::{GseaError, Result};

///////////
// Enums //
///////////

/// Orientation of an expression matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Bulk layout: rows represent genes, columns represent samples.
    GeneMajor,
    /// Single cell layout: rows represent samples (cells), columns represent
    /// genes.
    SampleMajor,
}

/////////////////
// Gene sample //
/////////////////

/// A single cell of the expression matrix tagged with its gene
///
/// The gene index is carried along so that the gene identity can be
/// recovered once a sample profile was sorted by expression.
///
/// ### Fields
///
/// * `gene_idx` - Index of the gene in the gene universe.
/// * `count` - The (possibly normalised) expression value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeneSample {
    pub gene_idx: usize,
    pub count: f64,
}

//////////////
// Gene set //
//////////////

/// A named gene set
///
/// ### Fields
///
/// * `id` - Identifier of the gene set.
/// * `members` - The gene identifiers belonging to this set.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneSet {
    pub id: String,
    pub members: FxHashSet<String>,
}

impl GeneSet {
    /// Create a new gene set
    ///
    /// Duplicated members are collapsed and the order in which members are
    /// supplied has no influence on the resulting set.
    ///
    /// ### Params
    ///
    /// * `id` - Identifier of the gene set.
    /// * `members` - Iterator over the gene identifiers.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new<I, S>(id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of distinct members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Membership test
    pub fn contains(&self, gene_id: &str) -> bool {
        self.members.contains(gene_id)
    }
}

///////////////////////
// Expression matrix //
///////////////////////

/// Dense expression matrix in either bulk or single cell orientation
///
/// Values are stored row-major with respect to the layout, i.e., one gene per
/// row for `Layout::GeneMajor` and one sample per row for
/// `Layout::SampleMajor`.
///
/// ### Fields
///
/// * `layout` - Orientation of the data.
/// * `gene_ids` - Identifiers of the genes (the gene universe).
/// * `sample_ids` - Identifiers of the samples.
/// * `values` - Flat row-major values.
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    layout: Layout,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
    values: Vec<f64>,
}

impl ExpressionMatrix {
    /// Create a new expression matrix from flat values
    ///
    /// ### Params
    ///
    /// * `layout` - Orientation of `values`.
    /// * `gene_ids` - Gene identifiers.
    /// * `sample_ids` - Sample identifiers.
    /// * `values` - Flat row-major values of length `genes * samples`.
    ///
    /// ### Returns
    ///
    /// The matrix or a `PreconditionViolation` if the dimensions do not add
    /// up.
    pub fn new(
        layout: Layout,
        gene_ids: Vec<String>,
        sample_ids: Vec<String>,
        values: Vec<f64>,
    ) -> Result<Self> {
        let expected = gene_ids.len() * sample_ids.len();
        if values.len() != expected {
            return Err(GseaError::PreconditionViolation(format!(
                "expression matrix holds {} values, expected {} genes x {} samples = {}",
                values.len(),
                gene_ids.len(),
                sample_ids.len(),
                expected
            )));
        }

        Ok(Self {
            layout,
            gene_ids,
            sample_ids,
            values,
        })
    }

    /// Create a new expression matrix from nested rows
    ///
    /// ### Params
    ///
    /// * `layout` - Orientation of the rows: one gene per row for
    ///   `GeneMajor`, one sample per row for `SampleMajor`.
    /// * `gene_ids` - Gene identifiers.
    /// * `sample_ids` - Sample identifiers.
    /// * `rows` - The nested rows.
    ///
    /// ### Returns
    ///
    /// The matrix or a `PreconditionViolation` for ragged rows.
    pub fn from_rows(
        layout: Layout,
        gene_ids: Vec<String>,
        sample_ids: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let row_len = match layout {
            Layout::GeneMajor => sample_ids.len(),
            Layout::SampleMajor => gene_ids.len(),
        };
        if let Some(bad) = rows.iter().position(|r| r.len() != row_len) {
            return Err(GseaError::PreconditionViolation(format!(
                "row {} has {} values, expected {}",
                bad,
                rows[bad].len(),
                row_len
            )));
        }
        let values: Vec<f64> = rows.into_iter().flatten().collect();

        Self::new(layout, gene_ids, sample_ids, values)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    #[inline]
    fn offset(&self, gene_idx: usize, sample_idx: usize) -> usize {
        match self.layout {
            Layout::GeneMajor => gene_idx * self.sample_ids.len() + sample_idx,
            Layout::SampleMajor => sample_idx * self.gene_ids.len() + gene_idx,
        }
    }

    /// Value of a given gene in a given sample
    #[inline]
    pub fn get(&self, gene_idx: usize, sample_idx: usize) -> f64 {
        self.values[self.offset(gene_idx, sample_idx)]
    }

    /// Mutable access to the value of a given gene in a given sample
    #[inline]
    pub fn get_mut(&mut self, gene_idx: usize, sample_idx: usize) -> &mut f64 {
        let offset = self.offset(gene_idx, sample_idx);
        &mut self.values[offset]
    }

    /// Read the expression profile of one sample along the layout's axis
    ///
    /// This is the one place where the orientation matters for scoring: a
    /// bulk sample is a column, a single cell sample is a row. The returned
    /// profile is in gene order and not yet ranked.
    ///
    /// ### Params
    ///
    /// * `sample_idx` - Index of the sample.
    ///
    /// ### Returns
    ///
    /// Vector of `GeneSample` with one entry per gene.
    pub fn sample_profile(&self, sample_idx: usize) -> Vec<GeneSample> {
        match self.layout {
            Layout::GeneMajor => (0..self.n_genes())
                .map(|gene_idx| GeneSample {
                    gene_idx,
                    count: self.get(gene_idx, sample_idx),
                })
                .collect(),
            Layout::SampleMajor => {
                let start = sample_idx * self.n_genes();
                self.values[start..start + self.n_genes()]
                    .iter()
                    .enumerate()
                    .map(|(gene_idx, &count)| GeneSample { gene_idx, count })
                    .collect()
            }
        }
    }
}

//////////////////
// Score matrix //
//////////////////

/// Enrichment scores for samples x gene sets
///
/// Storage is sample-major so that every worker can be handed a contiguous,
/// disjoint slice of samples.
///
/// ### Fields
///
/// * `gene_set_ids` - Identifiers of the scored gene sets.
/// * `sample_ids` - Identifiers of the samples.
/// * `data` - Flat scores, `n_gene_sets` consecutive values per sample.
#[derive(Clone, Debug)]
pub struct ScoreMatrix {
    gene_set_ids: Vec<String>,
    sample_ids: Vec<String>,
    data: Vec<f64>,
}

impl ScoreMatrix {
    /// Generate a zero initialised score matrix
    ///
    /// ### Params
    ///
    /// * `gene_set_ids` - Identifiers of the gene sets.
    /// * `sample_ids` - Identifiers of the samples.
    ///
    /// ### Returns
    ///
    /// Initialised self
    pub fn new(gene_set_ids: Vec<String>, sample_ids: Vec<String>) -> Self {
        let data = vec![0.0; gene_set_ids.len() * sample_ids.len()];
        Self {
            gene_set_ids,
            sample_ids,
            data,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_gene_sets(&self) -> usize {
        self.gene_set_ids.len()
    }

    pub fn gene_set_ids(&self) -> &[String] {
        &self.gene_set_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Score of gene set `gene_set_idx` in sample `sample_idx`
    #[inline]
    pub fn get(&self, gene_set_idx: usize, sample_idx: usize) -> f64 {
        self.data[sample_idx * self.gene_set_ids.len() + gene_set_idx]
    }

    /// All gene set scores of one sample
    pub fn sample_scores(&self, sample_idx: usize) -> &[f64] {
        let n = self.gene_set_ids.len();
        &self.data[sample_idx * n..(sample_idx + 1) * n]
    }

    /// All sample scores of one gene set
    pub fn gene_set_row(&self, gene_set_idx: usize) -> Vec<f64> {
        (0..self.n_samples())
            .map(|j| self.get(gene_set_idx, j))
            .collect()
    }

    /// The raw, sample-major buffer for the scheduler to split
    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Subset to the given gene sets, in the given order
    ///
    /// ### Params
    ///
    /// * `gene_set_indices` - Indices of the gene sets to keep.
    ///
    /// ### Returns
    ///
    /// A new `ScoreMatrix` over the same samples.
    pub fn select_gene_sets(&self, gene_set_indices: &[usize]) -> ScoreMatrix {
        let ids = gene_set_indices
            .iter()
            .map(|&k| self.gene_set_ids[k].clone())
            .collect();
        let mut selected = ScoreMatrix::new(ids, self.sample_ids.clone());
        let width = gene_set_indices.len();
        for j in 0..self.n_samples() {
            for (slot, &k) in gene_set_indices.iter().enumerate() {
                selected.data[j * width + slot] = self.get(k, j);
            }
        }
        selected
    }

    /// Transform into a faer matrix with gene sets as rows and samples as
    /// columns
    pub fn to_faer(&self) -> Mat<f64> {
        Mat::from_fn(self.n_gene_sets(), self.n_samples(), |i, j| self.get(i, j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_profiles_match_across_layouts() {
        // genes x samples
        // g0: [1, 2, 3]
        // g1: [4, 5, 6]
        let bulk = ExpressionMatrix::from_rows(
            Layout::GeneMajor,
            ids("g", 2),
            ids("s", 3),
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
        )
        .unwrap();
        let sc = ExpressionMatrix::from_rows(
            Layout::SampleMajor,
            ids("g", 2),
            ids("s", 3),
            vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]],
        )
        .unwrap();

        for j in 0..3 {
            assert_eq!(bulk.sample_profile(j), sc.sample_profile(j));
        }
        assert_eq!(bulk.get(1, 2), 6.0);
        assert_eq!(sc.get(1, 2), 6.0);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let res = ExpressionMatrix::from_rows(
            Layout::GeneMajor,
            ids("g", 2),
            ids("s", 2),
            vec![vec![1.0, 2.0], vec![3.0]],
        );
        assert!(matches!(res, Err(GseaError::PreconditionViolation(_))));
    }

    #[test]
    fn test_gene_set_member_order() {
        let a = GeneSet::new("set", ["A", "B", "C"]);
        let b = GeneSet::new("set", ["C", "A", "B", "A"]);
        assert_eq!(a, b);
        assert_eq!(b.len(), 3);
        assert!(b.contains("A"));
        assert!(!b.contains("D"));
    }

    #[test]
    fn test_score_matrix_views() {
        let mut scores = ScoreMatrix::new(ids("gs", 2), ids("s", 3));
        scores
            .data_mut()
            .copy_from_slice(&[1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);

        assert_eq!(scores.sample_scores(1), &[2.0, 20.0]);
        assert_eq!(scores.gene_set_row(1), vec![10.0, 20.0, 30.0]);

        let mat = scores.to_faer();
        assert_eq!(mat.nrows(), 2);
        assert_eq!(mat.ncols(), 3);
        assert_eq!(mat[(1, 2)], 30.0);
    }
}
