use log::debug;
use statrs::statistics::Statistics;

use crate::core::data::structures::ExpressionMatrix;

/// Scale every sample to reads per million
///
/// Samples without any reads are left untouched.
///
/// ### Params
///
/// * `matrix` - The expression matrix, modified in place.
///
/// ### Returns
///
/// The number of skipped all-zero samples.
pub fn rpm(matrix: &mut ExpressionMatrix) -> usize {
    let mut skipped = 0;
    for sample in 0..matrix.n_samples() {
        let total: f64 = (0..matrix.n_genes())
            .map(|gene| matrix.get(gene, sample))
            .sum();
        if total == 0.0 {
            skipped += 1;
            continue;
        }
        let factor = 1e6 / total;
        for gene in 0..matrix.n_genes() {
            *matrix.get_mut(gene, sample) *= factor;
        }
    }
    skipped
}

/// Subtract each gene's mean over all samples
///
/// ### Params
///
/// * `matrix` - The expression matrix, modified in place.
pub fn mean_centre(matrix: &mut ExpressionMatrix) {
    let n_samples = matrix.n_samples();
    if n_samples == 0 {
        return;
    }
    for gene in 0..matrix.n_genes() {
        let mean = (0..n_samples).map(|sample| matrix.get(gene, sample)).mean();
        for sample in 0..n_samples {
            *matrix.get_mut(gene, sample) -= mean;
        }
    }
}

/// Reads per million followed by per gene mean centring
pub fn normalise_expression(matrix: &mut ExpressionMatrix) {
    let skipped = rpm(matrix);
    if skipped > 0 {
        debug!("{} samples without reads were not scaled", skipped);
    }
    mean_centre(matrix);
}
