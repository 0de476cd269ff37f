//! Deterministic numeric transforms over expression matrices.
//!
//! Variances follow the sample (n - 1) convention; z-scores use the
//! population standard deviation. Both conventions match the downstream
//! heatmap and variance views.

use crate::{error::TransformError, matrix::ExpressionMatrix};
use exprlab_protocol::{
    PerSampleStats, SummaryStats, TopVariableMetadata, TopVariableReport, VarianceRange,
};
use std::cmp::Ordering;
use tracing::{info, warn};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Variance with `n - 1` in the denominator; `None` below two observations.
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some(ss / (values.len() - 1) as f64)
}

fn population_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / values.len() as f64).sqrt())
}

/// Keeps rows with at least one value above zero, in their original order.
pub fn filter_nonzero_genes(matrix: &ExpressionMatrix) -> ExpressionMatrix {
    let keep: Vec<usize> = matrix
        .values()
        .iter()
        .enumerate()
        .filter(|(_, row)| row.iter().any(|v| *v > 0.0))
        .map(|(idx, _)| idx)
        .collect();
    matrix.select_rows(&keep)
}

/// Elementwise `log2(x + 1)`.
pub fn log_transform(matrix: &ExpressionMatrix) -> ExpressionMatrix {
    matrix.map_values(|v| (v + 1.0).log2())
}

/// Filters all-zero genes and log-transforms what is left.
pub fn preprocess(counts: &ExpressionMatrix) -> (ExpressionMatrix, ExpressionMatrix) {
    let filtered = filter_nonzero_genes(counts);
    info!(
        genes = filtered.n_genes(),
        samples = filtered.n_samples(),
        dropped = counts.n_genes() - filtered.n_genes(),
        "Filtered data shape"
    );
    let log = log_transform(&filtered);
    (filtered, log)
}

/// Row indices of the `n` most variable genes with their variances, most
/// variable first. Ties keep original row order; rows without a defined
/// variance rank last.
pub fn rank_by_variance(matrix: &ExpressionMatrix, n: usize) -> Vec<(usize, f64)> {
    let mut ranked: Vec<(usize, f64)> = matrix
        .values()
        .iter()
        .enumerate()
        .map(|(idx, row)| (idx, sample_variance(row).unwrap_or(f64::NAN)))
        .collect();
    ranked.sort_by(|a, b| match (a.1.is_nan(), b.1.is_nan()) {
        (false, false) => b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    });
    ranked.truncate(n);
    ranked
}

pub fn top_variable_genes(matrix: &ExpressionMatrix, n: usize) -> ExpressionMatrix {
    let indices: Vec<usize> = rank_by_variance(matrix, n)
        .into_iter()
        .map(|(idx, _)| idx)
        .collect();
    matrix.select_rows(&indices)
}

pub fn variance_report(matrix: &ExpressionMatrix, n: usize) -> TopVariableReport {
    let ranked = rank_by_variance(matrix, n);
    let variances: Vec<f64> = ranked.iter().map(|(_, v)| *v).collect();
    let finite = variances.iter().copied().filter(|v| v.is_finite());
    let min = finite.clone().reduce(f64::min);
    let max = finite.reduce(f64::max);
    TopVariableReport {
        genes: ranked
            .iter()
            .map(|(idx, _)| matrix.genes()[*idx].clone())
            .collect(),
        variances,
        metadata: TopVariableMetadata {
            total_genes: matrix.n_genes(),
            selected_genes: ranked.len(),
            variance_range: VarianceRange { min, max },
        },
    }
}

fn zscore_row(row: &[f64]) -> Option<Vec<f64>> {
    let m = mean(row)?;
    let sd = population_std(row)?;
    let flat = row.iter().all(|v| *v == row[0]);
    if flat || sd == 0.0 || !sd.is_finite() {
        return None;
    }
    Some(row.iter().map(|v| (v - m) / sd).collect())
}

/// Row-wise z-scores. Rows with zero standard deviation come back as NaN.
pub fn zscore(matrix: &ExpressionMatrix) -> ExpressionMatrix {
    matrix.map_rows(|row| zscore_row(row).unwrap_or_else(|| vec![f64::NAN; row.len()]))
}

/// Row-wise z-scores, failing on the first gene with zero standard deviation.
pub fn zscore_strict(matrix: &ExpressionMatrix) -> Result<ExpressionMatrix, TransformError> {
    if let Some((gene, _)) = matrix
        .genes()
        .iter()
        .zip(matrix.values())
        .find(|(_, row)| zscore_row(row).is_none())
    {
        warn!(gene = %gene, "Degenerate row in z-score normalisation");
        return Err(TransformError::DegenerateRow { gene: gene.clone() });
    }
    Ok(zscore(matrix))
}

pub fn summary_stats(matrix: &ExpressionMatrix) -> SummaryStats {
    let columns = matrix.transposed_values();
    let sample_means: Vec<f64> = columns.iter().filter_map(|c| mean(c)).collect();
    let sample_medians: Vec<f64> = columns.iter().filter_map(|c| median(c)).collect();
    let cells = matrix.n_genes() * matrix.n_samples();
    let zeros = matrix
        .values()
        .iter()
        .flatten()
        .filter(|v| **v == 0.0)
        .count();

    let mut per_sample = PerSampleStats::default();
    for (sample, column) in matrix.samples().iter().zip(&columns) {
        per_sample
            .mean
            .insert(sample.clone(), mean(column).unwrap_or(0.0));
        per_sample
            .median
            .insert(sample.clone(), median(column).unwrap_or(0.0));
        per_sample.std.insert(
            sample.clone(),
            sample_variance(column).map(f64::sqrt).unwrap_or(0.0),
        );
    }

    SummaryStats {
        samples: matrix.n_samples(),
        genes: matrix.n_genes(),
        mean_counts: mean(&sample_means).unwrap_or(0.0),
        median_counts: median(&sample_medians).unwrap_or(0.0),
        zero_counts_pct: if cells == 0 {
            0.0
        } else {
            zeros as f64 / cells as f64 * 100.0
        },
        non_zero_genes: matrix
            .values()
            .iter()
            .filter(|row| row.iter().any(|v| *v > 0.0))
            .count(),
        stats_per_sample: per_sample,
    }
}
