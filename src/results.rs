//! Loading and reshaping differential-expression results.

use crate::error::ShapeError;
use exprlab_protocol::{
    AnalysisParameters, DifferentialExpressionResult, Regulation, RegulationSummary, TopExpressedMetadata,
    TopExpressedResponse, TopGene, VolcanoData,
};
use serde_json::Value;
use std::{fs, path::Path};
use tracing::debug;

/// Gene and fold-change cut-offs used for "significant" gene lists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceCutoffs {
    pub adjusted_p: f64,
    pub abs_log2_fold_change: f64,
}

impl Default for SignificanceCutoffs {
    fn default() -> Self {
        Self {
            adjusted_p: 0.05,
            abs_log2_fold_change: 1.0,
        }
    }
}

fn numeric_field(row: &Value, field: &str, index: usize, origin: &str) -> Result<Option<f64>, ShapeError> {
    match row.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("nan") {
                return Ok(None);
            }
            trimmed.parse::<f64>().map(Some).map_err(|_| ShapeError::Malformed {
                path: origin.to_string(),
                reason: format!("row {index}: '{field}' is not numeric ('{s}')"),
            })
        }
        Some(other) => Err(ShapeError::Malformed {
            path: origin.to_string(),
            reason: format!("row {index}: '{field}' has unexpected value {other}"),
        }),
    }
}

fn gene_field(row: &Value, index: usize, origin: &str) -> Result<String, ShapeError> {
    match row.get("gene") {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ShapeError::Malformed {
            path: origin.to_string(),
            reason: format!("row {index}: 'gene' has unexpected value {other}"),
        }),
    }
}

/// Parses engine output: a JSON array of objects. Numeric fields may be
/// numbers, numeric strings, `null`, or the engine's `NA`/`NaN` markers,
/// the latter all becoming `None`.
pub fn parse_results(text: &str, origin: &str) -> Result<Vec<DifferentialExpressionResult>, ShapeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ShapeError::Malformed {
        path: origin.to_string(),
        reason: e.to_string(),
    })?;
    let Value::Array(rows) = value else {
        return Err(ShapeError::Malformed {
            path: origin.to_string(),
            reason: "expected a JSON array of result rows".to_string(),
        });
    };
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            if !row.is_object() {
                return Err(ShapeError::Malformed {
                    path: origin.to_string(),
                    reason: format!("row {index} is not an object"),
                });
            }
            Ok(DifferentialExpressionResult {
                gene: gene_field(row, index, origin)?,
                log2_fold_change: numeric_field(row, "log2_fold_change", index, origin)?,
                p_value: numeric_field(row, "p_value", index, origin)?,
                adjusted_p_value: numeric_field(row, "adjusted_p_value", index, origin)?,
            })
        })
        .collect()
}

pub fn load_results(path: &Path) -> Result<Vec<DifferentialExpressionResult>, ShapeError> {
    let origin = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| ShapeError::Io {
        path: origin.clone(),
        reason: e.to_string(),
    })?;
    let results = parse_results(&text, &origin)?;
    debug!(path = %origin, rows = results.len(), "Loaded differential expression results");
    Ok(results)
}

fn is_significant(row: &DifferentialExpressionResult, threshold: f64) -> bool {
    row.adjusted_p_value.is_some_and(|p| p < threshold)
}

/// Significant genes ranked by absolute fold change, strongest first.
pub fn top_expressed(
    results: &[DifferentialExpressionResult],
    top_n: usize,
    significance_threshold: f64,
) -> TopExpressedResponse {
    let significant: Vec<&DifferentialExpressionResult> = results
        .iter()
        .filter(|row| is_significant(row, significance_threshold))
        .collect();

    let mut ranked: Vec<(&DifferentialExpressionResult, f64, f64)> = significant
        .iter()
        .filter_map(|row| Some((*row, row.log2_fold_change?, row.adjusted_p_value?)))
        .collect();
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

    let top_genes = ranked
        .into_iter()
        .take(top_n)
        .map(|(row, lfc, adj_p)| TopGene {
            gene: row.gene.clone(),
            log2_fold_change: lfc,
            p_value: row.p_value,
            adjusted_p_value: adj_p,
            fold_change: 2f64.powf(lfc.abs()),
            regulation: if lfc > 0.0 {
                Regulation::Up
            } else {
                Regulation::Down
            },
        })
        .collect();

    let summary = RegulationSummary {
        upregulated: significant
            .iter()
            .filter(|row| row.log2_fold_change.is_some_and(|v| v > 0.0))
            .count(),
        downregulated: significant
            .iter()
            .filter(|row| row.log2_fold_change.is_some_and(|v| v < 0.0))
            .count(),
    };

    TopExpressedResponse {
        top_genes,
        metadata: TopExpressedMetadata {
            total_genes: results.len(),
            significant_genes: significant.len(),
            analysis_parameters: AnalysisParameters {
                significance_threshold,
                top_n,
            },
            summary,
        },
    }
}

/// Column-oriented view of every result row, in stored order.
pub fn volcano_data(results: &[DifferentialExpressionResult]) -> Result<VolcanoData, ShapeError> {
    let mut out = VolcanoData {
        log2_fold_change: Vec::with_capacity(results.len()),
        p_value: Vec::with_capacity(results.len()),
        gene: Vec::with_capacity(results.len()),
    };
    for (index, row) in results.iter().enumerate() {
        if row.gene.is_empty() {
            return Err(ShapeError::MissingField { index, field: "gene" });
        }
        let lfc = row.log2_fold_change.ok_or(ShapeError::MissingField {
            index,
            field: "log2_fold_change",
        })?;
        let p = row.p_value.ok_or(ShapeError::MissingField {
            index,
            field: "p_value",
        })?;
        out.log2_fold_change.push(lfc);
        out.p_value.push(p);
        out.gene.push(row.gene.clone());
    }
    Ok(out)
}

pub fn significant_gene_symbols(
    results: &[DifferentialExpressionResult],
    cutoffs: SignificanceCutoffs,
) -> Vec<String> {
    results
        .iter()
        .filter(|row| {
            row.adjusted_p_value.is_some_and(|p| p < cutoffs.adjusted_p)
                && row
                    .log2_fold_change
                    .is_some_and(|lfc| lfc.abs() > cutoffs.abs_log2_fold_change)
        })
        .map(|row| row.gene.clone())
        .collect()
}
