//! Structural and numeric checks for count tables and design tables.

use crate::{
    error::ValidationError,
    matrix::{CountTable, DesignTable, ExpressionMatrix},
    transform::sample_variance,
};
use itertools::Itertools;
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

/// Outcome of a successful count validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCounts {
    pub matrix: ExpressionMatrix,
    /// Genes whose counts never vary across samples. Reported, never fatal.
    pub zero_variance_genes: Vec<String>,
}

fn parse_count(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn validate_counts(table: &CountTable) -> Result<ValidatedCounts, ValidationError> {
    if table.genes.is_empty() || table.samples.is_empty() {
        return Err(ValidationError::EmptyInput);
    }

    let duplicates: Vec<String> = table.genes.iter().duplicates().cloned().collect();
    if !duplicates.is_empty() {
        return Err(ValidationError::DuplicateGeneId(duplicates));
    }

    let mut values = Vec::with_capacity(table.cells.len());
    for (gene, row) in table.genes.iter().zip(&table.cells) {
        let mut parsed = Vec::with_capacity(row.len());
        for (sample, raw) in table.samples.iter().zip(row) {
            let value = parse_count(raw).ok_or_else(|| ValidationError::NonNumericValue {
                gene: gene.clone(),
                sample: sample.clone(),
                value: raw.clone(),
            })?;
            parsed.push(value);
        }
        values.push(parsed);
    }

    for (gene, row) in table.genes.iter().zip(&values) {
        if let Some((idx, value)) = row.iter().enumerate().find(|(_, v)| **v < 0.0) {
            return Err(ValidationError::NegativeValue {
                gene: gene.clone(),
                sample: table.samples[idx].clone(),
                value: *value,
            });
        }
    }

    let matrix = ExpressionMatrix::new(table.genes.clone(), table.samples.clone(), values)?
        .with_index_label(table.index_label.clone());

    let zero_variance_genes: Vec<String> = matrix
        .genes()
        .iter()
        .zip(matrix.values())
        .filter(|(_, row)| sample_variance(row) == Some(0.0))
        .map(|(gene, _)| gene.clone())
        .collect();
    if !zero_variance_genes.is_empty() {
        warn!(
            count = zero_variance_genes.len(),
            "Found genes with zero variance"
        );
    }

    Ok(ValidatedCounts {
        matrix,
        zero_variance_genes,
    })
}

pub fn validate_design(design: &DesignTable) -> Result<(), ValidationError> {
    for required in ["sample", "condition"] {
        if design.column_index(required).is_none() {
            return Err(ValidationError::MissingColumn(required.to_string()));
        }
    }

    let duplicates: Vec<String> = design
        .samples()
        .into_iter()
        .duplicates()
        .map(str::to_string)
        .collect();
    if !duplicates.is_empty() {
        return Err(ValidationError::DuplicateSample(duplicates));
    }

    let distinct = design.conditions().into_iter().unique().count();
    if distinct < 2 {
        return Err(ValidationError::InsufficientConditions { found: distinct });
    }
    Ok(())
}

/// Every design sample must name a column of the expression matrix.
pub fn validate_cross_reference(
    design: &DesignTable,
    expression_columns: &[String],
) -> Result<(), ValidationError> {
    let known: HashSet<&str> = expression_columns.iter().map(String::as_str).collect();
    let missing: BTreeSet<String> = design
        .samples()
        .into_iter()
        .filter(|sample| !known.contains(sample))
        .map(str::to_string)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::UnknownSamples(missing))
    }
}
