//! Machine-readable contracts shared by the ExprLab pipeline and its front ends.
//!
//! Everything here is plain serde data: no I/O, no validation. Field names
//! follow the JSON payloads consumers already expect (`log2_fold_change`,
//! `userListId`-derived handles, ...).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PROTOCOL_SCHEMA: &str = "exprlab.protocol.v1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerSampleStats {
    pub mean: BTreeMap<String, f64>,
    pub median: BTreeMap<String, f64>,
    pub std: BTreeMap<String, f64>,
}

/// Aggregate description of a count matrix, computed after filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub samples: usize,
    pub genes: usize,
    pub mean_counts: f64,
    pub median_counts: f64,
    pub zero_counts_pct: f64,
    pub non_zero_genes: usize,
    pub stats_per_sample: PerSampleStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountsIngestReport {
    pub message: String,
    pub summary: SummaryStats,
    pub zero_variance_genes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesignInfo {
    pub samples: Vec<BTreeMap<String, String>>,
    pub conditions: Vec<String>,
    pub condition_counts: BTreeMap<String, usize>,
    pub total_samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionOverview {
    pub genes: Vec<String>,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopVariableMetadata {
    pub total_genes: usize,
    pub selected_genes: usize,
    pub variance_range: VarianceRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopVariableReport {
    pub genes: Vec<String>,
    pub variances: Vec<f64>,
    pub metadata: TopVariableMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub total_genes: usize,
    pub filtered_shape: [usize; 2],
}

/// Z-scored expression permuted into dendrogram leaf order on both axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredView {
    pub expression_data: Vec<Vec<f64>>,
    pub genes: Vec<String>,
    pub samples: Vec<String>,
    pub metadata: ClusterMetadata,
}

/// One row of differential-expression engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialExpressionResult {
    pub gene: String,
    pub log2_fold_change: Option<f64>,
    pub p_value: Option<f64>,
    pub adjusted_p_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regulation {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopGene {
    pub gene: String,
    pub log2_fold_change: f64,
    pub p_value: Option<f64>,
    pub adjusted_p_value: f64,
    pub fold_change: f64,
    pub regulation: Regulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    pub significance_threshold: f64,
    pub top_n: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegulationSummary {
    pub upregulated: usize,
    pub downregulated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopExpressedMetadata {
    pub total_genes: usize,
    pub significant_genes: usize,
    pub analysis_parameters: AnalysisParameters,
    pub summary: RegulationSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopExpressedResponse {
    pub top_genes: Vec<TopGene>,
    pub metadata: TopExpressedMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolcanoData {
    pub log2_fold_change: Vec<f64>,
    pub p_value: Vec<f64>,
    pub gene: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeRunReport {
    pub output_path: String,
    pub result_count: usize,
    pub elapsed_ms: u128,
}

/// Handle returned by the enrichment service for a submitted gene list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub user_list_id: String,
    pub gene_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentTerm {
    pub rank: u64,
    pub term: String,
    pub p_value: f64,
    pub z_score: f64,
    pub combined_score: f64,
    pub overlapping_genes: Vec<String>,
    pub adjusted_p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentMetadata {
    pub total_genes_analyzed: usize,
    pub library_used: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResponse {
    pub enrichment_results: Vec<EnrichmentTerm>,
    pub metadata: EnrichmentMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneValidation {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub url: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAvailability {
    pub available: bool,
    pub status_code: u16,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineAvailability {
    pub available: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regulation_serializes_lowercase() {
        let text = serde_json::to_string(&Regulation::Up).expect("serialize regulation");
        assert_eq!(text, "\"up\"");
        let back: Regulation = serde_json::from_str("\"down\"").expect("parse regulation");
        assert_eq!(back, Regulation::Down);
    }

    #[test]
    fn de_result_accepts_null_fields() {
        let row: DifferentialExpressionResult = serde_json::from_str(
            r#"{"gene":"TP53","log2_fold_change":null,"p_value":0.2,"adjusted_p_value":null}"#,
        )
        .expect("parse row");
        assert_eq!(row.gene, "TP53");
        assert!(row.log2_fold_change.is_none());
        assert_eq!(row.p_value, Some(0.2));
    }

    #[test]
    fn clustered_view_shape_is_an_array_pair() {
        let view = ClusteredView {
            expression_data: vec![vec![1.0, -1.0]],
            genes: vec!["g1".to_string()],
            samples: vec!["s1".to_string(), "s2".to_string()],
            metadata: ClusterMetadata {
                total_genes: 10,
                filtered_shape: [1, 2],
            },
        };
        let value = serde_json::to_value(&view).expect("serialize view");
        assert_eq!(value["metadata"]["filtered_shape"], serde_json::json!([1, 2]));
    }
}
