//! Directory-backed analysis workspace.
//!
//! Every derived artifact is regenerated whole from its upstream input:
//! a new count upload rewrites both matrices and drops results computed
//! from the previous data, a new design drops stale engine results.

use crate::{
    cluster::cluster,
    config::PipelineConfig,
    de_engine::DeInvoker,
    enrichment::EnrichmentClient,
    error::{ClusterError, PipelineError, PipelineResult, ValidationError},
    files::{write_all_atomic, write_atomic},
    gene_symbols::GeneSymbolValidator,
    matrix::{CountTable, DesignTable, ExpressionMatrix},
    result_cache::ResultCache,
    results::{SignificanceCutoffs, load_results, significant_gene_symbols, top_expressed, volcano_data},
    transform::{preprocess, summary_stats, variance_report},
    validator::{validate_counts, validate_cross_reference, validate_design},
};
use exprlab_protocol::{
    ClusteredView, CountsIngestReport, DeRunReport, DesignInfo, DifferentialExpressionResult,
    EngineAvailability, EnrichmentResponse, ExpressionOverview, GeneValidation, TopExpressedResponse,
    TopVariableReport, VolcanoData,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info};

pub const RAW_COUNTS_FILE: &str = "raw_counts.csv";
pub const LOG_DATA_FILE: &str = "log_transformed_data.csv";
pub const DESIGN_FILE: &str = "experiment_design.csv";
pub const DE_RESULTS_FILE: &str = "deseq2_results.json";

#[derive(Debug, Clone)]
pub struct DataWorkspace {
    config: PipelineConfig,
}

fn require(path: &Path, what: &str) -> PipelineResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::NotFound(format!(
            "{what} not found; upload it first ({})",
            path.display()
        )))
    }
}

/// Reads a matrix this workspace wrote earlier.
fn read_matrix(path: &Path) -> PipelineResult<ExpressionMatrix> {
    let table = CountTable::from_csv_path(path)?;
    let mut values = Vec::with_capacity(table.cells.len());
    for (gene, row) in table.genes.iter().zip(&table.cells) {
        let parsed: Vec<f64> = row
            .iter()
            .zip(&table.samples)
            .map(|(raw, sample)| {
                raw.trim()
                    .parse::<f64>()
                    .map_err(|_| ValidationError::NonNumericValue {
                        gene: gene.clone(),
                        sample: sample.clone(),
                        value: raw.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;
        values.push(parsed);
    }
    Ok(ExpressionMatrix::new(table.genes, table.samples, values)?.with_index_label(table.index_label))
}

fn describe_design(design: &DesignTable) -> DesignInfo {
    let conditions = design.conditions();
    let mut condition_counts = BTreeMap::new();
    for condition in &conditions {
        *condition_counts.entry(condition.to_string()).or_insert(0) += 1;
    }
    DesignInfo {
        samples: design.records(),
        conditions: conditions.iter().unique().map(|c| c.to_string()).collect(),
        condition_counts,
        total_samples: design.len(),
    }
}

impl DataWorkspace {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.config.data_dir.join(file)
    }

    fn drop_stale(&self, file: &str) -> PipelineResult<()> {
        let path = self.path(file);
        if path.exists() {
            debug!(path = %path.display(), "Removing stale artifact");
            fs::remove_file(&path)
                .map_err(|e| PipelineError::Io(format!("could not remove {}: {e}", path.display())))?;
        }
        Ok(())
    }

    /// Validates a count CSV, then writes the filtered counts and their
    /// log transform into the workspace.
    pub fn ingest_counts(&self, csv_path: &Path) -> PipelineResult<CountsIngestReport> {
        let table = CountTable::from_csv_path(csv_path)?;
        let validated = validate_counts(&table)?;
        let (filtered, log) = preprocess(&validated.matrix);
        if filtered.is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }
        let summary = summary_stats(&filtered);

        let raw_csv = filtered.to_csv_string().map_err(PipelineError::Internal)?;
        let log_csv = log.to_csv_string().map_err(PipelineError::Internal)?;
        let (raw_path, log_path) = (self.path(RAW_COUNTS_FILE), self.path(LOG_DATA_FILE));
        write_all_atomic(&[
            (raw_path.as_path(), raw_csv.as_bytes()),
            (log_path.as_path(), log_csv.as_bytes()),
        ])
        .map_err(|e| PipelineError::Io(format!("could not store count data: {e}")))?;
        self.drop_stale(DE_RESULTS_FILE)?;
        info!(
            genes = filtered.n_genes(),
            samples = filtered.n_samples(),
            "Count data stored"
        );

        Ok(CountsIngestReport {
            message: "Data processed successfully".to_string(),
            summary,
            zero_variance_genes: validated.zero_variance_genes,
        })
    }

    pub fn ingest_design(&self, csv_path: &Path) -> PipelineResult<DesignInfo> {
        let design = DesignTable::from_csv_path(csv_path)?;
        validate_design(&design)?;
        let log_path = self.path(LOG_DATA_FILE);
        require(&log_path, "expression data")?;
        let log = read_matrix(&log_path)?;
        validate_cross_reference(&design, log.samples())?;

        let design_csv = design.to_csv_string().map_err(PipelineError::Internal)?;
        let design_path = self.path(DESIGN_FILE);
        write_atomic(&design_path, design_csv.as_bytes()).map_err(|e| {
            PipelineError::Io(format!("could not store {}: {e}", design_path.display()))
        })?;
        self.drop_stale(DE_RESULTS_FILE)?;
        info!(samples = design.len(), "Design stored");
        Ok(describe_design(&design))
    }

    pub fn design_info(&self) -> PipelineResult<DesignInfo> {
        let path = self.path(DESIGN_FILE);
        require(&path, "experiment design")?;
        Ok(describe_design(&DesignTable::from_csv_path(&path)?))
    }

    pub fn expression_values(&self) -> PipelineResult<ExpressionMatrix> {
        let path = self.path(LOG_DATA_FILE);
        require(&path, "expression data")?;
        read_matrix(&path)
    }

    pub fn expression_overview(&self) -> PipelineResult<ExpressionOverview> {
        let matrix = self.expression_values()?;
        Ok(ExpressionOverview {
            genes: matrix.genes().to_vec(),
            samples: matrix.samples().to_vec(),
        })
    }

    pub fn top_variable(&self, n: Option<usize>) -> PipelineResult<TopVariableReport> {
        let n = n.unwrap_or(self.config.analysis.default_top_variable);
        Ok(variance_report(&self.expression_values()?, n))
    }

    pub fn clustering(&self, top_n: Option<usize>) -> PipelineResult<ClusteredView> {
        let n = top_n.unwrap_or(self.config.analysis.default_top_n_genes);
        cluster(&self.expression_values()?, n).map_err(|e| match e {
            ClusterError::Transform(inner) => PipelineError::Transform(inner),
            other => other.into(),
        })
    }

    pub fn engine_availability(&self) -> EngineAvailability {
        DeInvoker::new(&self.config.de_engine).availability()
    }

    pub fn run_differential_expression(&self) -> PipelineResult<DeRunReport> {
        let counts = self.path(RAW_COUNTS_FILE);
        let design = self.path(DESIGN_FILE);
        require(&counts, "count data")?;
        require(&design, "experiment design")?;
        let output = self.path(DE_RESULTS_FILE);

        let started = Instant::now();
        let mut invoker = DeInvoker::new(&self.config.de_engine);
        let results = invoker.run(&counts, &design, &output)?;
        Ok(DeRunReport {
            output_path: output.display().to_string(),
            result_count: results.len(),
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    pub fn de_results(&self) -> PipelineResult<Vec<DifferentialExpressionResult>> {
        let path = self.path(DE_RESULTS_FILE);
        require(&path, "differential expression results")?;
        Ok(load_results(&path)?)
    }

    /// Runs the engine first when no results exist yet.
    pub fn top_expressed(&self, top_n: Option<usize>) -> PipelineResult<TopExpressedResponse> {
        if !self.path(DE_RESULTS_FILE).is_file() {
            info!("No differential expression results yet, running engine");
            self.run_differential_expression()?;
        }
        let results = self.de_results()?;
        Ok(top_expressed(
            &results,
            top_n.unwrap_or(self.config.analysis.default_top_n_genes),
            self.config.analysis.significance_threshold,
        ))
    }

    pub fn volcano(&self) -> PipelineResult<VolcanoData> {
        Ok(volcano_data(&self.de_results()?)?)
    }

    fn cutoffs(&self) -> SignificanceCutoffs {
        SignificanceCutoffs {
            adjusted_p: self.config.analysis.significance_threshold,
            abs_log2_fold_change: self.config.analysis.log2fc_threshold,
        }
    }

    pub fn significant_genes(&self) -> PipelineResult<Vec<String>> {
        Ok(significant_gene_symbols(&self.de_results()?, self.cutoffs()))
    }

    pub fn enrichment(&self, library: &str) -> PipelineResult<EnrichmentResponse> {
        let genes = self.significant_genes()?;
        let cache = ResultCache::from_config(self.data_dir(), &self.config.cache)?;
        let client = EnrichmentClient::new(self.config.enrichment.clone())?.with_cache(cache);
        Ok(client.run_full_analysis(&genes, library)?)
    }

    pub fn validate_genes(&self, genes: &[String]) -> PipelineResult<GeneValidation> {
        Ok(GeneSymbolValidator::new(&self.config.gene_validation)?.validate(genes)?)
    }
}
