//! Centralised tunables, loaded once and handed to each component.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "exprlab.json";
pub const DE_ENGINE_ENV_BIN: &str = "EXPRLAB_DE_ENGINE_BIN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub default_top_n_genes: usize,
    pub significance_threshold: f64,
    pub log2fc_threshold: f64,
    pub default_top_variable: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            default_top_n_genes: 500,
            significance_threshold: 0.05,
            log2fc_threshold: 1.0,
            default_top_variable: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeEngineConfig {
    /// Program followed by its fixed leading arguments. The three data paths
    /// are appended at run time.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for DeEngineConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "Rscript".to_string(),
                "--vanilla".to_string(),
                "deseq2_analysis.R".to_string(),
            ],
            timeout_secs: 300,
        }
    }
}

impl DeEngineConfig {
    /// Program to spawn; the environment override wins over the configured one.
    pub fn program(&self) -> String {
        std::env::var(DE_ENGINE_ENV_BIN)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| self.command.first().map(|p| p.trim().to_string()))
            .unwrap_or_default()
    }

    pub fn leading_args(&self) -> &[String] {
        self.command.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub add_list_url: String,
    pub enrich_url: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub description: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            add_list_url: "https://maayanlab.cloud/Enrichr/addList".to_string(),
            enrich_url: "https://maayanlab.cloud/Enrichr/enrich".to_string(),
            max_retries: 3,
            retry_delay_ms: 5_000,
            request_timeout_secs: 10,
            description: "Gene list".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneValidationConfig {
    pub hgnc_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for GeneValidationConfig {
    fn default() -> Self {
        Self {
            hgnc_base_url: "https://rest.genenames.org".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub analysis: AnalysisConfig,
    pub de_engine: DeEngineConfig,
    pub enrichment: EnrichmentConfig,
    pub cache: CacheConfig,
    pub gene_validation: GeneValidationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            analysis: AnalysisConfig::default(),
            de_engine: DeEngineConfig::default(),
            enrichment: EnrichmentConfig::default(),
            cache: CacheConfig::default(),
            gene_validation: GeneValidationConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text, path)
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self, ConfigError> {
        if std::path::Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.analysis.significance_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "significance_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if !self.analysis.log2fc_threshold.is_finite() || self.analysis.log2fc_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "log2fc_threshold must be a non-negative number, got {}",
                self.analysis.log2fc_threshold
            )));
        }
        if self.de_engine.command.is_empty() || self.de_engine.command[0].trim().is_empty() {
            return Err(ConfigError::Invalid(
                "de_engine.command must name a program".to_string(),
            ));
        }
        if self.de_engine.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "de_engine.timeout_secs must be positive".to_string(),
            ));
        }
        if self.enrichment.request_timeout_secs == 0 || self.gene_validation.request_timeout_secs == 0
        {
            return Err(ConfigError::Invalid(
                "request timeouts must be positive".to_string(),
            ));
        }
        if self.enrichment.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "enrichment.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}
