use std::collections::BTreeSet;

/// Malformed or inconsistent input. Always raised before any side effect.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("input is empty")]
    EmptyInput,

    #[error("could not read table: {0}")]
    Unreadable(String),

    #[error("duplicate gene names found in the index: {}", .0.join(", "))]
    DuplicateGeneId(Vec<String>),

    #[error("all count values must be numeric: gene '{gene}', sample '{sample}' holds '{value}'")]
    NonNumericValue {
        gene: String,
        sample: String,
        value: String,
    },

    #[error("raw counts cannot contain negative values: gene '{gene}', sample '{sample}' holds {value}")]
    NegativeValue {
        gene: String,
        sample: String,
        value: f64,
    },

    #[error("design file must contain a '{0}' column")]
    MissingColumn(String),

    #[error("duplicate sample names found in design file: {}", .0.join(", "))]
    DuplicateSample(Vec<String>),

    #[error("at least two different conditions required, found {found}")]
    InsufficientConditions { found: usize },

    #[error(
        "some samples in design file not found in expression data: {}",
        .0.iter().cloned().collect::<Vec<_>>().join(", ")
    )]
    UnknownSamples(BTreeSet<String>),
}

/// Degenerate numeric cases met while transforming a matrix.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("gene '{gene}' has zero standard deviation and cannot be z-scored")]
    DegenerateRow { gene: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClusterError {
    #[error("clustering needs at least 2 genes and 2 samples, got {rows}x{cols}")]
    InsufficientSamples { rows: usize, cols: usize },

    #[error("{axis} distance matrix contains non-finite values")]
    NonFiniteDistance { axis: &'static str },

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Failures of one differential-expression engine run. Never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeError {
    #[error("input file not found: {path}")]
    InputMissing { path: String },

    #[error("invalid input file '{path}': {reason}")]
    InputInvalid { path: String, reason: String },

    #[error("could not start engine '{program}': {reason}")]
    EngineUnavailable { program: String, reason: String },

    #[error("engine did not finish within {seconds}s and was terminated")]
    Timeout { seconds: u64 },

    #[error("engine failed (exit={code:?}): {}", .stderr.trim())]
    EngineError { code: Option<i32>, stderr: String },

    #[error("engine reported success but did not produce output file '{path}'")]
    OutputMissing { path: String },

    #[error("engine output '{path}' is malformed: {reason}")]
    OutputMalformed { path: String, reason: String },

    #[error("{0}")]
    Io(String),
}

/// Problems loading or reshaping stored differential-expression results.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("result row {index} is missing '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("result file '{path}' is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error("could not read result file '{path}': {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnrichmentError {
    #[error("gene list is empty")]
    EmptyGeneList,

    #[error("enrichment service kept rate-limiting after {attempts} attempts")]
    RateLimited { attempts: usize },

    #[error("gene list submission failed (status={status}): {}", .body.trim())]
    SubmissionFailed { status: u16, body: String },

    #[error("enrichment fetch failed (status={status}): {}", .body.trim())]
    FetchFailed { status: u16, body: String },

    #[error("enrichment service returned an unexpected response: {0}")]
    MalformedResponse(String),

    #[error("enrichment request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O failed for '{path}': {reason}")]
    Io { path: String, reason: String },

    #[error("cache entry '{path}' is not valid JSON: {reason}")]
    Serde { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeneCheckError {
    #[error("gene validation request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolCatalogError {
    #[error("invalid tool '{tool}' (available: {})", .available.join(", "))]
    UnknownTool { tool: String, available: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("could not parse config '{path}': {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for workspace-level operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Engine(#[from] DeError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    GeneCheck(#[from] GeneCheckError),

    #[error(transparent)]
    ToolCatalog(#[from] ToolCatalogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable code, printed as `CODE: message`.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Transform(_) => "TRANSFORM_ERROR",
            Self::Cluster(_) => "CLUSTER_ERROR",
            Self::Engine(DeError::Timeout { .. }) => "ENGINE_TIMEOUT",
            Self::Engine(DeError::InputMissing { .. } | DeError::InputInvalid { .. }) => {
                "ENGINE_INPUT"
            }
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Shape(_) => "RESULT_ERROR",
            Self::Enrichment(EnrichmentError::RateLimited { .. }) => "ENRICHMENT_RATE_LIMITED",
            Self::Enrichment(_) => "ENRICHMENT_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::GeneCheck(_) => "GENE_CHECK_ERROR",
            Self::ToolCatalog(_) => "INVALID_TOOL",
            Self::Config(_) => "CONFIG_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Internal faults are reported generically by front ends.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Io(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_samples_message_is_sorted() {
        let missing: BTreeSet<String> = ["S9", "S1"].iter().map(|s| s.to_string()).collect();
        let err = ValidationError::UnknownSamples(missing);
        assert_eq!(
            err.to_string(),
            "some samples in design file not found in expression data: S1, S9"
        );
    }

    #[test]
    fn pipeline_codes_distinguish_timeouts() {
        let timeout = PipelineError::from(DeError::Timeout { seconds: 300 });
        let failed = PipelineError::from(DeError::EngineError {
            code: Some(1),
            stderr: "boom\n".to_string(),
        });
        assert_eq!(timeout.error_code(), "ENGINE_TIMEOUT");
        assert_eq!(failed.error_code(), "ENGINE_ERROR");
        assert_eq!(failed.to_string(), "engine failed (exit=Some(1)): boom");
    }

    #[test]
    fn internal_faults_are_flagged() {
        assert!(PipelineError::Internal("x".to_string()).is_internal());
        assert!(!PipelineError::NotFound("x".to_string()).is_internal());
    }
}
