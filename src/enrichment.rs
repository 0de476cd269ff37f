//! Client for the Enrichr gene-set enrichment service.
//!
//! A run is two calls: submit the gene list (multipart form) to obtain a
//! `userListId`, then fetch enrichment rows for one library. Only
//! submission is retried, and only on HTTP 429.

use crate::{config::EnrichmentConfig, error::EnrichmentError, result_cache::ResultCache};
use exprlab_protocol::{EnrichmentJob, EnrichmentMetadata, EnrichmentResponse, EnrichmentTerm};
use reqwest::blocking::{Client, multipart::Form};
use serde_json::Value;
use std::{thread, time::Duration};
use tracing::{info, warn};

pub struct EnrichmentClient {
    config: EnrichmentConfig,
    http: Client,
    cache: Option<ResultCache>,
}

fn transport(e: reqwest::Error) -> EnrichmentError {
    EnrichmentError::Transport(e.to_string())
}

fn extract_user_list_id(value: &Value) -> Option<String> {
    match value.get("userListId")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_term(row: &Value) -> Option<EnrichmentTerm> {
    let row = row.as_array()?;
    let number = |idx: usize| row.get(idx).and_then(Value::as_f64);
    let rank = row
        .get(0)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))?;
    Some(EnrichmentTerm {
        rank,
        term: row.get(1)?.as_str()?.to_string(),
        p_value: number(2)?,
        z_score: number(3)?,
        combined_score: number(4)?,
        overlapping_genes: row
            .get(5)?
            .as_array()?
            .iter()
            .filter_map(|g| g.as_str().map(str::to_string))
            .collect(),
        adjusted_p_value: number(6)?,
    })
}

/// Rows for `library` from an enrich response; absent library means none.
pub fn parse_enrichment_rows(
    value: &Value,
    library: &str,
) -> Result<Vec<EnrichmentTerm>, EnrichmentError> {
    let Some(rows) = value.get(library) else {
        return Ok(vec![]);
    };
    let rows = rows.as_array().ok_or_else(|| {
        EnrichmentError::MalformedResponse(format!("'{library}' is not a list of rows"))
    })?;
    rows.iter()
        .enumerate()
        .map(|(idx, row)| {
            parse_term(row).ok_or_else(|| {
                EnrichmentError::MalformedResponse(format!("row {idx} of '{library}' is malformed"))
            })
        })
        .collect()
}

impl EnrichmentClient {
    pub fn new(config: EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(transport)?;
        Ok(Self {
            config,
            http,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Option<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn submit(&self, genes: &[String]) -> Result<EnrichmentJob, EnrichmentError> {
        if genes.is_empty() {
            return Err(EnrichmentError::EmptyGeneList);
        }
        let list = genes.join("\n");
        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            let form = Form::new()
                .text("list", list.clone())
                .text("description", self.config.description.clone());
            let response = self
                .http
                .post(&self.config.add_list_url)
                .multipart(form)
                .send()
                .map_err(transport)?;
            let status = response.status();
            let body = response.text().map_err(transport)?;

            if status.as_u16() == 429 {
                warn!(attempt, attempts, "Enrichment service rate-limited the submission");
                if attempt < attempts {
                    thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                }
                continue;
            }
            if !status.is_success() {
                return Err(EnrichmentError::SubmissionFailed {
                    status: status.as_u16(),
                    body,
                });
            }
            let value = serde_json::from_str::<Value>(&body).map_err(|e| {
                EnrichmentError::MalformedResponse(format!("submission response is not JSON: {e}"))
            })?;
            let user_list_id = extract_user_list_id(&value).ok_or_else(|| {
                EnrichmentError::MalformedResponse(
                    "submission response did not contain userListId".to_string(),
                )
            })?;
            info!(%user_list_id, genes = genes.len(), "Gene list submitted");
            return Ok(EnrichmentJob {
                user_list_id,
                gene_count: genes.len(),
            });
        }
        Err(EnrichmentError::RateLimited { attempts })
    }

    pub fn fetch(
        &self,
        job: &EnrichmentJob,
        library: &str,
    ) -> Result<Vec<EnrichmentTerm>, EnrichmentError> {
        let response = self
            .http
            .get(&self.config.enrich_url)
            .query(&[
                ("userListId", job.user_list_id.as_str()),
                ("backgroundType", library),
            ])
            .send()
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().map_err(transport)?;
        if !status.is_success() {
            return Err(EnrichmentError::FetchFailed {
                status: status.as_u16(),
                body,
            });
        }
        let value = serde_json::from_str::<Value>(&body).map_err(|e| {
            EnrichmentError::MalformedResponse(format!("enrichment response is not JSON: {e}"))
        })?;
        parse_enrichment_rows(&value, library)
    }

    /// Submit and fetch, served from the result cache when a fresh entry
    /// exists for the same gene list and library.
    pub fn run_full_analysis(
        &self,
        genes: &[String],
        library: &str,
    ) -> Result<EnrichmentResponse, EnrichmentError> {
        let metadata = |count: usize| EnrichmentMetadata {
            total_genes_analyzed: count,
            library_used: library.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        if genes.is_empty() {
            return Ok(EnrichmentResponse {
                enrichment_results: vec![],
                metadata: metadata(0),
            });
        }

        let tool = format!("enrichr_{library}");
        if let Some(cache) = &self.cache {
            match cache.get::<EnrichmentResponse>(&tool, genes) {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Ignoring unreadable cache entry"),
            }
        }

        let job = self.submit(genes)?;
        let enrichment_results = self.fetch(&job, library)?;
        let response = EnrichmentResponse {
            enrichment_results,
            metadata: metadata(genes.len()),
        };
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&tool, genes, &response) {
                warn!(error = %e, "Could not store enrichment result in cache");
            }
        }
        Ok(response)
    }
}
