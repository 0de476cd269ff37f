//! Checks gene symbols against the HGNC REST service.

use crate::{config::GeneValidationConfig, error::GeneCheckError};
use exprlab_protocol::GeneValidation;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct GeneSymbolValidator {
    base_url: String,
    http: Client,
}

fn num_found(body: &str) -> u64 {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/response/numFound").and_then(Value::as_u64))
        .unwrap_or(0)
}

impl GeneSymbolValidator {
    pub fn new(config: &GeneValidationConfig) -> Result<Self, GeneCheckError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GeneCheckError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: config.hgnc_base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn is_known(&self, gene: &str) -> Result<bool, GeneCheckError> {
        let url = format!("{}/fetch/symbol/{}", self.base_url, gene.trim());
        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| GeneCheckError::Transport(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            debug!(gene, status = response.status().as_u16(), "Symbol lookup rejected");
            return Ok(false);
        }
        let body = response
            .text()
            .map_err(|e| GeneCheckError::Transport(e.to_string()))?;
        Ok(num_found(&body) > 0)
    }

    /// Splits `genes` into known and unknown symbols, keeping input order.
    pub fn validate(&self, genes: &[String]) -> Result<GeneValidation, GeneCheckError> {
        let mut out = GeneValidation::default();
        for gene in genes {
            if self.is_known(gene)? {
                out.valid.push(gene.clone());
            } else {
                out.invalid.push(gene.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedServer;

    #[test]
    fn splits_known_and_unknown_symbols() {
        let server = ScriptedServer::start(vec![
            (200, r#"{"response":{"numFound":1,"docs":[{"symbol":"TP53"}]}}"#.to_string()),
            (200, r#"{"response":{"numFound":0,"docs":[]}}"#.to_string()),
            (404, "not found".to_string()),
        ]);
        let validator = GeneSymbolValidator::new(&GeneValidationConfig {
            hgnc_base_url: format!("{}/", server.base_url),
            request_timeout_secs: 5,
        })
        .expect("validator");
        let genes: Vec<String> = ["TP53", "NOTAGENE", "ALSO_NOT"]
            .iter()
            .map(|g| g.to_string())
            .collect();
        let result = validator.validate(&genes).expect("validate");
        assert_eq!(result.valid, vec!["TP53"]);
        assert_eq!(result.invalid, vec!["NOTAGENE", "ALSO_NOT"]);
        let requests = server.finish();
        assert!(requests[0].request_line.starts_with("GET /fetch/symbol/TP53 "));
        assert_eq!(requests[0].header("accept"), Some("application/json"));
    }

    #[test]
    fn unparseable_body_counts_as_unknown() {
        assert_eq!(num_found("<html>"), 0);
        assert_eq!(num_found(r#"{"response":{"numFound":3}}"#), 3);
    }
}
