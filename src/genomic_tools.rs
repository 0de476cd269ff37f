//! Catalog of external genomic web tools and a reachability probe.

use crate::error::ToolCatalogError;
use exprlab_protocol::{ToolAvailability, ToolInfo};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, warn};

pub const PROBE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<(String, ToolInfo)>,
    probe_timeout: Duration,
}

fn tool(name: &str, description: &str, url: &str, features: [&str; 3]) -> ToolInfo {
    ToolInfo {
        name: name.to_string(),
        description: description.to_string(),
        url: url.to_string(),
        features: features.iter().map(|f| f.to_string()).collect(),
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self {
            tools: vec![
                (
                    "string".to_string(),
                    tool(
                        "STRING",
                        "Protein-Protein Interaction Networks",
                        "https://string-db.org/",
                        ["Protein interactions", "Network analysis", "Functional enrichment"],
                    ),
                ),
                (
                    "david".to_string(),
                    tool(
                        "DAVID",
                        "Functional Annotation Tool",
                        "https://david.ncifcrf.gov/",
                        ["Gene ontology", "Pathway analysis", "Functional classification"],
                    ),
                ),
                (
                    "gsea".to_string(),
                    tool(
                        "GSEA",
                        "Gene Set Enrichment Analysis",
                        "https://www.gsea-msigdb.org/gsea/index.jsp",
                        ["Enrichment analysis", "Pathway analysis", "Gene set analysis"],
                    ),
                ),
                (
                    "genemania".to_string(),
                    tool(
                        "GeneMANIA",
                        "Gene Function Prediction",
                        "https://genemania.org/",
                        ["Gene network", "Function prediction", "Pathway analysis"],
                    ),
                ),
            ],
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl ToolCatalog {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn tool_ids(&self) -> Vec<String> {
        self.tools.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn tools(&self) -> &[(String, ToolInfo)] {
        &self.tools
    }

    pub fn info(&self, tool: &str) -> Result<&ToolInfo, ToolCatalogError> {
        let key = tool.trim().to_ascii_lowercase();
        self.tools
            .iter()
            .find(|(id, _)| *id == key)
            .map(|(_, info)| info)
            .ok_or_else(|| ToolCatalogError::UnknownTool {
                tool: tool.to_string(),
                available: self.tool_ids(),
            })
    }

    /// Landing URL for `tool`.
    pub fn redirect(&self, tool: &str) -> Result<String, ToolCatalogError> {
        self.info(tool).map(|info| info.url.clone())
    }

    pub fn probe(&self, tool: &str) -> Result<ToolAvailability, ToolCatalogError> {
        let info = self.info(tool)?;
        Ok(probe_url(&info.url, &info.name, self.probe_timeout))
    }
}

/// GETs `url` up to three times. Any HTTP answer ends probing; a timeout
/// or refused connection on the last attempt is reported as 408 or 503.
pub fn probe_url(url: &str, name: &str, timeout: Duration) -> ToolAvailability {
    let client = match Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            return ToolAvailability {
                available: false,
                status_code: 500,
                error: Some(e.to_string()),
            };
        }
    };
    for attempt in 1..=PROBE_ATTEMPTS {
        match client
            .get(url)
            .header("Accept", "text/html,application/json")
            .send()
        {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(tool = name, status, attempt, "Tool probe answered");
                return ToolAvailability {
                    available: status == 200,
                    status_code: status,
                    error: None,
                };
            }
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!(tool = name, attempt, error = %e, "Tool probe failed");
                if attempt == PROBE_ATTEMPTS {
                    let (status_code, what) = if e.is_timeout() {
                        (408, "Timeout accessing")
                    } else {
                        (503, "Failed to connect to")
                    };
                    return ToolAvailability {
                        available: false,
                        status_code,
                        error: Some(format!("{what} {name} after {PROBE_ATTEMPTS} attempts")),
                    };
                }
            }
            Err(e) => {
                return ToolAvailability {
                    available: false,
                    status_code: 500,
                    error: Some(e.to_string()),
                };
            }
        }
    }
    ToolAvailability {
        available: false,
        status_code: 500,
        error: Some(format!("All {PROBE_ATTEMPTS} attempts failed for {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedServer;
    use std::net::TcpListener;

    #[test]
    fn redirect_knows_the_four_tools() {
        let catalog = ToolCatalog::default();
        assert_eq!(catalog.tool_ids(), vec!["string", "david", "gsea", "genemania"]);
        assert_eq!(catalog.redirect("STRING").expect("string"), "https://string-db.org/");
        assert_eq!(catalog.info("gsea").expect("gsea").features.len(), 3);
    }

    #[test]
    fn unknown_tool_lists_alternatives() {
        let err = ToolCatalog::default().redirect("blast").expect_err("unknown");
        let ToolCatalogError::UnknownTool { tool, available } = err;
        assert_eq!(tool, "blast");
        assert_eq!(available.len(), 4);
    }

    #[test]
    fn any_http_answer_ends_probing() {
        let server = ScriptedServer::start(vec![(503, "maintenance".to_string())]);
        let availability = probe_url(&server.url("/"), "Test", Duration::from_secs(5));
        assert!(!availability.available);
        assert_eq!(availability.status_code, 503);
        assert!(availability.error.is_none());
        assert_eq!(server.finish().len(), 1);

        let server = ScriptedServer::start(vec![(200, "ok".to_string())]);
        let availability = probe_url(&server.url("/"), "Test", Duration::from_secs(5));
        assert!(availability.available);
        server.finish();
    }

    #[test]
    fn refused_connection_reports_503_after_retries() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };
        let availability = probe_url(&format!("http://{addr}/"), "Gone", Duration::from_secs(2));
        assert!(!availability.available);
        assert_eq!(availability.status_code, 503);
        assert!(availability
            .error
            .as_deref()
            .is_some_and(|e| e.contains("after 3 attempts")));
    }
}
