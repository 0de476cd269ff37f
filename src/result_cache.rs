//! File-per-key JSON cache for external tool results.
//!
//! Entries live at `<data_dir>/tool_results/<tool>/<key>.json` and expire by
//! modification time. There is no locking: concurrent writers race and the
//! last rename wins.

use crate::{config::CacheConfig, error::CacheError, files::write_atomic};
use regex::Regex;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tracing::debug;

const KEY_GENE_COUNT: usize = 5;
const UNSAFE_FILE_CHARS: &str = r"[^A-Za-z0-9._-]+";

#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
    ttl: Duration,
    unsafe_chars: Regex,
}

fn io_error(path: &Path, e: impl ToString) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

impl ResultCache {
    pub fn new(data_dir: &Path, ttl: Duration) -> Result<Self, CacheError> {
        let root = data_dir.join("tool_results");
        let unsafe_chars = Regex::new(UNSAFE_FILE_CHARS).map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            ttl,
            unsafe_chars,
        })
    }

    /// `None` when caching is switched off.
    pub fn from_config(data_dir: &Path, config: &CacheConfig) -> Result<Option<Self>, CacheError> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(data_dir, Duration::from_secs(config.ttl_secs)).map(Some)
    }

    fn sanitize(&self, raw: &str) -> String {
        self.unsafe_chars.replace_all(raw, "_").into_owned()
    }

    /// First five genes of the sorted list, then the list length.
    pub fn key_file_name(&self, genes: &[String]) -> String {
        let mut sorted: Vec<&str> = genes.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let head = sorted
            .iter()
            .take(KEY_GENE_COUNT)
            .copied()
            .collect::<Vec<_>>()
            .join("-");
        self.sanitize(&format!("{head}_{}_genes.json", genes.len()))
    }

    pub fn entry_path(&self, tool: &str, genes: &[String]) -> PathBuf {
        self.root
            .join(self.sanitize(tool))
            .join(self.key_file_name(genes))
    }

    /// Cached value if present and younger than the TTL.
    pub fn get<T: DeserializeOwned>(
        &self,
        tool: &str,
        genes: &[String],
    ) -> Result<Option<T>, CacheError> {
        let path = self.entry_path(tool, genes);
        let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= self.ttl {
            debug!(path = %path.display(), age_secs = age.as_secs(), "Cache entry expired");
            return Ok(None);
        }
        let text = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let value = serde_json::from_str(&text).map_err(|e| CacheError::Serde {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), "Cache hit");
        Ok(Some(value))
    }

    pub fn put<T: Serialize>(
        &self,
        tool: &str,
        genes: &[String],
        value: &T,
    ) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(tool, genes);
        let text = serde_json::to_string_pretty(value).map_err(|e| CacheError::Serde {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, text.as_bytes()).map_err(|e| io_error(&path, e))?;
        debug!(path = %path.display(), "Cache entry written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn genes(list: &[&str]) -> Vec<String> {
        list.iter().map(|g| g.to_string()).collect()
    }

    #[test]
    fn key_uses_sorted_head_and_count() {
        let td = tempdir().expect("tempdir");
        let cache = ResultCache::new(td.path(), Duration::from_secs(60)).expect("cache");
        let name = cache.key_file_name(&genes(&["TP53", "BRCA1", "MYC", "EGFR", "AKT1", "ZNF1", "ACTB"]));
        assert_eq!(name, "ACTB-AKT1-BRCA1-EGFR-MYC_7_genes.json");
        let odd = cache.key_file_name(&genes(&["HLA-A/B", "C1 orf"]));
        assert_eq!(odd, "C1_orf-HLA-A_B_2_genes.json");
    }

    #[test]
    fn put_then_get_within_ttl() {
        let td = tempdir().expect("tempdir");
        let cache = ResultCache::new(td.path(), Duration::from_secs(60)).expect("cache");
        let list = genes(&["B", "A"]);
        let path = cache
            .put("enrichr_KEGG", &list, &vec![1, 2, 3])
            .expect("put");
        assert!(path.starts_with(td.path().join("tool_results").join("enrichr_KEGG")));
        let back: Option<Vec<i32>> = cache.get("enrichr_KEGG", &list).expect("get");
        assert_eq!(back, Some(vec![1, 2, 3]));
        let other: Option<Vec<i32>> = cache.get("enrichr_GO", &list).expect("get other tool");
        assert!(other.is_none());
    }

    #[test]
    fn expired_entries_are_ignored() {
        let td = tempdir().expect("tempdir");
        let cache = ResultCache::new(td.path(), Duration::ZERO).expect("cache");
        let list = genes(&["A"]);
        cache.put("tool", &list, &"value").expect("put");
        let back: Option<String> = cache.get("tool", &list).expect("get");
        assert!(back.is_none());
    }

    #[test]
    fn corrupt_entry_is_a_serde_error() {
        let td = tempdir().expect("tempdir");
        let cache = ResultCache::new(td.path(), Duration::from_secs(60)).expect("cache");
        let list = genes(&["A"]);
        let path = cache.entry_path("tool", &list);
        write_atomic(&path, b"{not json").expect("seed corrupt entry");
        let err = cache.get::<Vec<i32>>("tool", &list).expect_err("corrupt");
        assert!(matches!(err, CacheError::Serde { .. }));
    }

    #[test]
    fn disabled_config_yields_no_cache() {
        let td = tempdir().expect("tempdir");
        let config = CacheConfig {
            enabled: false,
            ttl_secs: 10,
        };
        assert!(ResultCache::from_config(td.path(), &config)
            .expect("config")
            .is_none());
    }
}
