//! Rule-set cache using moka
//!
//! Rule files are read once per canonical path and shared as `Arc<RuleSet>`
//! across concurrent runs.

use crate::error::RuleSetResult;
use crate::ruleset::RuleSet;
use moka::future::Cache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cache of compiled rule sets keyed by canonical file path
#[derive(Debug, Clone)]
pub struct RuleSetCache {
    inner: Cache<PathBuf, Arc<RuleSet>>,
}

impl RuleSetCache {
    /// Create new cache with max capacity
    #[inline]
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            inner: Cache::new(max_capacity),
        }
    }

    /// Get the compiled rule set for a file, loading it on first use
    pub async fn get_or_load(&self, path: impl AsRef<Path>) -> RuleSetResult<Arc<RuleSet>> {
        let key = cache_key(path.as_ref()).await;

        if let Some(cached) = self.inner.get(&key).await {
            tracing::trace!(path = %key.display(), "rule set cache hit");
            return Ok(cached);
        }

        let rules = Arc::new(RuleSet::load(&key).await?);
        self.inner.insert(key, Arc::clone(&rules)).await;
        Ok(rules)
    }
}

impl Default for RuleSetCache {
    /// Create cache with default capacity (64 rule files)
    fn default() -> Self {
        Self::new(64)
    }
}

async fn cache_key(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuleSetError;
    use crate::section::Section;

    const RULES: &str = "sections:\n  M2.7:\n    required: [ClinicalSummary]\n";

    #[tokio::test]
    async fn loads_once_and_shares() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, RULES).await.unwrap();

        let cache = RuleSetCache::default();
        let first = cache.get_or_load(&path).await.unwrap();

        // Same Arc even after the file changes on disk
        tokio::fs::write(&path, "sections: {}\n").await.unwrap();
        let second = cache.get_or_load(&path).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.group(Section::ClinicalSummary).is_some());
    }

    #[tokio::test]
    async fn relative_and_canonical_paths_share_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, RULES).await.unwrap();

        let cache = RuleSetCache::new(4);
        let direct = cache.get_or_load(&path).await.unwrap();
        let roundabout = cache.get_or_load(dir.path().join("nested/../rules.yaml")).await.unwrap();
        assert!(Arc::ptr_eq(&direct, &roundabout));
    }

    #[tokio::test]
    async fn load_errors_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        tokio::fs::write(&path, "sections:\n  M0:\n    required: []\n").await.unwrap();

        let cache = RuleSetCache::default();
        let err = cache.get_or_load(&path).await.unwrap_err();
        assert!(matches!(err, RuleSetError::UnknownSection(_)));

        tokio::fs::write(&path, RULES).await.unwrap();
        let fixed = cache.get_or_load(&path).await.unwrap();
        assert!(fixed.group(Section::ClinicalSummary).is_some());
    }
}
