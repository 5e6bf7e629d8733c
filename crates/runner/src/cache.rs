use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use extract::{StageOutput, TriageOutcome};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::OperationMode;

/// Stage outputs for one document, enough to re-merge without model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStudy {
    pub document: String,
    pub mode: OperationMode,
    pub triage: TriageOutcome,
    /// Empty when triage found nothing to extract.
    pub stages: Vec<StageOutput>,
    pub created_at: DateTime<Utc>,
}

/// On-disk cache of completed stage outputs, one JSON file per document and mode.
pub struct StageCache {
    dir: PathBuf,
    hits: usize,
}

impl StageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            hits: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Unreadable or stale entries count as misses.
    pub fn load(&mut self, fingerprint: &str, mode: OperationMode) -> Option<CachedStudy> {
        let path = self.entry_path(fingerprint, mode);
        let text = std::fs::read_to_string(&path).ok()?;

        match serde_json::from_str::<CachedStudy>(&text) {
            Ok(entry) if entry.mode == mode => {
                self.hits += 1;
                debug!(document = %entry.document, path = ?path, "Stage cache hit");
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(path = ?path, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn store(&self, fingerprint: &str, entry: &CachedStudy) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", self.dir))?;
        let path = self.entry_path(fingerprint, entry.mode);
        let json = serde_json::to_string_pretty(entry)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write cache entry: {:?}", path))?;
        Ok(path)
    }

    fn entry_path(&self, fingerprint: &str, mode: OperationMode) -> PathBuf {
        self.dir.join(format!("{}.json", cache_key(fingerprint, mode)))
    }
}

fn cache_key(fingerprint: &str, mode: OperationMode) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(mode.name().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{StageKind, StageStatus};

    fn entry(mode: OperationMode) -> CachedStudy {
        let mut results = StageOutput::empty(StageKind::Results);
        results.status = StageStatus::Validated;
        CachedStudy {
            document: "paper.pdf".to_string(),
            mode,
            triage: TriageOutcome::default(),
            stages: vec![results],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StageCache::new(dir.path());

        let stored = entry(OperationMode::Smart);
        cache.store("abc", &stored).unwrap();
        let loaded = cache.load("abc", OperationMode::Smart).unwrap();

        assert_eq!(loaded, stored);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_mode_and_fingerprint_separate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StageCache::new(dir.path());
        cache.store("abc", &entry(OperationMode::Smart)).unwrap();

        assert!(cache.load("abc", OperationMode::Full).is_none());
        assert!(cache.load("other", OperationMode::Smart).is_none());
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StageCache::new(dir.path());
        let path = cache.store("abc", &entry(OperationMode::Smart)).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        assert!(cache.load("abc", OperationMode::Smart).is_none());
    }
}
