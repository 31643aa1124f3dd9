//! Per-run memo of accepted matches, keyed by candidate signature.
//!
//! Constructed once per run and passed by reference to the scorer. It lives
//! in memory only; [`MatchMemo::load`] and [`MatchMemo::flush`] persist it
//! explicitly (the CLI does so when `reconcile.memo_path` is set).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::debug;

use crate::models::ResolvedMatch;

#[derive(Debug, Default)]
pub struct MatchMemo {
    entries: RwLock<HashMap<String, ResolvedMatch>>,
}

impl MatchMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &str) -> Option<ResolvedMatch> {
        self.entries.read().get(signature).cloned()
    }

    pub fn insert(&self, signature: String, resolved: ResolvedMatch) {
        self.entries.write().insert(signature, resolved);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Load a memo previously written by [`MatchMemo::flush`]. A missing
    /// file yields an empty memo.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read match memo: {}", path.display()))?;
        let entries: HashMap<String, ResolvedMatch> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse match memo: {}", path.display()))?;
        debug!(entries = entries.len(), path = %path.display(), "loaded match memo");
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Write the memo as a JSON object sorted by signature.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let sorted: BTreeMap<String, ResolvedMatch> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(path, body)
            .with_context(|| format!("Failed to write match memo: {}", path.display()))?;
        debug!(entries = sorted.len(), path = %path.display(), "flushed match memo");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CandidateRecord;
    use tempfile::TempDir;

    fn resolved(artist: &str, title: &str, uri: &str) -> ResolvedMatch {
        ResolvedMatch {
            candidate: CandidateRecord::new(artist, title),
            external_id: uri.to_string(),
            artist_score: 100.0,
            title_score: 100.0,
            matched_artist: artist.to_string(),
            matched_title: title.to_string(),
        }
    }

    #[test]
    fn insert_and_get() {
        let memo = MatchMemo::new();
        assert!(memo.is_empty());
        let m = resolved("Bladee", "Be Nice 2 Me", "cat:track:1");
        memo.insert(m.candidate.signature(), m.clone());
        assert_eq!(memo.get("bladee|be nice 2 me"), Some(m));
        assert_eq!(memo.len(), 1);
    }

    #[test]
    fn flush_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("memo.json");
        let memo = MatchMemo::new();
        let m = resolved("A", "B", "cat:track:2");
        memo.insert(m.candidate.signature(), m.clone());
        memo.flush(&path).unwrap();

        let loaded = MatchMemo::load(&path).unwrap();
        assert_eq!(loaded.get("a|b"), Some(m));
    }

    #[test]
    fn load_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let memo = MatchMemo::load(&tmp.path().join("absent.json")).unwrap();
        assert!(memo.is_empty());
    }

    #[test]
    fn load_corrupt_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("memo.json");
        std::fs::write(&path, "[not a memo").unwrap();
        assert!(MatchMemo::load(&path).is_err());
    }
}
