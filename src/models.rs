//! Core data models used throughout catalog-sync.
//!
//! These types represent the loosely specified input records, the accepted
//! catalog matches, and the per-run report that flow through the
//! resolution and reconciliation pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An unresolved input record awaiting catalog resolution.
///
/// Immutable once created; `source_metadata` is carried through untouched
/// for the collaborator that produced the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub source_metadata: Value,
}

impl CandidateRecord {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            source_metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.source_metadata = metadata;
        self
    }

    /// Memoization key: `lower(strip(artist))|lower(strip(title))`.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}",
            self.artist.trim().to_lowercase(),
            self.title.trim().to_lowercase()
        )
    }
}

/// The accepted best catalog item for a candidate, with similarity scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMatch {
    pub candidate: CandidateRecord,
    /// Catalog URI of the matched item (used for membership and writes).
    pub external_id: String,
    pub artist_score: f64,
    pub title_score: f64,
    pub matched_artist: String,
    pub matched_title: String,
}

impl ResolvedMatch {
    pub fn average_score(&self) -> f64 {
        (self.artist_score + self.title_score) / 2.0
    }
}

/// Counts produced by one reconciliation run.
///
/// `resolved = added + already_present` and `total = resolved + unresolved`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub total: usize,
    pub resolved: usize,
    pub added: usize,
    pub already_present: usize,
    pub unresolved: usize,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.resolved == self.added + self.already_present
            && self.total == self.resolved + self.unresolved
    }
}
