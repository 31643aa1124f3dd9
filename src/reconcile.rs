//! Reconcile resolved candidates against a target collection.
//!
//! A run has four phases:
//!
//! 1. **Snapshot**: read the collection's current member URIs once, page by
//!    page, each page through [`call_with_retry`].
//! 2. **Resolve**: drive [`MatchScorer::resolve`] over every candidate with a
//!    [`BatchScheduler`]. Per-candidate failures become unresolved entries.
//!    An authentication failure stops scheduling and aborts the run.
//! 3. **Diff**: split resolved URIs into already present and new. A URI that
//!    two candidates resolve to is new at most once.
//! 4. **Write**: add new URIs in chunks of at most [`MAX_WRITE_CHUNK`], each
//!    chunk retried. A chunk that still fails aborts the run with
//!    [`ReconcileError::Write`], which carries the partial outcome. Rejected
//!    credentials abort with [`ReconcileError::Authentication`] instead.
//!
//! The snapshot is not re-read before writing. Another writer that adds the
//! same item between phases 1 and 4 produces a duplicate entry.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{error, info};

use crate::catalog::{Catalog, MAX_WRITE_CHUNK};
use crate::error::RemoteError;
use crate::matcher::MatchScorer;
use crate::models::{CandidateRecord, ReconciliationReport, ResolvedMatch};
use crate::progress::{NoProgress, ReconcileProgressEvent, ReconcileProgressReporter};
use crate::retry::{call_with_retry, RetryPolicy, Sleeper, TokioSleeper};
use crate::scheduler::{BatchConfig, BatchScheduler};

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The catalog rejected our credentials. No report is produced.
    #[error("catalog authentication failed: {0}")]
    Authentication(#[source] RemoteError),

    /// Membership could not be read, so nothing was resolved or written.
    #[error("failed to read collection membership: {0}")]
    Snapshot(#[source] RemoteError),

    /// A write chunk failed after retries. Earlier chunks were written.
    #[error("write to collection failed after {} items: {source}", .outcome.added_ids.len())]
    Write {
        outcome: Box<ReconcileOutcome>,
        #[source]
        source: RemoteError,
    },
}

/// One line of the audit CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRow {
    #[serde(rename = "Artist")]
    pub artist: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Found", serialize_with = "found_word")]
    pub found: bool,
    #[serde(rename = "External-ID")]
    pub external_id: String,
    #[serde(rename = "Corrections")]
    pub corrections: String,
}

fn found_word<S: Serializer>(found: &bool, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(if *found { "True" } else { "False" })
}

impl AuditRow {
    /// `corrections` starts blank; it is filled in by hand during review.
    fn resolved(candidate: &CandidateRecord, m: &ResolvedMatch) -> Self {
        Self {
            artist: candidate.artist.clone(),
            title: candidate.title.clone(),
            found: true,
            external_id: m.external_id.clone(),
            corrections: String::new(),
        }
    }

    fn unresolved(candidate: &CandidateRecord) -> Self {
        Self {
            artist: candidate.artist.clone(),
            title: candidate.title.clone(),
            found: false,
            external_id: String::new(),
            corrections: String::new(),
        }
    }
}

/// Write the audit rows with header `Artist,Title,Found,External-ID,Corrections`.
pub fn write_audit_csv(path: &Path, rows: &[AuditRow]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create audit file: {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(std::io::BufWriter::new(file));
    writer.write_record(["Artist", "Title", "Found", "External-ID", "Corrections"])?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Everything a run produced.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// URIs written to the collection (in a dry run: the URIs that would be).
    pub added_ids: Vec<String>,
    /// New URIs that were not written because a write chunk failed.
    pub failed_ids: Vec<String>,
    pub unresolved: Vec<CandidateRecord>,
    /// Accepted match per candidate signature.
    pub resolution_map: BTreeMap<String, ResolvedMatch>,
    /// `added` counts every new URI, written or not; see `failed_ids`.
    pub report: ReconciliationReport,
    /// One row per candidate, in input order.
    pub audit_rows: Vec<AuditRow>,
    pub dry_run: bool,
}

pub struct CatalogReconciler {
    catalog: Arc<dyn Catalog>,
    scorer: Arc<MatchScorer>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    batch: BatchConfig,
    write_chunk_size: usize,
    page_size: usize,
    dry_run: bool,
    progress: Arc<dyn ReconcileProgressReporter>,
}

impl CatalogReconciler {
    pub fn new(catalog: Arc<dyn Catalog>, scorer: Arc<MatchScorer>) -> Self {
        Self {
            catalog,
            scorer,
            policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            batch: BatchConfig::default(),
            write_chunk_size: MAX_WRITE_CHUNK,
            page_size: 100,
            dry_run: false,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sleeper for retry backoff and inter-batch delays.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Clamped to `1..=MAX_WRITE_CHUNK`.
    pub fn with_write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size.clamp(1, MAX_WRITE_CHUNK);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ReconcileProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Read every member URI of `collection_id`.
    pub async fn snapshot_membership(
        &self,
        collection_id: &str,
    ) -> Result<HashSet<String>, RemoteError> {
        let mut members = HashSet::new();
        let mut offset = 0;
        loop {
            let label = format!("collection page {}@{}", collection_id, offset);
            let page = call_with_retry(&self.policy, self.sleeper.as_ref(), &label, || {
                self.catalog
                    .collection_page(collection_id, offset, self.page_size)
            })
            .await?;
            members.extend(page.item_uris);
            match page.next_offset {
                Some(next) if next > offset => offset = next,
                _ => break,
            }
        }
        Ok(members)
    }

    pub async fn reconcile(
        &self,
        collection_id: &str,
        candidates: &[CandidateRecord],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.progress.report(ReconcileProgressEvent::Snapshot {
            collection: collection_id.to_string(),
        });
        let existing = self
            .snapshot_membership(collection_id)
            .await
            .map_err(|e| {
                if e.is_auth_failure() {
                    ReconcileError::Authentication(e)
                } else {
                    ReconcileError::Snapshot(e)
                }
            })?;
        info!(collection_id, members = existing.len(), "collection snapshot taken");

        let resolved = self.resolve_all(candidates).await?;

        let mut outcome = ReconcileOutcome {
            dry_run: self.dry_run,
            ..Default::default()
        };
        let mut pending: HashSet<&str> = HashSet::new();
        let mut to_add: Vec<String> = Vec::new();
        let mut already_present = 0;

        for (candidate, resolved) in candidates.iter().zip(&resolved) {
            match resolved {
                Some(m) => {
                    let uri = m.external_id.as_str();
                    if existing.contains(uri) || !pending.insert(uri) {
                        already_present += 1;
                    } else {
                        to_add.push(uri.to_string());
                    }
                    outcome.audit_rows.push(AuditRow::resolved(candidate, m));
                    outcome
                        .resolution_map
                        .insert(candidate.signature(), m.clone());
                }
                None => {
                    outcome.audit_rows.push(AuditRow::unresolved(candidate));
                    outcome.unresolved.push(candidate.clone());
                }
            }
        }

        outcome.report = ReconciliationReport {
            total: candidates.len(),
            resolved: to_add.len() + already_present,
            added: to_add.len(),
            already_present,
            unresolved: outcome.unresolved.len(),
        };

        if self.dry_run {
            info!(would_add = to_add.len(), "dry run, skipping writes");
            outcome.added_ids = to_add;
        } else {
            self.write_new(collection_id, to_add, &mut outcome).await?;
        }

        info!(
            total = outcome.report.total,
            resolved = outcome.report.resolved,
            added = outcome.report.added,
            already_present = outcome.report.already_present,
            unresolved = outcome.report.unresolved,
            "reconciliation complete"
        );
        Ok(outcome)
    }

    /// Resolve every candidate; the result is aligned with `candidates`.
    async fn resolve_all(
        &self,
        candidates: &[CandidateRecord],
    ) -> Result<Vec<Option<ResolvedMatch>>, ReconcileError> {
        let scheduler = BatchScheduler::with_sleeper(self.batch.clone(), Arc::clone(&self.sleeper));
        let stop = scheduler.stop_handle();
        let auth_failure: Arc<Mutex<Option<RemoteError>>> = Arc::new(Mutex::new(None));

        let items: Vec<(usize, CandidateRecord)> =
            candidates.iter().cloned().enumerate().collect();
        let scorer = Arc::clone(&self.scorer);
        let catalog = Arc::clone(&self.catalog);
        let slot = Arc::clone(&auth_failure);

        let results = scheduler
            .process_with_progress(
                items,
                move |(_, candidate)| {
                    let (scorer, catalog) = (Arc::clone(&scorer), Arc::clone(&catalog));
                    let (slot, stop) = (Arc::clone(&slot), stop.clone());
                    async move {
                        match scorer.resolve(&candidate, catalog.as_ref()).await {
                            Ok(m) => Ok(m),
                            Err(e) if e.is_auth_failure() => {
                                stop.stop();
                                let message = e.to_string();
                                slot.lock().get_or_insert(e);
                                anyhow::bail!("authentication failure: {}", message)
                            }
                            Err(e) => Err(anyhow::Error::new(e).context(format!(
                                "resolving {} - {}",
                                candidate.artist, candidate.title
                            ))),
                        }
                    }
                },
                |done, total| {
                    self.progress.report(ReconcileProgressEvent::Resolving {
                        n: done as u64,
                        total: total as u64,
                    })
                },
            )
            .await;

        if let Some(e) = auth_failure.lock().take() {
            error!(error = %e, "authentication failed during resolution, aborting run");
            return Err(ReconcileError::Authentication(e));
        }

        let mut aligned: Vec<Option<ResolvedMatch>> = vec![None; candidates.len()];
        for ((idx, _), result) in results {
            aligned[idx] = result.flatten();
        }
        Ok(aligned)
    }

    async fn write_new(
        &self,
        collection_id: &str,
        to_add: Vec<String>,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), ReconcileError> {
        let total = to_add.len();
        let chunks: Vec<&[String]> = to_add.chunks(self.write_chunk_size).collect();
        for (index, chunk) in chunks.iter().enumerate() {
            let label = format!("add {} items to {}", chunk.len(), collection_id);
            let written = call_with_retry(&self.policy, self.sleeper.as_ref(), &label, || {
                self.catalog.add_items(collection_id, chunk)
            })
            .await;

            match written {
                Ok(()) => {
                    outcome.added_ids.extend(chunk.iter().cloned());
                    self.progress.report(ReconcileProgressEvent::Writing {
                        n: outcome.added_ids.len() as u64,
                        total: total as u64,
                    });
                }
                Err(source) if source.is_auth_failure() => {
                    error!(
                        collection_id,
                        written = outcome.added_ids.len(),
                        error = %source,
                        "credentials rejected mid-write, aborting run"
                    );
                    return Err(ReconcileError::Authentication(source));
                }
                Err(source) => {
                    outcome.failed_ids = chunks[index..].concat();
                    error!(
                        collection_id,
                        written = outcome.added_ids.len(),
                        not_written = outcome.failed_ids.len(),
                        error = %source,
                        "write chunk failed, collection is partially updated"
                    );
                    return Err(ReconcileError::Write {
                        outcome: Box::new(std::mem::take(outcome)),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}
