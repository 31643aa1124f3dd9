use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::cache::TtlCache;
use crate::candidates::load_candidates;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::http_catalog::HttpCatalog;
use crate::matcher::MatchScorer;
use crate::memo::MatchMemo;
use crate::models::{CandidateRecord, ReconciliationReport};
use crate::progress::ProgressMode;
use crate::reconcile::{write_audit_csv, CatalogReconciler, ReconcileError};

/// Build the HTTP catalog client, reading the bearer token from the
/// environment variable named by `catalog.token_env`.
pub fn build_catalog(config: &Config) -> Result<HttpCatalog> {
    let token = match std::env::var(&config.catalog.token_env) {
        Ok(t) if !t.trim().is_empty() => t,
        _ => bail!(
            "Catalog token not set. Export {} with a bearer token.",
            config.catalog.token_env
        ),
    };
    let cache = TtlCache::open(&config.cache.dir)?;
    Ok(HttpCatalog::new(
        &config.catalog.base_url,
        token,
        Duration::from_secs(config.catalog.timeout_secs),
    )?
    .with_cache(cache, config.cache.max_age()))
}

fn load_memo(config: &Config) -> Result<Arc<MatchMemo>> {
    Ok(Arc::new(match &config.reconcile.memo_path {
        Some(path) => MatchMemo::load(path)?,
        None => MatchMemo::new(),
    }))
}

fn flush_memo(config: &Config, memo: &MatchMemo) -> Result<()> {
    if let Some(path) = &config.reconcile.memo_path {
        memo.flush(path)?;
    }
    Ok(())
}

fn build_scorer(config: &Config, memo: Arc<MatchMemo>) -> MatchScorer {
    MatchScorer::new(memo, config.retry.policy()).with_search_limit(config.catalog.search_limit)
}

/// Resolve a candidates file against a collection and add what is missing.
pub async fn run_sync(
    config: &Config,
    candidates_path: &Path,
    collection: &str,
    audit_override: Option<PathBuf>,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<()> {
    let candidates = load_candidates(candidates_path)?;
    let catalog: Arc<dyn Catalog> = Arc::new(build_catalog(config)?);
    let memo = load_memo(config)?;
    let scorer = Arc::new(build_scorer(config, Arc::clone(&memo)));

    let reconciler = CatalogReconciler::new(catalog, scorer)
        .with_retry_policy(config.retry.policy())
        .with_batch_config(config.batch.batch_config())
        .with_write_chunk_size(config.reconcile.write_chunk_size)
        .with_page_size(config.catalog.page_size)
        .with_dry_run(dry_run)
        .with_progress(Arc::from(progress.reporter()));

    let result = reconciler.reconcile(collection, &candidates).await;
    flush_memo(config, &memo)?;

    let (outcome, write_error) = match result {
        Ok(outcome) => (outcome, None),
        Err(ReconcileError::Write { outcome, source }) => (*outcome, Some(source)),
        Err(e) => return Err(e.into()),
    };

    let audit_path = audit_override.or_else(|| config.reconcile.audit_path.clone());
    if let Some(path) = &audit_path {
        write_audit_csv(path, &outcome.audit_rows)?;
    }

    // After a failed write only the chunks that landed count as added.
    let added = match &write_error {
        Some(_) => format!(
            "{} (not written: {})",
            outcome.added_ids.len(),
            outcome.failed_ids.len()
        ),
        None => outcome.report.added.to_string(),
    };
    print_report(collection, &outcome.report, &added, dry_run);
    if let Some(path) = &audit_path {
        println!("  audit: {}", path.display());
    }

    if let Some(source) = write_error {
        bail!("write to collection {} failed: {}", collection, source);
    }
    println!("ok");
    Ok(())
}

fn print_report(collection: &str, report: &ReconciliationReport, added: &str, dry_run: bool) {
    if dry_run {
        println!("sync {} (dry-run)", collection);
    } else {
        println!("sync {}", collection);
    }
    println!("  total: {}", report.total);
    println!("  resolved: {}", report.resolved);
    println!("  added: {}", added);
    println!("  already present: {}", report.already_present);
    println!("  unresolved: {}", report.unresolved);
}

/// Resolve a single artist/title pair and print the accepted match.
pub async fn run_match(config: &Config, artist: &str, title: &str) -> Result<()> {
    let catalog = build_catalog(config)?;
    let memo = load_memo(config)?;
    let scorer = build_scorer(config, Arc::clone(&memo));

    let candidate = CandidateRecord::new(artist, title);
    match scorer.resolve(&candidate, &catalog).await? {
        Some(m) => {
            println!("{} - {}", m.matched_artist, m.matched_title);
            println!("  id: {}", m.external_id);
            println!("  artist score: {}", m.artist_score);
            println!("  title score: {}", m.title_score);
        }
        None => println!("no match"),
    }
    flush_memo(config, &memo)?;
    Ok(())
}

pub fn run_cache_clear_expired(config: &Config, max_age_secs: Option<u64>) -> Result<()> {
    let cache = TtlCache::open(&config.cache.dir)?;
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.cache.max_age());
    let removed = cache.clear_expired(max_age)?;
    println!("cache clear-expired");
    println!("  removed: {}", removed);
    Ok(())
}

pub fn run_cache_clear(config: &Config) -> Result<()> {
    let cache = TtlCache::open(&config.cache.dir)?;
    let removed = cache.clear()?;
    println!("cache clear");
    println!("  removed: {}", removed);
    Ok(())
}
