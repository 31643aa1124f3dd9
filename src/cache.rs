//! Time-bounded file cache for idempotent read calls.
//!
//! One JSON file per key under the cache directory:
//!
//! ```json
//! {"timestamp": 1718000000.25, "data": { ... }}
//! ```
//!
//! Entries are never mutated after they are written. A read treats an entry
//! older than `max_age` as a miss; [`TtlCache::clear_expired`] deletes such
//! entries (and any file that no longer parses). Writes go to a temporary file
//! that is renamed into place, so concurrent processes sharing the directory
//! see last-writer-wins on a key collision, never a torn file.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::RemoteError;

/// Characters replaced by `_` to make a key filesystem-safe.
const UNSAFE_KEY_CHARS: &[char] = &[
    '/', ':', '?', '&', '=', '.', ' ', '"', '\\', '*', '<', '>', '|',
];

/// Keys longer than this are truncated and suffixed with a digest.
const MAX_KEY_LEN: usize = 200;

/// Whether a call may be served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Idempotent read: cacheable.
    Read,
    /// Non-idempotent write: always bypasses the cache.
    Write,
}

/// A cached payload together with the time it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    /// Epoch seconds.
    pub written_at: f64,
}

impl CacheEntry {
    pub fn age(&self, now: f64) -> Duration {
        Duration::try_from_secs_f64((now - self.written_at).max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn is_expired(&self, now: f64, max_age: Duration) -> bool {
        now - self.written_at > max_age.as_secs_f64()
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    timestamp: f64,
    data: Value,
}

/// Build the cache key for a read call.
///
/// Strips the URL scheme and any trailing slash, appends the parameters
/// sorted by key as `k=v` pairs joined with `&`, then replaces
/// filesystem-hostile characters with `_`.
pub fn cache_key(url: &str, params: &[(&str, &str)]) -> String {
    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let base = without_scheme.trim_end_matches('/');

    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(b.1)));
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let raw = if query.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, query)
    };

    let safe: String = raw
        .chars()
        .map(|c| if UNSAFE_KEY_CHARS.contains(&c) { '_' } else { c })
        .collect();

    if safe.len() <= MAX_KEY_LEN {
        return safe;
    }

    let mut cut = MAX_KEY_LEN - 65;
    while !safe.is_char_boundary(cut) {
        cut -= 1;
    }
    let digest = Sha256::digest(raw.as_bytes());
    format!("{}_{:x}", &safe[..cut], digest)
}

pub(crate) fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// File-backed TTL cache.
#[derive(Debug, Clone)]
pub struct TtlCache {
    dir: PathBuf,
}

impl TtlCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheFile>(&bytes) {
            Ok(file) => Some(CacheEntry {
                key: key.to_string(),
                payload: file.data,
                written_at: file.timestamp,
            }),
            Err(e) => {
                warn!(key, error = %e, "unreadable cache entry, treating as miss");
                None
            }
        }
    }

    /// Return the full entry if present and no older than `max_age`.
    pub fn get_entry(&self, key: &str, max_age: Duration) -> Option<CacheEntry> {
        let entry = self.read_entry(key)?;
        if entry.is_expired(now_epoch_secs(), max_age) {
            debug!(key, "cache entry expired");
            return None;
        }
        Some(entry)
    }

    /// Return the payload for `key`, or `None` on a miss (absent or expired).
    pub fn get(&self, key: &str, max_age: Duration) -> Option<Value> {
        self.get_entry(key, max_age).map(|e| e.payload)
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.put_at(key, value, now_epoch_secs())
    }

    pub(crate) fn put_at(&self, key: &str, value: &Value, timestamp: f64) -> Result<()> {
        let file = CacheFile {
            timestamp,
            data: value.clone(),
        };
        let body = serde_json::to_vec(&file)?;
        let target = self.path_for(key);
        // Each writer gets its own uniquely named temp file in the same
        // directory, so concurrent puts of one key never share a file.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).with_context(|| {
            format!("Failed to create cache temp file in {}", self.dir.display())
        })?;
        tmp.write_all(&body)
            .with_context(|| format!("Failed to write cache entry: {}", tmp.path().display()))?;
        tmp.persist(&target)
            .with_context(|| format!("Failed to commit cache entry: {}", target.display()))?;
        Ok(())
    }

    /// Serve a read from the cache, or call `fetch` and store the result.
    ///
    /// Returns `(value, from_cache)`. `force_refresh` and [`CallKind::Write`]
    /// bypass the cache entirely (writes are not stored either). A failure to
    /// persist a fetched value is logged and does not fail the call.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        kind: CallKind,
        url: &str,
        params: &[(&str, &str)],
        max_age: Duration,
        force_refresh: bool,
        fetch: F,
    ) -> Result<(Value, bool), RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, RemoteError>>,
    {
        if kind == CallKind::Write {
            return fetch().await.map(|v| (v, false));
        }
        let key = cache_key(url, params);
        if !force_refresh {
            if let Some(value) = self.get(&key, max_age) {
                debug!(key = %key, "cache hit");
                return Ok((value, true));
            }
        }
        debug!(key = %key, force_refresh, "cache miss");
        let value = fetch().await?;
        self.store_quietly(&key, &value);
        Ok((value, false))
    }

    /// Blocking form of [`TtlCache::get_or_fetch`].
    pub fn get_or_fetch_blocking<F>(
        &self,
        kind: CallKind,
        url: &str,
        params: &[(&str, &str)],
        max_age: Duration,
        force_refresh: bool,
        fetch: F,
    ) -> Result<(Value, bool), RemoteError>
    where
        F: FnOnce() -> Result<Value, RemoteError>,
    {
        if kind == CallKind::Write {
            return fetch().map(|v| (v, false));
        }
        let key = cache_key(url, params);
        if !force_refresh {
            if let Some(value) = self.get(&key, max_age) {
                return Ok((value, true));
            }
        }
        let value = fetch()?;
        self.store_quietly(&key, &value);
        Ok((value, false))
    }

    fn store_quietly(&self, key: &str, value: &Value) {
        if let Err(e) = self.put(key, value) {
            warn!(key, error = %e, "failed to store cache entry");
        }
    }

    /// Delete entries older than `max_age` and any that fail to parse.
    ///
    /// Returns the number of files removed.
    pub fn clear_expired(&self, max_age: Duration) -> Result<usize> {
        let now = now_epoch_secs();
        let removed = self.sweep(|path| {
            let parsed = std::fs::read(path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<CacheFile>(&bytes).ok());
            match parsed {
                Some(file) => now - file.timestamp > max_age.as_secs_f64(),
                None => true,
            }
        })?;
        info!(removed, dir = %self.dir.display(), "cleared expired cache entries");
        Ok(removed)
    }

    /// Delete every entry. Returns the number of files removed.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.sweep(|_| true)?;
        info!(removed, dir = %self.dir.display(), "cleared cache");
        Ok(removed)
    }

    fn sweep(&self, should_remove: impl Fn(&Path) -> bool) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read cache directory: {}", self.dir.display()))?;
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if should_remove(&path) {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    // Another process may have swept it first.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to remove cache entry: {}", path.display())
                        })
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn key_is_canonical_and_safe() {
        let key = cache_key(
            "https://api.example.com/v1/search/",
            &[("type", "track"), ("q", "a b"), ("limit", "5")],
        );
        assert_eq!(key, "api_example_com_v1_search_limit_5_q_a_b_type_track");
    }

    #[test]
    fn key_ignores_param_order_and_scheme() {
        let a = cache_key("https://x.io/a", &[("b", "2"), ("a", "1")]);
        let b = cache_key("http://x.io/a/", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
    }

    #[test]
    fn key_without_params() {
        assert_eq!(cache_key("https://x.io/a/b/", &[]), "x_io_a_b");
    }

    #[test]
    fn long_keys_are_bounded_and_distinct() {
        let long_a = "a".repeat(500);
        let long_b = format!("{}b", "a".repeat(499));
        let a = cache_key("https://x.io/search", &[("q", long_a.as_str())]);
        let b = cache_key("https://x.io/search", &[("q", long_b.as_str())]);
        assert!(a.len() <= MAX_KEY_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn put_then_get() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache.put("k", &json!({"x": 1})).unwrap();
        assert_eq!(cache.get("k", DAY), Some(json!({"x": 1})));
        assert_eq!(cache.get("missing", DAY), None);
    }

    #[test]
    fn file_layout_has_timestamp_and_data() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache.put("k", &json!([1, 2])).unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("k.json")).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert!(v["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(v["data"], json!([1, 2]));
    }

    #[test]
    fn put_overwrites() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache.put("k", &json!({"a": 1})).unwrap();
        cache.put("k", &json!({"b": 2})).unwrap();
        assert_eq!(cache.get("k", DAY), Some(json!({"b": 2})));
    }

    #[test]
    fn concurrent_puts_of_one_key_all_commit() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        std::thread::scope(|s| {
            for worker in 0..8 {
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..20 {
                        cache
                            .put("same-key", &json!({"worker": worker, "round": round}))
                            .unwrap();
                    }
                });
            }
        });

        let value = cache.get("same-key", DAY).unwrap();
        assert_eq!(value["round"], 19);
        let files: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("same-key.json")]);
    }

    #[test]
    fn stale_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache
            .put_at("k", &json!(1), now_epoch_secs() - 120.0)
            .unwrap();
        assert_eq!(cache.get("k", Duration::from_secs(60)), None);
        assert_eq!(cache.get("k", Duration::from_secs(600)), Some(json!(1)));
    }

    #[tokio::test]
    async fn get_or_fetch_uses_fresh_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        let calls = AtomicU32::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!({"n": 1})) }
        };

        let (v, hit) = cache
            .get_or_fetch(CallKind::Read, "https://x.io/a", &[], DAY, false, fetch)
            .await
            .unwrap();
        assert_eq!((v, hit), (json!({"n": 1}), false));

        let (_, hit) = cache
            .get_or_fetch(CallKind::Read, "https://x.io/a", &[], DAY, false, fetch)
            .await
            .unwrap();
        assert!(hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_fetch_refetches_stale_entry_once() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        let key = cache_key("https://x.io/a", &[]);
        cache
            .put_at(&key, &json!("old"), now_epoch_secs() - 3600.0)
            .unwrap();

        let calls = AtomicU32::new(0);
        let (v, hit) = cache
            .get_or_fetch(
                CallKind::Read,
                "https://x.io/a",
                &[],
                Duration::from_secs(60),
                false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!("new")) }
                },
            )
            .await
            .unwrap();
        assert_eq!(v, json!("new"));
        assert!(!hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&key, Duration::from_secs(60)), Some(json!("new")));
    }

    #[tokio::test]
    async fn force_refresh_and_writes_bypass() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        let key = cache_key("https://x.io/a", &[]);
        cache.put(&key, &json!("cached")).unwrap();

        let (v, hit) = cache
            .get_or_fetch(CallKind::Read, "https://x.io/a", &[], DAY, true, || async {
                Ok(json!("fresh"))
            })
            .await
            .unwrap();
        assert_eq!((v, hit), (json!("fresh"), false));

        let (v, hit) = cache
            .get_or_fetch(CallKind::Write, "https://x.io/w", &[], DAY, false, || async {
                Ok(json!({"snapshot_id": "s1"}))
            })
            .await
            .unwrap();
        assert!(!hit);
        assert_eq!(v["snapshot_id"], "s1");
        assert_eq!(cache.get(&cache_key("https://x.io/w", &[]), DAY), None);
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        let result = cache
            .get_or_fetch(CallKind::Read, "https://x.io/a", &[], DAY, false, || async {
                Err(RemoteError::recoverable("down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn blocking_get_or_fetch() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        let (_, hit) = cache
            .get_or_fetch_blocking(CallKind::Read, "https://x.io/b", &[], DAY, false, || {
                Ok(json!(1))
            })
            .unwrap();
        assert!(!hit);
        let (_, hit) = cache
            .get_or_fetch_blocking(CallKind::Read, "https://x.io/b", &[], DAY, false, || {
                Err(RemoteError::recoverable("should not be called"))
            })
            .unwrap();
        assert!(hit);
    }

    #[test]
    fn clear_expired_removes_stale_and_corrupt() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache.put("fresh", &json!(1)).unwrap();
        cache
            .put_at("stale", &json!(2), now_epoch_secs() - 7200.0)
            .unwrap();
        std::fs::write(tmp.path().join("corrupt.json"), "{not json").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let removed = cache.clear_expired(Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 2);
        assert!(tmp.path().join("fresh.json").exists());
        assert!(!tmp.path().join("stale.json").exists());
        assert!(!tmp.path().join("corrupt.json").exists());
        assert!(tmp.path().join("notes.txt").exists());
    }

    #[test]
    fn clear_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let cache = TtlCache::open(tmp.path()).unwrap();
        cache.put("a", &json!(1)).unwrap();
        cache.put("b", &json!(2)).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.get("a", DAY), None);
    }
}
