//! HTTP implementation of [`Catalog`] for a Spotify-style Web API.
//!
//! | Operation | Request | Cached |
//! |-----------|---------|--------|
//! | search | `GET {base}/search?q=&type=track&limit=` | yes, via [`TtlCache`] |
//! | membership page | `GET {base}/playlists/{id}/tracks?offset=&limit=` | no |
//! | add items | `POST {base}/playlists/{id}/tracks` with `{"uris": [...]}` | no |
//!
//! Authentication is out of scope: the bearer token is handed in already
//! obtained. Each method makes a single attempt and maps failures through
//! [`classify_status`]; callers wrap calls in [`crate::retry::call_with_retry`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CallKind, TtlCache};
use crate::catalog::{Catalog, CatalogTrack, CollectionPage, MAX_WRITE_CHUNK};
use crate::error::{classify_status, RemoteError};

pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    token: String,
    cache: Option<TtlCache>,
    cache_max_age: Duration,
    force_refresh: bool,
}

impl HttpCatalog {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            cache: None,
            cache_max_age: Duration::from_secs(86_400),
            force_refresh: false,
        })
    }

    /// Serve search reads from `cache` while entries are younger than `max_age`.
    pub fn with_cache(mut self, cache: TtlCache, max_age: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_max_age = max_age;
        self
    }

    /// Always go to the network for reads, still refreshing the cache.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, RemoteError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await?;
        read_json(resp).await
    }
}

/// Turn a response into JSON, classifying non-success statuses.
///
/// An empty success body yields `Value::Null`.
async fn read_json(resp: reqwest::Response) -> Result<Value, RemoteError> {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(classify_status(status.as_u16(), retry_after.as_deref(), &body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body)
        .map_err(|e| RemoteError::DataValidation(format!("response is not JSON: {}", e)))
}

/// Parse `tracks.items[]` from a search response.
pub fn parse_search_response(json: &Value) -> Result<Vec<CatalogTrack>, RemoteError> {
    let items = json
        .pointer("/tracks/items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            RemoteError::DataValidation("search response missing tracks.items".to_string())
        })?;

    let mut tracks = Vec::with_capacity(items.len());
    for item in items {
        // Unavailable tracks come back as null entries.
        if item.is_null() {
            continue;
        }
        let field = |name: &str| item.get(name).and_then(|v| v.as_str());
        let (Some(uri), Some(name)) = (field("uri"), field("name")) else {
            return Err(RemoteError::DataValidation(
                "search item missing uri or name".to_string(),
            ));
        };
        let artists = item
            .get("artists")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|a| a.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        tracks.push(CatalogTrack {
            id: field("id").unwrap_or_default().to_string(),
            uri: uri.to_string(),
            name: name.to_string(),
            artists,
        });
    }
    Ok(tracks)
}

/// Parse one page of collection membership.
pub fn parse_collection_page(json: &Value, offset: usize) -> Result<CollectionPage, RemoteError> {
    let items = json.get("items").and_then(|v| v.as_array()).ok_or_else(|| {
        RemoteError::DataValidation("collection page missing items".to_string())
    })?;

    let item_uris: Vec<String> = items
        .iter()
        .filter_map(|i| i.pointer("/track/uri").and_then(|u| u.as_str()))
        .map(str::to_string)
        .collect();

    let has_next = json.get("next").map(|n| !n.is_null()).unwrap_or(false);
    let next_offset = if has_next && !items.is_empty() {
        Some(offset + items.len())
    } else {
        None
    };

    Ok(CollectionPage {
        item_uris,
        next_offset,
    })
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn search_tracks(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, RemoteError> {
        let url = format!("{}/search", self.base_url);
        let limit = limit.to_string();
        let params = [("q", query), ("type", "track"), ("limit", limit.as_str())];

        let json = match &self.cache {
            Some(cache) => {
                let (json, from_cache) = cache
                    .get_or_fetch(
                        CallKind::Read,
                        &url,
                        &params,
                        self.cache_max_age,
                        self.force_refresh,
                        || self.get_json(&url, &params),
                    )
                    .await?;
                debug!(query, from_cache, "search");
                json
            }
            None => self.get_json(&url, &params).await?,
        };
        parse_search_response(&json)
    }

    async fn collection_page(
        &self,
        collection_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<CollectionPage, RemoteError> {
        let url = format!("{}/playlists/{}/tracks", self.base_url, collection_id);
        let (offset_s, limit_s) = (offset.to_string(), limit.to_string());
        let json = self
            .get_json(&url, &[("offset", offset_s.as_str()), ("limit", limit_s.as_str())])
            .await?;
        parse_collection_page(&json, offset)
    }

    async fn add_items(&self, collection_id: &str, uris: &[String]) -> Result<(), RemoteError> {
        if uris.len() > MAX_WRITE_CHUNK {
            return Err(RemoteError::NonRecoverable {
                status: 0,
                message: format!(
                    "{} items exceeds the add limit of {}",
                    uris.len(),
                    MAX_WRITE_CHUNK
                ),
            });
        }
        let url = format!("{}/playlists/{}/tracks", self.base_url, collection_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "uris": uris }))
            .send()
            .await?;
        read_json(resp).await?;
        debug!(collection_id, count = uris.len(), "added items");
        Ok(())
    }
}
