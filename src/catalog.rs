//! The catalog service boundary.
//!
//! [`Catalog`] is the seam between the resolution engine and whatever
//! authenticated client talks to the external catalog. [`crate::http_catalog`]
//! provides the HTTP implementation; tests substitute in-memory fakes.
//!
//! Implementations make exactly one attempt per call and report failures as
//! classified [`RemoteError`]s. Retrying is the caller's job
//! ([`crate::retry::call_with_retry`]), so one policy governs every call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// Provider limit on items per "add items" call.
pub const MAX_WRITE_CHUNK: usize = 100;

/// A track as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub id: String,
    /// Canonical URI used for membership and writes.
    pub uri: String,
    pub name: String,
    pub artists: Vec<String>,
}

/// One page of a collection's membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPage {
    pub item_uris: Vec<String>,
    /// Offset of the next page, `None` on the last page.
    pub next_offset: Option<usize>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Run one free-text track search.
    async fn search_tracks(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogTrack>, RemoteError>;

    /// Read one page of a collection's member URIs.
    async fn collection_page(
        &self,
        collection_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<CollectionPage, RemoteError>;

    /// Append items to a collection. Callers pass at most [`MAX_WRITE_CHUNK`] URIs.
    async fn add_items(&self, collection_id: &str, uris: &[String]) -> Result<(), RemoteError>;
}
