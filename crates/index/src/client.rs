//! Index client contract shared by every backend.

use crate::query::IndexQuery;
use adserve_core::{AdUnit, DeliveryError, DeliveryResult, IngestWrite};
use async_trait::async_trait;
use serde_json::Value;

/// Raw outcome of one search round-trip.
#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub hits: Vec<AdUnit>,
    /// Total matching documents, which may exceed `hits.len()`.
    pub total: u64,
    pub took_ms: u64,
    pub timed_out: bool,
}

#[async_trait]
pub trait AdIndex: Send + Sync {
    async fn search(&self, query: &IndexQuery) -> DeliveryResult<SearchResult>;

    /// Every document matching `query`, read in pages of `query.size` ordered
    /// by a stable cursor. Scoring and sorting on the query are ignored.
    async fn scan(&self, query: &IndexQuery) -> DeliveryResult<Vec<AdUnit>>;

    /// `Ok(None)` when the id is absent.
    async fn get(&self, id: &str) -> DeliveryResult<Option<AdUnit>>;

    /// Merge `doc` into the stored document. Without `upsert` a missing id is
    /// `DeliveryError::NotFound`; with it the document is created.
    async fn update(&self, id: &str, doc: Value, upsert: bool) -> DeliveryResult<()>;

    /// Write an upstream record: a partial update when the unit is indexed,
    /// otherwise the full document with its defaults.
    async fn ingest(&self, write: &IngestWrite) -> DeliveryResult<()> {
        let id = write.unit.id.as_str();
        match self.update(id, write.update.clone(), false).await {
            Err(DeliveryError::NotFound(_)) => self.update(id, write.insert.clone(), true).await,
            other => other,
        }
    }

    /// Returns whether a document was actually removed.
    async fn delete(&self, id: &str) -> DeliveryResult<bool>;

    /// Create the index with its mapping if it does not exist yet.
    async fn ensure_index(&self) -> DeliveryResult<()>;

    /// Drop every document and recreate the index.
    async fn reset_index(&self) -> DeliveryResult<()>;

    /// Make all prior writes visible to search.
    async fn refresh(&self) -> DeliveryResult<()>;
}
