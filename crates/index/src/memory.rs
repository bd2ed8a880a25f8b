//! In-process index backed by DashMap for lock-free concurrent access.
//! Stores raw JSON documents and evaluates `IndexQuery` directly, so it
//! behaves like the Elasticsearch backend for local runs and tests.

use crate::client::{AdIndex, SearchResult};
use crate::query::IndexQuery;
use adserve_core::types::fields;
use adserve_core::{AdUnit, DeliveryError, DeliveryResult};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Default)]
pub struct MemoryIndex {
    store: Arc<DashMap<String, Value>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Raw stored document, for assertions on exactly what was written.
    pub fn raw(&self, id: &str) -> Option<Value> {
        self.store.get(id).map(|entry| entry.value().clone())
    }

    /// Up to `size` matching documents with ids after `after`, in id order.
    fn page_after(
        &self,
        query: &IndexQuery,
        after: Option<&str>,
        size: usize,
    ) -> Vec<(String, Value)> {
        let mut page: Vec<(String, Value)> = self
            .store
            .iter()
            .filter(|entry| after.map_or(true, |after| entry.key().as_str() > after))
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        page.sort_by(|a, b| a.0.cmp(&b.0));
        page.truncate(size);
        page
    }
}

fn decode(doc: Value) -> DeliveryResult<AdUnit> {
    Ok(serde_json::from_value(doc)?)
}

#[async_trait]
impl AdIndex for MemoryIndex {
    async fn search(&self, query: &IndexQuery) -> DeliveryResult<SearchResult> {
        let start = Instant::now();

        let mut matched: Vec<Value> = self
            .store
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        if query.sort_desc.is_some() {
            matched.sort_by(|a, b| query.compare(a, b));
        } else if query.random_score {
            matched.shuffle(&mut rand::thread_rng());
        }

        let total = matched.len() as u64;
        let hits = matched
            .into_iter()
            .take(query.size)
            .map(|doc| decode(query.project(&doc)))
            .collect::<DeliveryResult<Vec<_>>>()?;

        Ok(SearchResult {
            hits,
            total,
            took_ms: start.elapsed().as_millis() as u64,
            timed_out: false,
        })
    }

    async fn scan(&self, query: &IndexQuery) -> DeliveryResult<Vec<AdUnit>> {
        let page_size = query.size.max(1);
        let mut units = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let page = self.page_after(query, after.as_deref(), page_size);
            let fetched = page.len();
            for (id, doc) in page {
                units.push(decode(query.project(&doc))?);
                after = Some(id);
            }
            if fetched < page_size {
                break;
            }
        }
        Ok(units)
    }

    async fn get(&self, id: &str) -> DeliveryResult<Option<AdUnit>> {
        self.raw(id).map(decode).transpose()
    }

    async fn update(&self, id: &str, doc: Value, upsert: bool) -> DeliveryResult<()> {
        let Value::Object(partial) = doc else {
            return Err(DeliveryError::Validation(format!(
                "document for {id} must be a JSON object"
            )));
        };

        match self.store.get_mut(id) {
            Some(mut stored) => {
                if let Some(existing) = stored.value_mut().as_object_mut() {
                    existing.extend(partial);
                }
                Ok(())
            }
            None if upsert => {
                let mut created = partial;
                created.insert(fields::ID.to_string(), Value::String(id.to_string()));
                self.store.insert(id.to_string(), Value::Object(created));
                Ok(())
            }
            None => Err(DeliveryError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> DeliveryResult<bool> {
        Ok(self.store.remove(id).is_some())
    }

    async fn ensure_index(&self) -> DeliveryResult<()> {
        Ok(())
    }

    async fn reset_index(&self) -> DeliveryResult<()> {
        self.store.clear();
        Ok(())
    }

    async fn refresh(&self) -> DeliveryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Clause;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_then_partial_update() {
        let index = MemoryIndex::new();
        index
            .update("ad-1", json!({"campaign": "c1", "clicks": 1}), true)
            .await
            .unwrap();
        index.update("ad-1", json!({"clicks": 7}), false).await.unwrap();

        let unit = index.get("ad-1").await.unwrap().unwrap();
        assert_eq!(unit.id, "ad-1");
        assert_eq!(unit.campaign, "c1");
        assert_eq!(unit.clicks, 7);
    }

    #[tokio::test]
    async fn test_update_without_upsert_reports_not_found() {
        let index = MemoryIndex::new();
        let err = index.update("ghost", json!({"paused": true}), false).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_whether_found() {
        let index = MemoryIndex::new();
        index.update("ad-1", json!({}), true).await.unwrap();
        assert!(index.delete("ad-1").await.unwrap());
        assert!(!index.delete("ad-1").await.unwrap());
        assert!(index.get("ad-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_filters_truncates_and_counts_total() {
        let index = MemoryIndex::new();
        for i in 0..5 {
            let status = if i == 0 { "inactive" } else { "active" };
            index
                .update(&format!("ad-{i}"), json!({"campaign": "c", "status": status}), true)
                .await
                .unwrap();
        }

        let query = IndexQuery::new(2)
            .must(Clause::term("status", "active"))
            .with_random_score();
        let result = index.search(&query).await.unwrap();

        assert_eq!(result.total, 4);
        assert_eq!(result.hits.len(), 2);
        assert!(result.hits.iter().all(|u| u.id != "ad-0"));
    }

    #[tokio::test]
    async fn test_search_sorted_desc() {
        let index = MemoryIndex::new();
        index
            .update("old", json!({"_updated": "2026-01-01T00:00:00Z"}), true)
            .await
            .unwrap();
        index
            .update("new", json!({"_updated": "2026-02-01T00:00:00Z"}), true)
            .await
            .unwrap();
        index.update("never", json!({}), true).await.unwrap();

        let query = IndexQuery::new(1).sorted_desc_by("_updated");
        let result = index.search(&query).await.unwrap();
        assert_eq!(result.hits[0].id, "new");
    }

    #[tokio::test]
    async fn test_scan_reads_past_page_size() {
        let index = MemoryIndex::new();
        for i in 0..25 {
            let status = if i % 5 == 0 { "inactive" } else { "active" };
            index
                .update(&format!("ad-{i:02}"), json!({"campaign": "c", "status": status}), true)
                .await
                .unwrap();
        }

        let query = IndexQuery::new(4).must(Clause::term("status", "active"));
        let units = index.scan(&query).await.unwrap();

        assert_eq!(units.len(), 20);
        let mut ids: Vec<_> = units.iter().map(|u| u.id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        assert!(units.iter().all(|u| u.status.as_str() == "active"));
    }

    #[tokio::test]
    async fn test_ingest_inserts_then_updates_partially() {
        let index = MemoryIndex::new();
        let first = Utc::now();
        let mut unit = AdUnit::new("ad-1", "c1");
        unit.title = Some("Teaser".into());
        index.ingest(&unit.clone().into_ingest(first).unwrap()).await.unwrap();
        index.update("ad-1", json!({"clicks": 4}), false).await.unwrap();

        unit.title = None;
        index
            .ingest(&unit.into_ingest(first + Duration::days(2)).unwrap())
            .await
            .unwrap();

        let stored = index.get("ad-1").await.unwrap().unwrap();
        assert_eq!(stored.title, None);
        assert_eq!(stored.clicks, 4);
        assert_eq!(stored.start_date, Some(first));
    }

    #[tokio::test]
    async fn test_search_applies_projection() {
        let index = MemoryIndex::new();
        index
            .update("ad-1", json!({"campaign": "c1", "clicks": 9, "title": "t"}), true)
            .await
            .unwrap();

        let query = IndexQuery::new(1).with_source(&["_id", "campaign", "title"]);
        let hit = index.search(&query).await.unwrap().hits.remove(0);
        assert_eq!(hit.campaign, "c1");
        assert_eq!(hit.title.as_deref(), Some("t"));
        assert_eq!(hit.clicks, 0);
    }
}
