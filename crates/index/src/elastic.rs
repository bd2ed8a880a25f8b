//! Elasticsearch-backed index client.

use crate::client::{AdIndex, SearchResult};
use crate::query::IndexQuery;
use adserve_core::types::fields;
use adserve_core::{AdUnit, DeliveryError, DeliveryResult};
use async_trait::async_trait;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::http::{StatusCode, Url};
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesRefreshParts,
};
use elasticsearch::{
    DeleteParts, Elasticsearch, GetParts, OpenPointInTimeParts, SearchParts, UpdateParts,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

const RETRY_ON_CONFLICT: i64 = 3;
const PIT_KEEP_ALIVE: &str = "1m";

#[derive(Clone)]
pub struct ElasticIndex {
    client: Elasticsearch,
    index: String,
}

impl ElasticIndex {
    /// Build the client. No request is made until the first call.
    pub fn new(url: &str, index: &str) -> DeliveryResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| DeliveryError::Config(format!("invalid index url {url}: {e}")))?;
        let pool = SingleNodeConnectionPool::new(parsed);
        let transport = TransportBuilder::new(pool)
            .build()
            .map_err(|e| DeliveryError::Config(e.to_string()))?;

        Ok(Self {
            client: Elasticsearch::new(transport),
            index: index.to_string(),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn mapping() -> Value {
        let keyword = json!({ "type": "keyword" });
        let stored_only = json!({ "type": "keyword", "index": false });

        let mut properties = Map::new();
        for field in [
            fields::UPDATED,
            fields::CREATED,
            fields::START_DATE,
            fields::END_DATE,
        ] {
            properties.insert(field.into(), json!({ "type": "date" }));
        }
        for field in [
            fields::CAMPAIGN,
            fields::LANGUAGES,
            fields::LOCATIONS,
            fields::EXCLUDED_LOCATIONS,
            fields::CATEGORIES,
            fields::EXCLUDED_CATEGORIES,
            fields::DEVICES,
            fields::FORMATS,
            fields::STATUS,
            fields::DELIVERY,
            "ad",
        ] {
            properties.insert(field.into(), keyword.clone());
        }
        for field in [fields::PAUSED, fields::GOAL_REACHED] {
            properties.insert(field.into(), json!({ "type": "boolean" }));
        }
        for field in [fields::GOAL_VIEWS, fields::CLICKS, fields::VIEWS] {
            properties.insert(field.into(), json!({ "type": "long" }));
        }
        for field in [
            "goal_period",
            "tactic",
            "channel",
            "channel_url",
            "account",
            "video_url",
            "thumbnail_url",
        ] {
            properties.insert(field.into(), stored_only.clone());
        }
        for field in ["title", "description"] {
            properties.insert(field.into(), json!({ "type": "text", "index": false }));
        }
        properties.insert("duration".into(), json!({ "type": "integer", "index": false }));
        properties.insert("cpc".into(), json!({ "type": "float", "index": false }));

        json!({
            "settings": {
                "number_of_shards": 1,
                "number_of_replicas": 0
            },
            "mappings": { "properties": properties }
        })
    }

    async fn open_pit(&self) -> DeliveryResult<String> {
        let response = self
            .client
            .open_point_in_time(OpenPointInTimeParts::Index(&[self.index.as_str()]))
            .keep_alive(PIT_KEEP_ALIVE)
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        let response = Self::check(response, "open point in time").await?;
        let body: Value = response.json().await.map_err(DeliveryError::transport)?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DeliveryError::transport("point in time response without id"))
    }

    async fn close_pit(&self, pit: &str) {
        let result = self
            .client
            .close_point_in_time()
            .body(json!({ "id": pit }))
            .send()
            .await;
        if let Err(e) = result {
            warn!(index = %self.index, error = %e, "Failed to close point in time");
        }
    }

    async fn scan_pages(
        &self,
        query: &IndexQuery,
        pit: &mut String,
    ) -> DeliveryResult<Vec<AdUnit>> {
        let page_size = query.size.max(1);
        let mut units = Vec::new();
        let mut after = None;

        loop {
            let response = self
                .client
                .search(SearchParts::None)
                .body(page_body(query, page_size, pit, after.take()))
                .send()
                .await
                .map_err(DeliveryError::transport)?;
            let response = Self::check(response, "scan").await?;
            let body: Value = response.json().await.map_err(DeliveryError::transport)?;

            // The id may change between pages; always continue with the latest.
            if let Some(id) = body["pit_id"].as_str() {
                *pit = id.to_string();
            }
            let page = parse_search_response(&body)?;
            let fetched = page.hits.len();
            units.extend(page.hits);

            after = last_sort(&body);
            if fetched < page_size || after.is_none() {
                break;
            }
        }

        debug!(index = %self.index, units = units.len(), "Scan completed");
        Ok(units)
    }

    async fn check(response: Response, action: &str) -> DeliveryResult<Response> {
        let status = response.status_code();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Transport(format!(
            "{action} failed with status {status}: {body}"
        )))
    }
}

/// `_id` is metadata in Elasticsearch and may not appear inside `_source`.
fn strip_id(mut doc: Value) -> Value {
    if let Some(map) = doc.as_object_mut() {
        map.remove(fields::ID);
    }
    doc
}

/// One page of a point-in-time scan in `_shard_doc` order.
pub(crate) fn page_body(
    query: &IndexQuery,
    page_size: usize,
    pit: &str,
    after: Option<Value>,
) -> Value {
    let mut body = query.to_dsl();
    body["size"] = json!(page_size);
    body["pit"] = json!({ "id": pit, "keep_alive": PIT_KEEP_ALIVE });
    body["sort"] = json!([{ "_shard_doc": "asc" }]);
    if let Some(after) = after {
        body["search_after"] = after;
    }
    body
}

/// Cursor for the next page: the sort values of the last hit.
pub(crate) fn last_sort(body: &Value) -> Option<Value> {
    body["hits"]["hits"]
        .as_array()
        .and_then(|hits| hits.last())
        .and_then(|hit| hit.get("sort"))
        .cloned()
}

/// Rebuild an `AdUnit` from a hit or get response: `_source` plus `_id`.
pub(crate) fn decode_hit(hit: &Value) -> DeliveryResult<AdUnit> {
    let mut source = hit.get("_source").cloned().unwrap_or_else(|| json!({}));
    if let (Some(map), Some(id)) = (source.as_object_mut(), hit.get("_id")) {
        map.insert(fields::ID.to_string(), id.clone());
    }
    Ok(serde_json::from_value(source)?)
}

pub(crate) fn parse_search_response(body: &Value) -> DeliveryResult<SearchResult> {
    let hits_section = &body["hits"];
    // Elasticsearch 7+ reports `{ "value": n }`, older versions a bare number.
    let total = hits_section["total"]["value"]
        .as_u64()
        .or_else(|| hits_section["total"].as_u64())
        .unwrap_or(0);

    let hits = hits_section["hits"]
        .as_array()
        .map(|hits| hits.iter().map(decode_hit).collect::<DeliveryResult<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();

    Ok(SearchResult {
        hits,
        total,
        took_ms: body["took"].as_u64().unwrap_or(0),
        timed_out: body["timed_out"].as_bool().unwrap_or(false),
    })
}

#[async_trait]
impl AdIndex for ElasticIndex {
    async fn search(&self, query: &IndexQuery) -> DeliveryResult<SearchResult> {
        let dsl = query.to_dsl();
        debug!(index = %self.index, query = %dsl, "Executing search");

        let response = self
            .client
            .search(SearchParts::Index(&[self.index.as_str()]))
            .body(dsl)
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        let response = Self::check(response, "search").await?;
        let body: Value = response.json().await.map_err(DeliveryError::transport)?;

        let result = parse_search_response(&body)?;
        metrics::histogram!("index.search.took_ms").record(result.took_ms as f64);
        debug!(
            took_ms = result.took_ms,
            timed_out = result.timed_out,
            hits = result.total,
            "Search completed"
        );
        Ok(result)
    }

    async fn scan(&self, query: &IndexQuery) -> DeliveryResult<Vec<AdUnit>> {
        let mut pit = self.open_pit().await?;
        let result = self.scan_pages(query, &mut pit).await;
        self.close_pit(&pit).await;
        result
    }

    async fn get(&self, id: &str) -> DeliveryResult<Option<AdUnit>> {
        let response = self
            .client
            .get(GetParts::IndexId(&self.index, id))
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "get").await?;
        let body: Value = response.json().await.map_err(DeliveryError::transport)?;

        if !body["found"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        decode_hit(&body).map(Some)
    }

    async fn update(&self, id: &str, doc: Value, upsert: bool) -> DeliveryResult<()> {
        let response = self
            .client
            .update(UpdateParts::IndexId(&self.index, id))
            .retry_on_conflict(RETRY_ON_CONFLICT)
            .body(json!({ "doc": strip_id(doc), "doc_as_upsert": upsert }))
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Err(DeliveryError::NotFound(id.to_string()));
        }
        Self::check(response, "update").await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> DeliveryResult<bool> {
        let response = self
            .client
            .delete(DeleteParts::IndexId(&self.index, id))
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        if response.status_code() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response, "delete").await?;
        Ok(true)
    }

    async fn ensure_index(&self) -> DeliveryResult<()> {
        let exists = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[self.index.as_str()]))
            .send()
            .await
            .map_err(DeliveryError::transport)?;

        if exists.status_code().is_success() {
            debug!(index = %self.index, "Index already exists");
            return Ok(());
        }

        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(&self.index))
            .body(Self::mapping())
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        Self::check(response, "create index").await?;

        info!(index = %self.index, "Created index");
        Ok(())
    }

    async fn reset_index(&self) -> DeliveryResult<()> {
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&[self.index.as_str()]))
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        if response.status_code() != StatusCode::NOT_FOUND {
            Self::check(response, "delete index").await?;
            info!(index = %self.index, "Deleted index");
        }
        self.ensure_index().await
    }

    async fn refresh(&self) -> DeliveryResult<()> {
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&[self.index.as_str()]))
            .send()
            .await
            .map_err(DeliveryError::transport)?;
        Self::check(response, "refresh").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let body = json!({
            "took": 3,
            "timed_out": false,
            "hits": {
                "total": { "value": 7, "relation": "eq" },
                "hits": [
                    { "_id": "ad-1", "_source": { "campaign": "c1", "title": "One" } },
                    { "_id": "ad-2", "_source": { "campaign": "c2" } }
                ]
            }
        });

        let result = parse_search_response(&body).unwrap();
        assert_eq!(result.total, 7);
        assert_eq!(result.took_ms, 3);
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].id, "ad-1");
        assert_eq!(result.hits[0].title.as_deref(), Some("One"));
        assert_eq!(result.hits[1].campaign, "c2");
    }

    #[test]
    fn test_parse_legacy_total_and_empty_hits() {
        let body = json!({ "took": 1, "hits": { "total": 0, "hits": [] } });
        let result = parse_search_response(&body).unwrap();
        assert_eq!(result.total, 0);
        assert!(result.hits.is_empty());
    }

    #[test]
    fn test_strip_id_before_write() {
        let doc = strip_id(json!({ "_id": "ad-1", "campaign": "c1" }));
        assert_eq!(doc, json!({ "campaign": "c1" }));
    }

    #[test]
    fn test_mapping_uses_keyword_dimensions() {
        let mapping = ElasticIndex::mapping();
        let props = &mapping["mappings"]["properties"];
        assert_eq!(props["locations"]["type"], "keyword");
        assert_eq!(props["goal_reached"]["type"], "boolean");
        assert_eq!(props["end_date"]["type"], "date");
        assert!(props.get("_id").is_none());
    }

    #[test]
    fn test_mapping_covers_every_written_field() {
        let mapping = ElasticIndex::mapping();
        let props = mapping["mappings"]["properties"].as_object().unwrap();
        for field in fields::CLEARABLE {
            assert!(props.contains_key(field), "{field} unmapped");
        }
        assert_eq!(props["excluded_categories"]["type"], "keyword");
        assert_eq!(props["title"]["index"], false);
        assert_eq!(mapping["settings"]["number_of_shards"], 1);
    }

    #[test]
    fn test_page_body_continues_after_cursor() {
        let query = IndexQuery::new(500).sorted_desc_by("_updated");

        let first = page_body(&query, 500, "pit-1", None);
        assert_eq!(first["size"], 500);
        assert_eq!(first["pit"]["id"], "pit-1");
        assert_eq!(first["sort"], json!([{ "_shard_doc": "asc" }]));
        assert!(first.get("search_after").is_none());

        let next = page_body(&query, 500, "pit-2", Some(json!([41])));
        assert_eq!(next["search_after"], json!([41]));
        assert_eq!(next["pit"]["id"], "pit-2");
    }

    #[test]
    fn test_last_sort_reads_final_hit() {
        let body = json!({
            "hits": { "hits": [
                { "_id": "a", "sort": [3] },
                { "_id": "b", "sort": [9] }
            ] }
        });
        assert_eq!(last_sort(&body), Some(json!([9])));
        assert_eq!(last_sort(&json!({ "hits": { "hits": [] } })), None);
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(matches!(
            ElasticIndex::new("not a url", "adunits"),
            Err(DeliveryError::Config(_))
        ));
    }
}
