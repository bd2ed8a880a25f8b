//! Counter fetcher backed by ClickHouse.
//! Click events live in one table; totals and trailing-window counts are
//! two separate aggregations combined into a `CounterSnapshot`.

use adserve_core::config::CountersConfig;
use adserve_core::{CounterSnapshot, DeliveryError, DeliveryResult};
use async_trait::async_trait;
use clickhouse::Row;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

#[async_trait]
pub trait CounterSource: Send + Sync {
    /// campaign -> cumulative clicks
    async fn total_clicks(&self) -> DeliveryResult<HashMap<String, u64>>;

    /// campaign -> clicks within the last `window_hours`
    async fn trailing_clicks(&self, window_hours: u32) -> DeliveryResult<HashMap<String, u64>>;
}

/// Both aggregations for one reconciliation cycle.
pub async fn fetch_snapshot(
    source: &dyn CounterSource,
    window_hours: u32,
) -> DeliveryResult<CounterSnapshot> {
    let totals = source.total_clicks().await?;
    let trailing = source.trailing_clicks(window_hours).await?;
    debug!(
        campaigns = totals.len(),
        trailing_campaigns = trailing.len(),
        window_hours,
        "Counter snapshot fetched"
    );
    Ok(CounterSnapshot {
        window_hours,
        totals,
        trailing,
    })
}

#[derive(Debug, Row, Deserialize)]
struct CampaignClicks {
    campaign: String,
    clicks: u64,
}

pub struct ClickHouseCounters {
    client: clickhouse::Client,
    table: String,
}

impl ClickHouseCounters {
    pub fn new(config: &CountersConfig) -> DeliveryResult<Self> {
        if config.table.is_empty()
            || !config
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DeliveryError::Config(format!(
                "invalid counters table name '{}'",
                config.table
            )));
        }

        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        Ok(Self {
            client,
            table: config.table.clone(),
        })
    }

    /// Create the events table if it doesn't exist.
    pub async fn ensure_schema(&self) -> DeliveryResult<()> {
        self.client
            .query(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    campaign String,
                    event_type LowCardinality(String),
                    timestamp DateTime64(3)
                ) ENGINE = MergeTree()
                ORDER BY (campaign, timestamp)
                PARTITION BY toYYYYMM(timestamp)",
                self.table
            ))
            .execute()
            .await
            .map_err(DeliveryError::transport)?;

        info!(table = %self.table, "ClickHouse counters schema verified");
        Ok(())
    }

    fn totals_sql(&self) -> String {
        format!(
            "SELECT campaign, count() AS clicks FROM {} \
             WHERE event_type = 'click' GROUP BY campaign",
            self.table
        )
    }

    fn trailing_sql(&self) -> String {
        format!(
            "SELECT campaign, count() AS clicks FROM {} \
             WHERE event_type = 'click' AND timestamp >= now() - toIntervalHour(?) \
             GROUP BY campaign",
            self.table
        )
    }

    async fn fetch(&self, query: clickhouse::query::Query) -> DeliveryResult<HashMap<String, u64>> {
        let rows = query
            .fetch_all::<CampaignClicks>()
            .await
            .map_err(DeliveryError::transport)?;
        Ok(rows.into_iter().map(|r| (r.campaign, r.clicks)).collect())
    }
}

#[async_trait]
impl CounterSource for ClickHouseCounters {
    async fn total_clicks(&self) -> DeliveryResult<HashMap<String, u64>> {
        let result = self.fetch(self.client.query(&self.totals_sql())).await;
        if result.is_err() {
            metrics::counter!("counters.fetch_errors").increment(1);
        }
        result
    }

    async fn trailing_clicks(&self, window_hours: u32) -> DeliveryResult<HashMap<String, u64>> {
        let query = self.client.query(&self.trailing_sql()).bind(window_hours);
        let result = self.fetch(query).await;
        if result.is_err() {
            metrics::counter!("counters.fetch_errors").increment(1);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCounters;
    use chrono::{Duration, Utc};

    fn config(table: &str) -> CountersConfig {
        CountersConfig {
            table: table.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        assert!(ClickHouseCounters::new(&config("ad_events; DROP TABLE x")).is_err());
        assert!(ClickHouseCounters::new(&config("")).is_err());
    }

    #[test]
    fn test_queries_target_configured_table() {
        let counters = ClickHouseCounters::new(&config("clicks_v2")).unwrap();
        assert!(counters.totals_sql().contains("FROM clicks_v2"));
        assert!(counters.trailing_sql().contains("toIntervalHour(?)"));
    }

    #[tokio::test]
    async fn test_snapshot_combines_both_aggregations() {
        let counters = MemoryCounters::new();
        let now = Utc::now();
        counters.record_click("c1", now - Duration::hours(30));
        counters.record_click("c1", now - Duration::hours(2));
        counters.record_click("c2", now - Duration::hours(1));

        let snapshot = fetch_snapshot(&counters, 24).await.unwrap();
        assert_eq!(snapshot.window_hours, 24);
        assert_eq!(snapshot.total("c1"), Some(2));
        assert_eq!(snapshot.trailing("c1"), 1);
        assert_eq!(snapshot.trailing("c2"), 1);
        assert_eq!(snapshot.total("c3"), None);
    }
}
