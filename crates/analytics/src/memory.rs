//! In-process counter store for local runs and tests.

use crate::counters::CounterSource;
use adserve_core::DeliveryResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Click timestamps per campaign.
#[derive(Clone, Default)]
pub struct MemoryCounters {
    clicks: Arc<DashMap<String, Vec<DateTime<Utc>>>>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_click(&self, campaign: &str, at: DateTime<Utc>) {
        self.clicks.entry(campaign.to_string()).or_default().push(at);
    }

    /// Record `count` clicks at `at`.
    pub fn record_clicks(&self, campaign: &str, count: usize, at: DateTime<Utc>) {
        self.clicks
            .entry(campaign.to_string())
            .or_default()
            .extend(std::iter::repeat(at).take(count));
    }
}

#[async_trait]
impl CounterSource for MemoryCounters {
    async fn total_clicks(&self) -> DeliveryResult<HashMap<String, u64>> {
        Ok(self
            .clicks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len() as u64))
            .collect())
    }

    async fn trailing_clicks(&self, window_hours: u32) -> DeliveryResult<HashMap<String, u64>> {
        let since = Utc::now() - Duration::hours(i64::from(window_hours));
        Ok(self
            .clicks
            .iter()
            .filter_map(|entry| {
                let recent = entry.value().iter().filter(|at| **at >= since).count() as u64;
                (recent > 0).then(|| (entry.key().clone(), recent))
            })
            .collect())
    }
}
