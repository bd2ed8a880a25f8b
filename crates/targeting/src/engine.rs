//! Targeting engine: one index round-trip per request, then campaign dedup.
//! Also serves the administrative fetches the reconciliation loop needs.

use crate::builder::{
    all_units_query, build_query, campaign_query, pacing_candidates_query, watermark_query,
};
use crate::dedup::dedupe_by_campaign;
use adserve_core::{AdUnit, DeliveryError, DeliveryResult, SearchQuery};
use adserve_index::{AdIndex, IndexQuery};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

pub struct TargetingEngine {
    index: Arc<dyn AdIndex>,
    admin_fetch_size: usize,
}

impl TargetingEngine {
    pub fn new(index: Arc<dyn AdIndex>, admin_fetch_size: usize) -> Self {
        Self {
            index,
            admin_fetch_size,
        }
    }

    pub fn index(&self) -> &Arc<dyn AdIndex> {
        &self.index
    }

    /// Up to `count` eligible units, at most one per campaign.
    ///
    /// Zero raw hits is `DeliveryError::NoMatch`, not a failure; a non-empty
    /// result may still be shorter than `count` after dedup.
    pub async fn find_ad_units(
        &self,
        criteria: &SearchQuery,
        count: usize,
    ) -> DeliveryResult<Vec<AdUnit>> {
        metrics::counter!("targeting.requests").increment(1);

        let query = build_query(criteria, count, Utc::now());
        let result = self.index.search(&query).await?;

        if result.total == 0 || result.hits.is_empty() {
            metrics::counter!("targeting.no_match").increment(1);
            let target = serde_json::to_string(criteria)?;
            debug!(criteria = %target, "No ads matched");
            return Err(DeliveryError::NoMatch(target));
        }

        let units = dedupe_by_campaign(result.hits, count);
        metrics::counter!("targeting.served").increment(units.len() as u64);
        debug!(
            requested = count,
            served = units.len(),
            hits = result.total,
            "Targeting completed"
        );
        Ok(units)
    }

    /// Every unit in the index, unfiltered.
    pub async fn fetch_all(&self) -> DeliveryResult<Vec<AdUnit>> {
        self.fetch_admin(all_units_query(self.admin_fetch_size)).await
    }

    /// Every unit of `campaign`, whatever its status.
    pub async fn find_by_campaign(&self, campaign: &str) -> DeliveryResult<Vec<AdUnit>> {
        self.fetch_admin(campaign_query(campaign, self.admin_fetch_size))
            .await
    }

    /// Units the pacing sweep has to decide on.
    pub async fn find_pacing_candidates(
        &self,
        now: DateTime<Utc>,
        horizon_years: u32,
    ) -> DeliveryResult<Vec<AdUnit>> {
        self.fetch_admin(pacing_candidates_query(
            now,
            horizon_years,
            self.admin_fetch_size,
        ))
        .await
    }

    /// Latest `_updated` across the index. `None` when the index is empty.
    pub async fn high_watermark(&self) -> DeliveryResult<Option<DateTime<Utc>>> {
        let result = self.index.search(&watermark_query()).await?;
        Ok(result.hits.into_iter().next().and_then(|unit| unit.updated))
    }

    /// Every match, read in pages of `admin_fetch_size`.
    async fn fetch_admin(&self, query: IndexQuery) -> DeliveryResult<Vec<AdUnit>> {
        let units = self.index.scan(&query).await?;
        debug!(units = units.len(), page_size = query.size, "Administrative fetch");
        Ok(units)
    }
}
