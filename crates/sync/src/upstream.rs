//! Upstream campaign API client.

use adserve_core::config::UpstreamConfig;
use adserve_core::types::AdUnits;
use adserve_core::{AdUnit, DeliveryError, DeliveryResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Units changed after `since`; with no watermark, every active unit.
    async fn fetch_changed(&self, since: Option<DateTime<Utc>>) -> DeliveryResult<Vec<AdUnit>>;
}

/// Value of the `where` filter for a watermark.
pub fn where_filter(since: Option<DateTime<Utc>>) -> String {
    match since {
        None => "status==active".to_string(),
        Some(at) => format!(
            "_updated>\"{}\"",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    }
}

pub struct HttpUpstream {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> DeliveryResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| DeliveryError::Config(format!("upstream client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_changed(&self, since: Option<DateTime<Utc>>) -> DeliveryResult<Vec<AdUnit>> {
        let filter = where_filter(since);
        debug!(url = %self.url, filter = %filter, "Fetching upstream ad units");

        let mut request = self.client.get(&self.url).query(&[("where", filter.as_str())]);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await.map_err(DeliveryError::transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DeliveryError::Transport(format!(
                "upstream returned {status}: {body}"
            )));
        }

        let units: AdUnits = response.json().await.map_err(DeliveryError::transport)?;
        info!(count = units.items.len(), "Fetched upstream ad units");
        Ok(units.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_filter_without_watermark() {
        assert_eq!(where_filter(None), "status==active");
    }

    #[test]
    fn test_incremental_filter_uses_rfc3339_seconds() {
        let at = DateTime::parse_from_rfc3339("2026-02-01T10:00:00.750Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(where_filter(Some(at)), r#"_updated>"2026-02-01T10:00:00Z""#);
    }

    #[test]
    fn test_client_builds_from_config() {
        let upstream = HttpUpstream::new(&UpstreamConfig::default()).unwrap();
        assert_eq!(upstream.url, UpstreamConfig::default().url);
    }
}
