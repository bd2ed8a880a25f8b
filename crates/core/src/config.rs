use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADSERVE__`, e.g. `ADSERVE__INDEX__URL`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub counters: CountersConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Elasticsearch,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_backend")]
    pub backend: IndexBackend,
    #[serde(default = "default_index_url")]
    pub url: String,
    #[serde(default = "default_index_name")]
    pub name: String,
    /// Fixed delay between bootstrap attempts. Bootstrap never gives up.
    #[serde(default = "default_bootstrap_retry_secs")]
    pub bootstrap_retry_secs: u64,
    /// Drop and recreate the index on startup.
    #[serde(default)]
    pub reset_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Ad unit collection endpoint, e.g. `https://api.example.com/adunits`.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountersConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_counters_table")]
    pub table: String,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    /// Page size for administrative fetches, which always read every match.
    #[serde(default = "default_admin_fetch_size")]
    pub admin_fetch_size: usize,
    /// Units ending further out than this are not paced.
    #[serde(default = "default_pacing_horizon_years")]
    pub pacing_horizon_years: u32,
    /// A paused unit resumes once its run rate drops to `required * resume_ratio`.
    #[serde(default = "default_resume_ratio")]
    pub resume_ratio: f64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    7001
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_index_backend() -> IndexBackend {
    IndexBackend::Elasticsearch
}
fn default_index_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_index_name() -> String {
    "adunits".to_string()
}
fn default_bootstrap_retry_secs() -> u64 {
    5
}
fn default_upstream_url() -> String {
    "https://localhost/adunits".to_string()
}
fn default_upstream_timeout_ms() -> u64 {
    10_000
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "adserve".to_string()
}
fn default_counters_table() -> String {
    "ad_events".to_string()
}
fn default_window_hours() -> u32 {
    24
}
fn default_reconcile_enabled() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    30
}
fn default_write_concurrency() -> usize {
    16
}
fn default_admin_fetch_size() -> usize {
    1_000
}
fn default_pacing_horizon_years() -> u32 {
    5
}
fn default_resume_ratio() -> f64 {
    1.0
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            url: default_index_url(),
            name: default_index_name(),
            bootstrap_retry_secs: default_bootstrap_retry_secs(),
            reset_on_start: false,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            username: String::new(),
            password: String::new(),
            timeout_ms: default_upstream_timeout_ms(),
            accept_invalid_certs: false,
        }
    }
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            table: default_counters_table(),
            window_hours: default_window_hours(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            interval_secs: default_interval_secs(),
            write_concurrency: default_write_concurrency(),
            admin_fetch_size: default_admin_fetch_size(),
            pacing_horizon_years: default_pacing_horizon_years(),
            resume_ratio: default_resume_ratio(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            index: IndexConfig::default(),
            upstream: UpstreamConfig::default(),
            counters: CountersConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ADSERVE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
