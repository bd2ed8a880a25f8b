//! Ad Serve — ad unit targeting service with a background reconciliation loop.
//!
//! Main entry point that wires the collaborators together and starts the server.

use adserve_analytics::{ClickHouseCounters, CounterSource, MemoryCounters};
use adserve_api::ApiServer;
use adserve_core::config::{AppConfig, IndexBackend};
use adserve_index::{bootstrap_index, AdIndex, ElasticIndex, MemoryIndex};
use adserve_sync::{HttpUpstream, Reconciler, ReconcilerSettings};
use adserve_targeting::TargetingEngine;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "adserve")]
#[command(about = "Ad unit targeting service with campaign pacing")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "ADSERVE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADSERVE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Drop and recreate the index before starting
    #[arg(long, default_value_t = false)]
    reset_index: bool,

    /// Serve HTTP only, without the reconciliation loop
    #[arg(long, default_value_t = false, conflicts_with = "sync_only")]
    api_only: bool,

    /// Run the reconciliation loop only, without the HTTP server
    #[arg(long, default_value_t = false)]
    sync_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adserve=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Ad Serve starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if cli.reset_index {
        config.index.reset_on_start = true;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.index.backend,
        index = %config.index.name,
        "Configuration loaded"
    );

    // Index client and schema
    let index: Arc<dyn AdIndex> = match config.index.backend {
        IndexBackend::Elasticsearch => {
            Arc::new(ElasticIndex::new(&config.index.url, &config.index.name)?)
        }
        IndexBackend::Memory => Arc::new(MemoryIndex::new()),
    };
    bootstrap_index(
        index.as_ref(),
        config.index.reset_on_start,
        Duration::from_secs(config.index.bootstrap_retry_secs),
    )
    .await;

    let engine = Arc::new(TargetingEngine::new(
        index.clone(),
        config.reconcile.admin_fetch_size,
    ));

    let api_server = ApiServer::new(config.clone(), engine.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Reconciliation loop (unless API-only mode)
    let reconcile_enabled = config.reconcile.enabled && !cli.api_only;
    let loop_handle = if reconcile_enabled {
        let counters: Arc<dyn CounterSource> = match config.index.backend {
            IndexBackend::Elasticsearch => {
                let counters = ClickHouseCounters::new(&config.counters)?;
                if let Err(e) = counters.ensure_schema().await {
                    error!(error = %e, "ClickHouse schema check failed, counters will retry each cycle");
                }
                Arc::new(counters)
            }
            IndexBackend::Memory => Arc::new(MemoryCounters::new()),
        };
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        let reconciler = Arc::new(Reconciler::new(
            engine.clone(),
            upstream,
            counters,
            ReconcilerSettings::from_config(&config),
        ));
        Some(reconciler.spawn())
    } else {
        info!("Reconciliation loop disabled");
        None
    };

    if cli.sync_only {
        info!("Running in sync-only mode (no HTTP server)");
        if let Some(handle) = loop_handle {
            handle.await?;
        }
        return Ok(());
    }

    info!("Ad Serve is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
