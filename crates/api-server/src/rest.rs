//! REST API handlers for targeting, ad unit administration and operational endpoints.

use adserve_core::types::AdUnits;
use adserve_core::{AdUnit, DeliveryError, SearchQuery};
use adserve_index::AdIndex;
use adserve_targeting::TargetingEngine;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use utoipa::{IntoParams, ToSchema};

/// Maximum number of positions per targeting request.
const MAX_POSITIONS: usize = 100;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TargetingEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<TargetingEngine>, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }

    fn index(&self) -> &Arc<dyn AdIndex> {
        self.engine.index()
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(err: &DeliveryError) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if status.is_server_error() {
        error!(error = %err, "Request failed");
        metrics::counter!("api.errors").increment(1);
        "Internal processing error".to_string()
    } else {
        err.to_string()
    };
    (
        status,
        Json(ErrorResponse {
            message,
            status: status.as_u16(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    metrics::counter!("api.validation_errors").increment(1);
    api_error(&DeliveryError::Validation(message.into()))
}

/// Parse an optional JSON body. Blank bodies are `None`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| bad_request(format!("malformed JSON body: {e}")))
}

fn parse_positions(raw: Option<&str>) -> Result<usize, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(1);
    };
    match raw.parse::<usize>() {
        Ok(n) if (1..=MAX_POSITIONS).contains(&n) => Ok(n),
        _ => Err(bad_request(format!(
            "'positions' must be an integer between 1 and {MAX_POSITIONS}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Targeting
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct QueryParams {
    /// Number of ad units wanted, 1 to 100. Defaults to 1.
    pub positions: Option<String>,
}

async fn run_query(state: AppState, params: QueryParams, body: Bytes) -> ApiResult<AdUnits> {
    let positions = parse_positions(params.positions.as_deref())?;
    let criteria: SearchQuery = parse_body(&body)?.unwrap_or_default();

    match state.engine.find_ad_units(&criteria, positions).await {
        Ok(items) => Ok(Json(AdUnits { items })),
        Err(e) => Err(api_error(&e)),
    }
}

/// GET /query — Targeting query; criteria in an optional JSON body.
#[utoipa::path(
    get,
    path = "/query",
    tag = "Targeting",
    params(QueryParams),
    request_body(content = SearchQuery, description = "Targeting criteria, all optional"),
    responses(
        (status = 200, description = "Matching ad units, or a no-match message", body = AdUnits),
        (status = 400, description = "Malformed criteria or positions", body = ErrorResponse),
        (status = 500, description = "Index failure", body = ErrorResponse),
    )
)]
pub async fn query_get(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> ApiResult<AdUnits> {
    run_query(state, params, body).await
}

/// POST /query — Targeting query.
#[utoipa::path(
    post,
    path = "/query",
    tag = "Targeting",
    params(QueryParams),
    request_body(content = SearchQuery, description = "Targeting criteria, all optional"),
    responses(
        (status = 200, description = "Matching ad units, or a no-match message", body = AdUnits),
        (status = 400, description = "Malformed criteria or positions", body = ErrorResponse),
        (status = 500, description = "Index failure", body = ErrorResponse),
    )
)]
pub async fn query_post(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    body: Bytes,
) -> ApiResult<AdUnits> {
    run_query(state, params, body).await
}

// ---------------------------------------------------------------------------
// Ad units
// ---------------------------------------------------------------------------

/// GET /ads/:id — Fetch one ad unit as stored.
#[utoipa::path(
    get,
    path = "/ads/{id}",
    tag = "Ad units",
    params(("id" = String, Path, description = "Ad unit id")),
    responses(
        (status = 200, description = "Stored ad unit", body = AdUnit),
        (status = 404, description = "Unknown id", body = ErrorResponse),
    )
)]
pub async fn get_ad(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<AdUnit> {
    match state.index().get(&id).await {
        Ok(Some(unit)) => Ok(Json(unit)),
        Ok(None) => Err(api_error(&DeliveryError::NotFound(id))),
        Err(e) => Err(api_error(&e)),
    }
}

/// POST|PUT /ads — Normalize and upsert an ad unit. Counters and pacing state are kept.
#[utoipa::path(
    post,
    path = "/ads",
    tag = "Ad units",
    request_body = AdUnit,
    responses(
        (status = 200, description = "Normalized ad unit as written", body = AdUnit),
        (status = 400, description = "Missing id or malformed body", body = ErrorResponse),
    )
)]
pub async fn upsert_ad(State(state): State<AppState>, body: Bytes) -> ApiResult<AdUnit> {
    let unit: AdUnit = parse_body(&body)?.ok_or_else(|| bad_request("missing ad unit body"))?;
    let write = unit.into_ingest(Utc::now()).map_err(|e| {
        warn!(error = %e, "Ad unit rejected");
        api_error(&e)
    })?;

    state
        .index()
        .ingest(&write)
        .await
        .map_err(|e| api_error(&e))?;

    metrics::counter!("api.ads.upserted").increment(1);
    Ok(Json(write.unit))
}

/// DELETE /ads/:id — Remove an ad unit from the index.
#[utoipa::path(
    delete,
    path = "/ads/{id}",
    tag = "Ad units",
    params(("id" = String, Path, description = "Ad unit id")),
    responses(
        (status = 200, description = "Deleted", body = DeleteResponse),
        (status = 404, description = "Unknown id", body = ErrorResponse),
    )
)]
pub async fn delete_ad(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    match state.index().delete(&id).await {
        Ok(true) => {
            metrics::counter!("api.ads.deleted").increment(1);
            Ok(Json(DeleteResponse { id, deleted: true }))
        }
        Ok(false) => Err(api_error(&DeliveryError::NotFound(id))),
        Err(e) => Err(api_error(&e)),
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready — Readiness probe. 200 once the index answers a search.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready"),
        (status = 503, description = "Index unreachable"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.engine.high_watermark().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live — Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
    pub status: u16,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}
