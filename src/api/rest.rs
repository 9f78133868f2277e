// =============================================================================
// REST endpoints — Axum 0.7
// =============================================================================
//
// Everything here is a thin wrapper: SQL through the repository, reads from
// the in-memory state map, and the backfill scheduler handle. No PnL is ever
// computed in a handler — the figures come from snapshots the core wrote,
// with a `data_status` provenance block attached.
//
// CORS is permissive for development; tighten allowed origins in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::ingest::gaps::{self, Confidence, DataStatus, PnlSource};
use crate::pnl::stats::{calculate_summary_stats, SummaryStats};
use crate::types::{DiscoverySource, PnlSnapshot, Position, Trader};
use crate::upstream::messages::portfolio_period_pnl;
use crate::upstream::normalize_address;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/pnl/:address", get(pnl_history))
        .route("/api/v1/positions/:address", get(positions))
        .route("/api/v1/traders/:address/subscribe", post(subscribe))
        .route("/api/v1/traders/:address/unsubscribe", post(unsubscribe))
        .route(
            "/api/v1/traders/:address/backfill",
            post(schedule_backfill).get(backfill_status),
        )
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error plumbing
// =============================================================================

/// Uniform error body. Internal failures log and return 500; bad addresses
/// return 400.
struct ApiError(StatusCode, String);

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        warn!(error = %err, "api request failed");
        Self(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    }

    fn bad_address(raw: &str) -> Self {
        Self(
            StatusCode::BAD_REQUEST,
            format!("invalid address: {raw}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.0, Json(serde_json::json!({"error": self.1}))).into_response()
    }
}

fn normalize_or_400(raw: &str) -> Result<String, ApiError> {
    normalize_address(raw).map_err(|_| ApiError::bad_address(raw))
}

// =============================================================================
// Health & stats
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

async fn health(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: app.start_time.elapsed().as_secs(),
    })
}

async fn stats(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(app.stats())
}

// =============================================================================
// PnL history
// =============================================================================

#[derive(Debug, Deserialize)]
struct PnlQuery {
    /// Window start, epoch milliseconds. Default: `days` before `to`.
    from: Option<i64>,
    /// Window end, epoch milliseconds. Default: now.
    to: Option<i64>,
    /// Convenience window when `from` is absent.
    days: Option<u32>,
    /// When set, cross-check the result against the upstream `perpMonth`
    /// portfolio figure and downgrade confidence on discrepancy.
    #[serde(default)]
    verify: bool,
}

#[derive(Serialize)]
struct PnlResponse {
    address: String,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    history: Vec<PnlSnapshot>,
    summary: SummaryStats,
    /// Present only when the window has no snapshots and the upstream
    /// portfolio figure is served instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_portfolio_pnl: Option<rust_decimal::Decimal>,
    data_status: DataStatus,
}

async fn pnl_history(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
    Query(query): Query<PnlQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;

    let to = query
        .to
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    let from = query
        .from
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(|| to - ChronoDuration::days(i64::from(query.days.unwrap_or(30))));

    let trader = ensure_trader(&app, &address)
        .await
        .map_err(ApiError::internal)?;

    let history = app
        .db
        .snapshots_in_range(trader.id, from, to)
        .await
        .map_err(ApiError::internal)?;

    // Upstream fallback: with nothing of our own to serve, the portfolio
    // summary is authoritative and tagged as such.
    let (source, upstream_portfolio_pnl) = if history.is_empty() {
        let pnl = match app.info.portfolio(&address).await {
            Ok(portfolio) => portfolio_period_pnl(&portfolio, "allTime").unwrap_or(None),
            Err(e) => {
                warn!(address = %address, error = %e, "portfolio fallback failed");
                None
            }
        };
        (PnlSource::UpstreamPortfolio, pnl)
    } else {
        (PnlSource::OurCalculation, None)
    };

    let mut data_status = gaps::data_status(&app.db, &trader, from, to, source)
        .await
        .map_err(ApiError::internal)?;

    let pnl_values: Vec<rust_decimal::Decimal> =
        history.iter().map(|s| s.total_pnl).collect();
    let summary = calculate_summary_stats(&pnl_values);

    if query.verify {
        verify_against_portfolio(&app, &address, &history, &mut data_status).await;
    }

    Ok(Json(PnlResponse {
        address,
        from,
        to,
        history,
        summary,
        upstream_portfolio_pnl,
        data_status,
    }))
}

/// Acceptance cross-check: our realized figure over the last month must sit
/// within 1 ‰ of the upstream's `perpMonth` number; a larger discrepancy is
/// surfaced as low confidence with the cause named.
async fn verify_against_portfolio(
    app: &Arc<AppState>,
    address: &str,
    history: &[PnlSnapshot],
    data_status: &mut DataStatus,
) {
    let Some(latest) = history.last() else { return };
    let portfolio = match app.info.portfolio(address).await {
        Ok(p) => p,
        Err(e) => {
            warn!(address, error = %e, "portfolio verification fetch failed");
            return;
        }
    };
    let Ok(Some(upstream)) = portfolio_period_pnl(&portfolio, "perpMonth") else {
        return;
    };
    if let Some(cause) = gaps::portfolio_discrepancy(latest.realized_pnl, upstream) {
        data_status.confidence = Confidence::Low;
        data_status.confidence_reason = cause;
    }
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Serialize)]
struct PositionsResponse {
    address: String,
    positions: Vec<Position>,
    unrealized_pnl: rust_decimal::Decimal,
    total_pnl: rust_decimal::Decimal,
    last_updated: DateTime<Utc>,
}

async fn positions(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;

    match app.store.get(&address) {
        Some(state) => {
            let mut positions: Vec<Position> = state.positions.values().cloned().collect();
            positions.sort_by(|a, b| a.coin.cmp(&b.coin));
            Ok(Json(PositionsResponse {
                address,
                positions,
                unrealized_pnl: state.unrealized_pnl(),
                total_pnl: state.total_pnl(),
                last_updated: state.last_updated,
            })
            .into_response())
        }
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "trader not tracked"})),
        )
            .into_response()),
    }
}

// =============================================================================
// Subscribe / unsubscribe
// =============================================================================

async fn subscribe(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;

    let trader = app
        .db
        .upsert_trader(&address, &DiscoverySource::Manual.to_string())
        .await
        .map_err(ApiError::internal)?;
    app.db
        .set_trader_active(&address, true)
        .await
        .map_err(ApiError::internal)?;

    app.store.initialize(trader.id, &address);
    let mode = app
        .hybrid
        .subscribe(&address)
        .await
        .map_err(|e| ApiError::internal(e.into()))?;
    let (job_id, scheduled) = app
        .backfill
        .schedule(trader.id, &address, app.config.backfill_days)
        .await
        .map_err(ApiError::internal)?;

    info!(address = %address, ?mode, "trader subscribed via api");
    Ok(Json(serde_json::json!({
        "address": address,
        "delivery": format!("{mode:?}"),
        "backfill_job": job_id,
        "backfill_scheduled": scheduled,
    })))
}

async fn unsubscribe(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;

    app.hybrid.unsubscribe(&address).await;
    app.db
        .set_trader_active(&address, false)
        .await
        .map_err(ApiError::internal)?;

    info!(address = %address, "trader unsubscribed via api");
    Ok(Json(serde_json::json!({"address": address, "active": false})))
}

// =============================================================================
// Backfill
// =============================================================================

#[derive(Debug, Deserialize)]
struct BackfillRequest {
    days: Option<u32>,
}

async fn schedule_backfill(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
    body: Option<Json<BackfillRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;
    let days = body
        .and_then(|Json(b)| b.days)
        .unwrap_or(app.config.backfill_days);

    let trader = ensure_trader(&app, &address)
        .await
        .map_err(ApiError::internal)?;
    let (job_id, scheduled) = app
        .backfill
        .schedule(trader.id, &address, days)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(serde_json::json!({
        "job_id": job_id,
        "scheduled": scheduled,
        "days": days,
    })))
}

async fn backfill_status(
    State(app): State<Arc<AppState>>,
    Path(raw_address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let address = normalize_or_400(&raw_address)?;
    let status = app
        .backfill
        .status(&address)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(status))
}

// =============================================================================
// Helpers
// =============================================================================

/// First observation through the API creates the trader row and queues the
/// address for auto-subscription, the same as a market-trade discovery.
async fn ensure_trader(app: &Arc<AppState>, address: &str) -> anyhow::Result<Trader> {
    if let Some(trader) = app.db.get_trader(address).await? {
        return Ok(trader);
    }
    let trader = app
        .db
        .upsert_trader(address, &DiscoverySource::ApiRequest.to_string())
        .await?;
    app.db
        .enqueue_discoveries(&[(address.to_string(), DiscoverySource::ApiRequest, 1)])
        .await?;
    info!(address = %address, "trader created on api demand");
    Ok(trader)
}
