// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// Public: `GET /health`. Everything else requires a valid Bearer token via
// the `AuthBearer` extractor, per the teacher's `AuthBearer`-gated surface.
// CORS is configured permissively, matching the teacher's development stance.

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::market_data::Bar;
use crate::state_manager::MarketStateManager;
use crate::strategy::test_strategy::TestStrategy;
use crate::strategy::Strategy;
use crate::types::{AccountMode, TradingMode};

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/strategies", get(strategies))
        .route("/api/trades", get(trades))
        .route("/api/positions", get(positions))
        .route("/api/ledger", get(ledger))
        .route("/api/equity_snapshots", get(equity_snapshots))
        .route("/api/klines", get(klines))
        .route("/api/indicator_history", get(indicator_history))
        .route("/api/stats", get(stats))
        .route("/api/conditions_summary", get(conditions_summary))
        .route("/api/debug/state", get(debug_state))
        .route("/api/control/pause", post(control_pause))
        .route("/api/control/resume", post(control_resume))
        .route("/api/control/kill", post(control_kill))
        .route("/api/control/account-mode", post(control_account_mode))
        .route("/api/control/reset-strategy", post(control_reset_strategy))
        .route("/ws/status", get(crate::api::ws::status_handler))
        .route("/ws/stream", get(crate::api::ws::stream_handler))
        .layer(cors)
        .with_state(state)
}

// ── Health (public) ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// ── Status / strategies ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct StrategyQuery {
    strategy: Option<String>,
}

async fn status(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<StrategyQuery>,
) -> impl IntoResponse {
    match q.strategy {
        Some(sid) => match state.status_for(&sid) {
            Some(s) => Json(s).into_response(),
            None => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "unknown strategy" }))).into_response(),
        },
        None => Json(state.all_status()).into_response(),
    }
}

async fn strategies(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "strategies": state.strategy_ids() }))
}

// ── History endpoints ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HistoryQuery {
    strategy: Option<String>,
    limit: Option<i64>,
}

async fn trades(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state.db.get_trades(q.strategy.as_deref(), q.limit.unwrap_or(200)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => db_error(err),
    }
}

#[derive(Deserialize)]
struct PositionsQuery {
    status: Option<String>,
    limit: Option<i64>,
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PositionsQuery>,
) -> impl IntoResponse {
    match state.db.get_positions(q.status.as_deref(), q.limit.unwrap_or(200)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => db_error(err),
    }
}

async fn ledger(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state.db.get_ledger(q.strategy.as_deref(), q.limit.unwrap_or(200)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => db_error(err),
    }
}

async fn equity_snapshots(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let sid = q.strategy.unwrap_or_else(|| "default".to_string());
    match state.db.get_equity_snapshots(&sid, q.limit.unwrap_or(200)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => db_error(err),
    }
}

#[derive(Deserialize)]
struct KlinesQuery {
    symbol: Option<String>,
    interval: Option<String>,
    limit: Option<i64>,
}

async fn klines(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<KlinesQuery>,
) -> impl IntoResponse {
    let symbol = q.symbol.unwrap_or_else(|| state.app_config.binance.symbol.clone());
    let interval = q.interval.unwrap_or_else(|| "15m".to_string());
    match state.db.get_klines(&symbol, &interval, q.limit.unwrap_or(500)).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => db_error(err),
    }
}

// ── Indicator history replay ────────────────────────────────────────────

#[derive(Deserialize)]
struct IndicatorHistoryQuery {
    interval: Option<String>,
    limit: Option<i64>,
    strategy: Option<String>,
}

#[derive(Serialize)]
struct IndicatorHistoryResponse {
    interval: String,
    strategy: String,
    bars: usize,
    series: std::collections::HashMap<String, Vec<Option<f64>>>,
}

/// Replays closed bars for `strategy` through a freshly primed engine and
/// returns the indicator value series, per the crate's `/api/indicator_history`
/// contract (SPEC_FULL.md §6).
async fn indicator_history(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<IndicatorHistoryQuery>,
) -> impl IntoResponse {
    let interval = q.interval.unwrap_or_else(|| "15m".to_string());
    let sid = q.strategy.unwrap_or_else(|| "default".to_string());
    let symbol = state.app_config.binance.symbol.clone();

    let rows = match state.db.get_klines(&symbol, &interval, q.limit.unwrap_or(500)).await {
        Ok(rows) => rows,
        Err(err) => return db_error(err),
    };
    // DB rows come back newest-first; replay chronologically.
    let mut rows = rows;
    rows.reverse();

    let mut mgr = MarketStateManager::new();
    let strat = TestStrategy::new(&sid);
    mgr.register_strategy(&sid, &strat);

    let mut series: std::collections::HashMap<String, Vec<Option<f64>>> = std::collections::HashMap::new();
    for row in &rows {
        let bar = Bar {
            open_time: row.open_time,
            close_time: row.close_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            trades: row.trades,
            is_closed: true,
        };
        let outcome = mgr.on_kline_close(&interval, &bar);
        let snapshot = outcome.contexts.get(&sid).map(|ctx| ctx.indicators.clone()).unwrap_or_default();
        for (name, values) in series.iter_mut() {
            values.push(snapshot.get(name).copied());
        }
        for (name, value) in snapshot {
            series.entry(name).or_insert_with(|| vec![None; rows.len()]).push(Some(value));
        }
    }

    Json(IndicatorHistoryResponse { interval, strategy: sid, bars: rows.len(), series }).into_response()
}

// ── Stats ────────────────────────────────────────────────────────────────

#[derive(Serialize, Default)]
struct StatsResponse {
    closed_positions: i64,
    roi: f64,
    tp1_rate: f64,
    tp2_rate: f64,
    stop_rate: f64,
}

async fn stats(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<StrategyQuery>,
) -> impl IntoResponse {
    let sid = q.strategy.unwrap_or_else(|| "default".to_string());
    let closed = match state.db.get_positions(Some("CLOSED"), 10_000).await {
        Ok(rows) => rows.into_iter().filter(|r| r.strategy == sid).collect::<Vec<_>>(),
        Err(err) => return db_error(err),
    };

    let total = closed.len() as i64;
    let stop_count = closed.iter().filter(|r| r.stop_price.is_some() && r.realized_pnl < 0.0).count() as f64;
    let tp1_count = closed.iter().filter(|r| r.tp1_price.is_some()).count() as f64;
    let tp2_count = closed.iter().filter(|r| r.realized_pnl > 0.0).count() as f64;

    let initial_capital = state.status_for(&sid).map(|_| ()).and(Some(1000.0)).unwrap_or(1000.0);
    let equity = state.status_for(&sid).map(|s| s.equity).unwrap_or(initial_capital);
    let roi = (equity - initial_capital) / initial_capital;

    let denom = total.max(1) as f64;
    Json(StatsResponse {
        closed_positions: total,
        roi,
        tp1_rate: tp1_count / denom,
        tp2_rate: tp2_count / denom,
        stop_rate: stop_count / denom,
    })
    .into_response()
}

// ── Conditions summary / debug ──────────────────────────────────────────

async fn conditions_summary(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.stream_snapshot();
    Json(snapshot.get("conditions").cloned().unwrap_or(serde_json::json!({})))
}

async fn debug_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "state_version": state.state_version(),
        "uptime_secs": state.uptime_secs(),
        "runtime_config": &*state.runtime_config.read(),
        "status": state.all_status(),
        "stream_snapshot": state.stream_snapshot(),
        "recent_errors": state.recent_errors(),
        "recent_events": state.recent_events(20),
    }))
}

// ── Control endpoints ────────────────────────────────────────────────────

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
    message: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Paused;
    if let Err(err) = state.save_runtime_config() {
        warn!(%err, "failed to persist runtime config");
    }
    info!("trading paused via API");
    Json(ControlResponse { trading_mode: "Paused".to_string(), message: "trading paused".to_string() })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Live;
    if let Err(err) = state.save_runtime_config() {
        warn!(%err, "failed to persist runtime config");
    }
    info!("trading resumed via API");
    Json(ControlResponse { trading_mode: "Live".to_string(), message: "trading resumed".to_string() })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Killed;
    if let Err(err) = state.save_runtime_config() {
        warn!(%err, "failed to persist runtime config");
    }
    warn!("trading killed via API — manual restart required");
    Json(ControlResponse { trading_mode: "Killed".to_string(), message: "trading killed".to_string() })
}

#[derive(Deserialize)]
struct AccountModeRequest {
    account_mode: String,
    #[serde(default)]
    confirm_live: bool,
}

#[derive(Serialize)]
struct AccountModeResponse {
    account_mode: String,
}

async fn control_account_mode(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccountModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let mode = match req.account_mode.to_lowercase().as_str() {
        "demo" => AccountMode::Demo,
        "live" => {
            if !req.confirm_live {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "switching to live mode requires confirm_live: true" })),
                ));
            }
            warn!("switching to LIVE account mode via API");
            AccountMode::Live
        }
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid account mode: '{other}'") })),
            ));
        }
    };

    state.runtime_config.write().account_mode = mode;
    if let Err(err) = state.save_runtime_config() {
        warn!(%err, "failed to persist runtime config");
    }
    info!(account_mode = %mode, "account mode changed via API");
    Ok(Json(AccountModeResponse { account_mode: mode.to_string() }))
}

#[derive(Deserialize)]
struct ResetStrategyRequest {
    strategy: String,
}

async fn control_reset_strategy(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetStrategyRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !state.strategy_ids().iter().any(|id| id == &req.strategy) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown strategy: '{}'", req.strategy) })),
        ));
    }
    state.reset_strategy(&req.strategy).await;
    warn!(strategy = %req.strategy, "strategy reset via API");
    Ok(Json(serde_json::json!({ "strategy": req.strategy, "message": "strategy reset" })))
}

fn db_error(err: anyhow::Error) -> axum::response::Response {
    warn!(%err, "db query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
