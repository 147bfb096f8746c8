// =============================================================================
// perpsim-engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Operators must
// explicitly switch to Live trading via the control API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod config;
mod db;
mod indicators;
mod market_data;
mod models;
mod runtime_config;
mod services;
mod state_manager;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertManager;
use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::db::Database;
use crate::market_data::{run_bar_stream, BarUpdate, FuturesRestClient};
use crate::models::Kline;
use crate::runtime_config::RuntimeConfig;
use crate::services::portfolio::PortfolioService;
use crate::services::position::PositionService;
use crate::services::{
    Account, AccountMap, CooldownMap, PositionMap, ProfileMap, StatusSink, StatusSummary, StreamSink,
};
use crate::state_manager::MarketStateManager;
use crate::strategy::runner::StrategyRunner;
use crate::strategy::{registry, Strategy, StrategyProfile};
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "config.yaml";
const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

/// Forwards to `AppState` through a weak handle, closing the
/// `PortfolioService`/`PositionService`/`StrategyRunner` <-> `AppState`
/// construction cycle — those services need a sink before `AppState` itself
/// can exist, so they hold a `Weak` reference instead of the `Arc` directly.
struct WeakSink(std::sync::Weak<AppState>);

impl StatusSink for WeakSink {
    fn update(&self, summary: StatusSummary) {
        if let Some(state) = self.0.upgrade() {
            state.update(summary);
        }
    }
}

impl StreamSink for WeakSink {
    fn add_event(&self, event: serde_json::Value) {
        if let Some(state) = self.0.upgrade() {
            state.add_event(event);
        }
    }
    fn update_snapshot(&self, patch: serde_json::Value) {
        if let Some(state) = self.0.upgrade() {
            state.update_snapshot(patch);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment, logging, config ──────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perpsim-engine starting up");

    let app_config = Arc::new(AppConfig::load(CONFIG_PATH)?);

    let mut runtime_config = RuntimeConfig::load(RUNTIME_CONFIG_PATH).unwrap_or_else(|err| {
        warn!(error = %err, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });
    // Always come up paused in demo mode; an operator re-arms explicitly via
    // the control API.
    runtime_config.trading_mode = TradingMode::Paused;
    runtime_config.account_mode = AccountMode::Demo;

    info!(
        trading_mode = %runtime_config.trading_mode,
        account_mode = %runtime_config.account_mode,
        symbol = %app_config.binance.symbol,
        "starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Storage, alerts ────────────────────────────────────────────────
    let db = Arc::new(Database::connect(&app_config.storage.sqlite_path).await?);
    db.init_schema().await?;
    let alert = Arc::new(AlertManager::new(db.clone(), app_config.alerts.clone()));

    // ── 3. Strategies + profiles from config ─────────────────────────────
    let mut strategies: HashMap<String, Box<dyn Strategy>> = HashMap::new();
    let mut profiles_map: HashMap<String, StrategyProfile> = HashMap::new();
    let mut strategy_order: Vec<String> = Vec::new();

    for entry in &app_config.strategies {
        let (strategy_defaults, indicator_defaults) = registry::get_strategy_defaults(&entry.r#type)
            .ok_or_else(|| anyhow::anyhow!("unknown strategy type '{}' for id '{}'", entry.r#type, entry.id))?;
        let profile = strategy::profile_from_config(&app_config, entry, &strategy_defaults, &indicator_defaults)?;
        let mut strat = registry::create_strategy(&entry.r#type, &entry.id)
            .ok_or_else(|| anyhow::anyhow!("failed to instantiate strategy '{}'", entry.id))?;
        strat.configure(profile.clone());

        strategy_order.push(entry.id.clone());
        profiles_map.insert(entry.id.clone(), profile);
        strategies.insert(entry.id.clone(), strat);
    }

    if strategies.is_empty() {
        anyhow::bail!("no strategies configured");
    }
    info!(strategies = ?strategy_order, "strategies configured");

    let profiles: ProfileMap = Arc::new(profiles_map.clone());

    let accounts: AccountMap = Arc::new(RwLock::new(
        profiles.iter().map(|(id, p)| (id.clone(), Account::new(p.initial_capital))).collect(),
    ));
    let positions: PositionMap = Arc::new(RwLock::new(HashMap::new()));
    let cooldowns: CooldownMap = Arc::new(RwLock::new(strategy_order.iter().map(|id| (id.clone(), 0i64)).collect()));

    // ── 4. Market state: register strategies, size buffers, warm up ──────
    let mut state_mgr = MarketStateManager::new();
    for (id, strat) in &strategies {
        state_mgr.register_strategy(id, strat.as_ref());
    }

    let warmup = MarketStateManager::compute_warmup(
        &strategies,
        &profiles_map,
        app_config.kline_cache.warmup_buffer_mult,
        app_config.kline_cache.warmup_extra_bars,
        app_config.kline_cache.max_bars_15m,
        app_config.kline_cache.max_bars_1h,
    );
    state_mgr.set_buffer_capacity("15m", warmup.buffer_capacity["15m"]);
    state_mgr.set_buffer_capacity("1h", warmup.buffer_capacity["1h"]);

    let rest_client = FuturesRestClient::new(app_config.binance.rest_base.clone());
    let symbol = app_config.binance.symbol.clone();

    for interval in ["15m", "1h"] {
        let bars_needed = warmup.warmup_bars.get(interval).copied().unwrap_or(500).min(1500) as u32;
        match rest_client.get_klines(&symbol, interval, bars_needed, None).await {
            Ok(bars) => {
                info!(interval, count = bars.len(), "warmup klines fetched");
                for bar in &bars {
                    if let Err(err) = db.upsert_kline(&Kline {
                        symbol: symbol.clone(),
                        interval: interval.to_string(),
                        open_time: bar.open_time,
                        close_time: bar.close_time,
                        open: bar.open,
                        high: bar.high,
                        low: bar.low,
                        close: bar.close,
                        volume: bar.volume,
                        trades: bar.trades,
                        is_closed: true,
                        source: "rest_warmup".to_string(),
                        created_at: chrono::Utc::now().timestamp_millis(),
                    }).await {
                        warn!(%err, interval, "failed to persist warmup kline");
                    }
                }
                state_mgr.load_warmup_bars(interval, &bars);
            }
            Err(err) => warn!(%err, interval, "warmup kline fetch failed — starting with an empty buffer"),
        }
    }
    let prime_snapshot = state_mgr.prime_from_history();
    info!(
        last_close = ?prime_snapshot.last_bar_15m.map(|b| b.close),
        "indicator warmup complete"
    );

    // ── 5. Services + AppState (cyclic via Weak sinks) ───────────────────
    // Pulled out before the `move` closure below consumes `app_config`/`symbol`.
    let ws_base = app_config.binance.ws_base.clone();
    let intervals = app_config.binance.intervals.clone();
    let bind_addr = format!("{}:{}", app_config.api.host, app_config.api.port);
    let ingest_symbol = symbol.clone();
    let stream_symbol = symbol.clone();

    let app_state = Arc::new_cyclic(move |weak: &std::sync::Weak<AppState>| {
        let status_sink: Arc<dyn StatusSink> = Arc::new(WeakSink(weak.clone()));
        let stream_sink: Arc<dyn StreamSink> = Arc::new(WeakSink(weak.clone()));

        let portfolio = Arc::new(PortfolioService::new(
            db.clone(),
            alert.clone(),
            accounts.clone(),
            positions.clone(),
            cooldowns.clone(),
            profiles.clone(),
            strategy_order.clone(),
            status_sink,
            symbol.clone(),
            rest_client.clone(),
        ));

        let position_service = Arc::new(PositionService::new(
            db.clone(),
            alert.clone(),
            stream_sink.clone(),
            accounts.clone(),
            positions.clone(),
            cooldowns.clone(),
            profiles.clone(),
            portfolio.clone(),
            symbol.clone(),
        ));

        let runner = Arc::new(AsyncMutex::new(StrategyRunner::new(
            strategies,
            profiles.clone(),
            state_mgr,
            position_service.clone(),
            portfolio.clone(),
            stream_sink,
        )));

        AppState::new(
            db.clone(),
            app_config.clone(),
            runtime_config,
            RUNTIME_CONFIG_PATH,
            accounts,
            positions,
            cooldowns,
            profiles,
            portfolio,
            position_service,
            runner,
        )
    });

    // ── 6. Recover persisted state ───────────────────────────────────────
    app_state.portfolio().load_account_state().await?;
    app_state.position_service().load_open_positions().await?;
    info!("account state and open positions recovered from storage");

    // ── 7. Bar ingestion task ─────────────────────────────────────────────
    let (bar_tx, mut bar_rx) = mpsc::channel::<BarUpdate>(256);
    {
        let ws_base = ws_base.clone();
        let sym = stream_symbol.clone();
        let intervals = intervals.clone();
        tokio::spawn(async move {
            let interval_refs: Vec<&str> = intervals.iter().map(String::as_str).collect();
            loop {
                if let Err(err) = run_bar_stream(&ws_base, &sym, &interval_refs, bar_tx.clone()).await {
                    error!(%err, symbol = %sym, "bar ingestion stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    {
        let ingest_state = app_state.clone();
        let ingest_symbol = ingest_symbol.clone();
        tokio::spawn(async move {
            while let Some(update) = bar_rx.recv().await {
                let mode = ingest_state.runtime_config.read().trading_mode;
                if mode == TradingMode::Killed {
                    continue;
                }

                let mut runner = ingest_state.runner().lock().await;
                if update.bar.is_closed {
                    let outcome = runner.state_mgr_mut().on_kline_close(&update.interval, &update.bar);
                    runner.on_kline_close(&update.bar, outcome).await;

                    if let Err(err) = ingest_state.db.upsert_kline(&Kline {
                        symbol: ingest_symbol.clone(),
                        interval: update.interval.clone(),
                        open_time: update.bar.open_time,
                        close_time: update.bar.close_time,
                        open: update.bar.open,
                        high: update.bar.high,
                        low: update.bar.low,
                        close: update.bar.close,
                        volume: update.bar.volume,
                        trades: update.bar.trades,
                        is_closed: true,
                        source: "ws".to_string(),
                        created_at: chrono::Utc::now().timestamp_millis(),
                    }).await {
                        ingest_state.push_error("db", format!("failed to persist closed kline: {err}"));
                    }
                } else {
                    runner.on_kline_update(&update.interval, &update.bar).await;
                }
            }
            warn!("bar ingestion channel closed — ingestion task exiting");
        });
    }

    // ── 8. Funding settlement loop ────────────────────────────────────────
    {
        let funding_portfolio = app_state.portfolio();
        tokio::spawn(async move {
            funding_portfolio.funding_loop().await;
        });
    }

    // ── 9. HTTP/WS API server ─────────────────────────────────────────────
    {
        let api_state = app_state.clone();
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(%err, addr = %addr, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %addr, "API server listening");
            if let Err(err) = axum::serve(listener, app).await {
                error!(%err, "API server terminated");
            }
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(err) = app_state.save_runtime_config() {
        error!(%err, "failed to save runtime config on shutdown");
    }
    app_state.db.close().await;

    info!("perpsim-engine shut down complete");
    Ok(())
}
