// =============================================================================
// StrategyRunner — wires bar events to strategies and the position/portfolio
// services.
// =============================================================================
//
// Ported from `backend/strategy/runner.py`. Owns the strategy map and
// `MarketStateManager` directly (no locking) since it runs entirely inside
// the single ingestion task per the crate's cooperative single-writer
// concurrency model.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::json;
use tracing::error;

use crate::market_data::Bar;
use crate::services::position::PositionService;
use crate::services::portfolio::PortfolioService;
use crate::services::{ProfileMap, StreamSink};
use crate::state_manager::{BarCloseOutcome, MarketStateManager};

use super::{ConditionSet, Decision, Strategy, StrategyContext};

pub struct StrategyRunner {
    strategies: HashMap<String, Box<dyn Strategy>>,
    profiles: ProfileMap,
    state_mgr: MarketStateManager,
    position_service: Arc<PositionService>,
    portfolio: Arc<PortfolioService>,
    stream_store: Arc<dyn StreamSink>,
    last_ctx: HashMap<String, StrategyContext>,
}

impl StrategyRunner {
    pub fn new(
        strategies: HashMap<String, Box<dyn Strategy>>,
        profiles: ProfileMap,
        state_mgr: MarketStateManager,
        position_service: Arc<PositionService>,
        portfolio: Arc<PortfolioService>,
        stream_store: Arc<dyn StreamSink>,
    ) -> Self {
        Self { strategies, profiles, state_mgr, position_service, portfolio, stream_store, last_ctx: HashMap::new() }
    }

    pub fn state_mgr(&self) -> &MarketStateManager {
        &self.state_mgr
    }

    pub fn state_mgr_mut(&mut self) -> &mut MarketStateManager {
        &mut self.state_mgr
    }

    pub fn strategies(&self) -> &HashMap<String, Box<dyn Strategy>> {
        &self.strategies
    }

    /// Push initial conditions for every strategy from its warmed-up context.
    pub fn prime_from_history(&mut self, ctx_map: HashMap<String, StrategyContext>) {
        self.last_ctx = ctx_map;
        if self.last_ctx.is_empty() {
            return;
        }

        let mut cond_updates = serde_json::Map::new();
        let sids: Vec<String> = self.last_ctx.keys().cloned().collect();
        for sid in sids {
            self.fill_runtime_fields(&sid);
            let conditions = self.describe_conditions(&sid);
            cond_updates.insert(sid, serde_json::to_value(conditions).unwrap_or(json!(null)));
        }
        self.stream_store.update_snapshot(json!({ "conditions": cond_updates }));
    }

    pub fn reset_strategy(&mut self, sid: &str) {
        self.last_ctx.remove(sid);
    }

    /// Open-bar (`x=false`) update: runs realtime entry/exit hooks when a
    /// strategy's profile opts in, then republishes conditions + indicators.
    pub async fn on_kline_update(&mut self, interval: &str, bar: &Bar) {
        self.portfolio.set_last_price(bar.close);
        if interval != "15m" {
            self.stream_store.update_snapshot(json!({ "kline_15m": kline_patch(bar) }));
            return;
        }

        let preview_maps = self.state_mgr.preview_15m(bar);
        let mut patch = serde_json::Map::new();

        if let Some((_, res_map)) = preview_maps.iter().next() {
            let indicators: HashMap<String, f64> =
                res_map.iter().filter_map(|(k, r)| r.value.map(|v| (k.clone(), v))).collect();
            patch.insert("indicators_15m".to_string(), json!(indicators));
            patch.insert("kline_15m".to_string(), kline_patch(bar));
        }

        let mut cond_updates = serde_json::Map::new();
        let sids: Vec<String> = self.strategies.keys().cloned().collect();
        for sid in sids {
            self.apply_preview(&sid, bar, preview_maps.get(&sid));
            self.fill_runtime_fields(&sid);

            let Some(profile) = self.profiles.get(&sid) else { continue };
            let realtime_entry = profile.realtime_entry;
            let realtime_exit = profile.realtime_exit;
            let has_position = self.position_service.get_position(&sid).is_some();

            if realtime_entry && !has_position {
                if let Some(Decision::Entry(signal)) = self.call_on_tick(&sid, bar.close) {
                    if let Err(err) = self.position_service.open_position(&sid, &signal).await {
                        error!(strategy = %sid, %err, "open_position failed (realtime)");
                    }
                }
            } else if realtime_exit && has_position {
                if let Some(Decision::Exit(action)) = self.call_on_tick(&sid, bar.close) {
                    if let Err(err) = self.position_service.close_by_action(&sid, &action).await {
                        error!(strategy = %sid, %err, "close_by_action failed (realtime)");
                    }
                }
            }

            self.fill_runtime_fields(&sid);
            let conditions = self.describe_conditions(&sid);
            cond_updates.insert(sid, serde_json::to_value(conditions).unwrap_or(json!(null)));
        }

        if !cond_updates.is_empty() {
            patch.insert("conditions".to_string(), json!(cond_updates));
        }
        if !patch.is_empty() {
            self.stream_store.update_snapshot(serde_json::Value::Object(patch));
        }

        self.portfolio.update_status(bar.close).await;
    }

    /// Closed-bar processing: evaluate `on_bar_close` for every strategy with
    /// a ready context, then decrement cooldowns and snapshot equity.
    pub async fn on_kline_close(&mut self, bar: &Bar, outcome: BarCloseOutcome) {
        self.portfolio.set_last_price(bar.close);

        if let Some(patch) = outcome.stream_indicators_15m {
            self.stream_store.update_snapshot(json!({ "indicators_15m": patch, "kline_15m": kline_patch(bar) }));
        }
        if let Some(patch) = outcome.stream_indicators_1h {
            self.stream_store.update_snapshot(json!({ "indicators_1h": patch }));
        }

        let sids: Vec<String> = outcome.contexts.keys().cloned().collect();
        for sid in sids {
            let Some(ctx) = outcome.contexts.get(&sid).cloned() else { continue };
            self.last_ctx.insert(sid.clone(), ctx);
            self.fill_runtime_fields(&sid);

            let conditions = self.describe_conditions(&sid);
            self.stream_store.update_snapshot(json!({ "conditions": { &sid: conditions } }));

            let decision = {
                let Some(strat) = self.strategies.get_mut(&sid) else { continue };
                let Some(ctx) = self.last_ctx.get(&sid) else { continue };
                match panic::catch_unwind(AssertUnwindSafe(|| strat.on_bar_close(ctx))) {
                    Ok(decision) => decision,
                    Err(_) => {
                        error!(strategy = %sid, "on_bar_close panicked — skipping this bar for this strategy");
                        self.stream_store.add_event(json!({
                            "type": "strategy_panic", "strategy": sid, "hook": "on_bar_close",
                        }));
                        None
                    }
                }
            };

            match decision {
                Some(Decision::Entry(signal)) => {
                    if let Err(err) = self.position_service.open_position(&sid, &signal).await {
                        error!(strategy = %sid, %err, "open_position failed");
                    }
                }
                Some(Decision::Exit(action)) => {
                    if let Err(err) = self.position_service.close_by_action(&sid, &action).await {
                        error!(strategy = %sid, %err, "close_by_action failed");
                    }
                }
                None => {}
            }

            self.position_service.decrement_cooldown(&sid);
        }

        self.portfolio.update_status(bar.close).await;
        if let Err(err) = self.portfolio.snapshot_equity().await {
            error!(%err, "snapshot_equity failed");
        }
    }

    fn apply_preview(
        &mut self,
        sid: &str,
        bar: &Bar,
        preview: Option<&HashMap<String, crate::indicators::IndicatorResult>>,
    ) {
        let entry = self.last_ctx.entry(sid.to_string()).or_insert_with(|| StrategyContext {
            timestamp: bar.close_time,
            interval: "15m".to_string(),
            price: bar.close,
            close_15m: bar.close,
            low_15m: bar.low,
            high_15m: bar.high,
            indicators: HashMap::new(),
            history: HashMap::new(),
            structure_stop: None,
            position: None,
            cooldown_bars_remaining: 0,
            params: HashMap::new(),
        });
        entry.timestamp = bar.close_time;
        entry.price = bar.close;
        entry.close_15m = bar.close;
        entry.low_15m = bar.low;
        entry.high_15m = bar.high;

        if let Some(ind1) = self.state_mgr.ind_1h_for(sid) {
            entry.indicators.insert("ema20".to_string(), ind1.ema20);
            entry.indicators.insert("ema60".to_string(), ind1.ema60);
            entry.indicators.insert("rsi14".to_string(), ind1.rsi14);
        }
        if let Some(preview) = preview {
            for (k, r) in preview {
                if let Some(v) = r.value {
                    entry.indicators.insert(k.clone(), v);
                }
            }
        }
        entry.indicators.insert("close_15m".to_string(), bar.close);
    }

    fn fill_runtime_fields(&mut self, sid: &str) {
        let position = self.position_service.get_position(sid);
        let cooldown = self.position_service.get_cooldown(sid);
        let params = self.profiles.get(sid).map(|p| p.strategy_params.clone()).unwrap_or_default();
        if let Some(ctx) = self.last_ctx.get_mut(sid) {
            ctx.position = position;
            ctx.cooldown_bars_remaining = cooldown;
            ctx.params = params;
        }
    }

    fn call_on_tick(&mut self, sid: &str, price: f64) -> Option<Decision> {
        let ctx = self.last_ctx.get(sid)?.clone();
        let strat = self.strategies.get_mut(sid)?;
        match panic::catch_unwind(AssertUnwindSafe(|| strat.on_tick(&ctx, price))) {
            Ok(decision) => decision,
            Err(_) => {
                error!(strategy = %sid, "on_tick panicked — ignoring this tick");
                self.stream_store.add_event(json!({ "type": "strategy_panic", "strategy": sid, "hook": "on_tick" }));
                None
            }
        }
    }

    fn describe_conditions(&mut self, sid: &str) -> ConditionSet {
        let ind_ready = self.state_mgr.ind_1h_ready(sid);
        let has_position = self.position_service.get_position(sid).is_some();
        let cooldown = self.position_service.get_cooldown(sid);
        let Some(ctx) = self.last_ctx.get(sid).cloned() else { return ConditionSet::default() };
        let Some(strat) = self.strategies.get(sid) else { return ConditionSet::default() };
        match panic::catch_unwind(AssertUnwindSafe(|| strat.describe_conditions(&ctx, ind_ready, has_position, cooldown))) {
            Ok(conditions) => conditions,
            Err(_) => {
                error!(strategy = %sid, "describe_conditions panicked — returning default condition set");
                self.stream_store.add_event(json!({ "type": "strategy_panic", "strategy": sid, "hook": "describe_conditions" }));
                ConditionSet::default()
            }
        }
    }
}

fn kline_patch(bar: &Bar) -> serde_json::Value {
    json!({
        "t": bar.open_time, "T": bar.close_time, "o": bar.open, "h": bar.high,
        "l": bar.low, "c": bar.close, "v": bar.volume, "x": bar.is_closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::config::{AlertsConfig, MmrTier};
    use crate::db::Database;
    use crate::market_data::FuturesRestClient;
    use crate::services::{Account, AccountMap, CooldownMap, PositionMap, StatusSink, StatusSummary};
    use crate::strategy::test_strategy::TestStrategy;
    use crate::strategy::StrategyProfile;
    use parking_lot::RwLock;
    use std::sync::Mutex as StdMutex;

    struct NullStatusSink;
    impl StatusSink for NullStatusSink {
        fn update(&self, _summary: StatusSummary) {}
    }
    struct CapturingStreamSink {
        events: StdMutex<Vec<serde_json::Value>>,
    }
    impl StreamSink for CapturingStreamSink {
        fn add_event(&self, event: serde_json::Value) {
            self.events.lock().unwrap().push(event);
        }
        fn update_snapshot(&self, patch: serde_json::Value) {
            self.events.lock().unwrap().push(patch);
        }
    }

    async fn harness() -> (StrategyRunner, Arc<CapturingStreamSink>) {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        db.init_schema().await.unwrap();
        let alert = Arc::new(AlertManager::new(db.clone(), AlertsConfig { enabled: false, ..Default::default() }));
        let positions: PositionMap = Arc::new(RwLock::new(HashMap::new()));
        let accounts: AccountMap = Arc::new(RwLock::new(HashMap::from([("default".to_string(), Account::new(1000.0))])));
        let cooldowns: CooldownMap = Arc::new(RwLock::new(HashMap::new()));
        let profile = StrategyProfile {
            max_leverage: 20.0,
            fee_rate: 0.0004,
            max_position_notional: 20_000.0,
            max_position_pct_equity: 1.0,
            cooldown_after_stop: 4,
            mmr_tiers: vec![MmrTier { notional_usdt: 1_000_000_000.0, mmr: 0.004, maint_amount: 0.0 }],
            ..Default::default()
        };
        let profiles: ProfileMap = Arc::new(HashMap::from([("default".to_string(), profile)]));
        let rest = FuturesRestClient::new("https://fapi.binance.com".to_string());
        let portfolio = Arc::new(PortfolioService::new(
            db.clone(), alert.clone(), accounts.clone(), positions.clone(), cooldowns.clone(),
            profiles.clone(), vec!["default".to_string()], Arc::new(NullStatusSink),
            "BTCUSDT".to_string(), rest,
        ));
        let stream = Arc::new(CapturingStreamSink { events: StdMutex::new(Vec::new()) });
        let position_service = Arc::new(PositionService::new(
            db, alert, stream.clone(), accounts, positions, cooldowns, profiles.clone(), portfolio.clone(),
            "BTCUSDT".to_string(),
        ));

        let mut state_mgr = MarketStateManager::new();
        let strat = TestStrategy::new("default");
        state_mgr.register_strategy("default", &strat);

        let mut strategies: HashMap<String, Box<dyn Strategy>> = HashMap::new();
        strategies.insert("default".to_string(), Box::new(strat));

        let runner = StrategyRunner::new(strategies, profiles, state_mgr, position_service, portfolio, stream.clone());
        (runner, stream)
    }

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar { open_time, close_time: open_time + 899_999, open: close, high: close + 1.0, low: close - 1.0, close, volume: 1.0, trades: 1, is_closed: true }
    }

    #[tokio::test]
    async fn on_kline_close_publishes_conditions_for_every_context() {
        let (mut runner, stream) = harness().await;
        let outcome = runner.state_mgr_mut().on_kline_close("15m", &bar(0, 100.0));
        runner.on_kline_close(&bar(0, 100.0), outcome).await;
        assert!(!stream.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_strategy_clears_cached_context() {
        let (mut runner, _stream) = harness().await;
        let outcome = runner.state_mgr_mut().on_kline_close("15m", &bar(0, 100.0));
        runner.on_kline_close(&bar(0, 100.0), outcome).await;
        assert!(runner.last_ctx.contains_key("default"));
        runner.reset_strategy("default");
        assert!(!runner.last_ctx.contains_key("default"));
    }
}
