// =============================================================================
// AppState — the process-wide shared handle.
// =============================================================================
//
// Holds the DB pool, the narrow `RuntimeConfig`, the per-strategy status
// store, and the merged stream snapshot + bounded event log pushed to
// `/ws/stream` clients. Implements `StatusSink`/`StreamSink` (see
// `services::mod`) so `services`/`strategy::runner` never depend on this
// module — the same separation the teacher draws between its execution
// engine and dashboard state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::error;

use crate::config::AppConfig;
use crate::db::Database;
use crate::runtime_config::RuntimeConfig;
use crate::services::portfolio::PortfolioService;
use crate::services::position::PositionService;
use crate::services::{Account, AccountMap, CooldownMap, PositionMap, ProfileMap, StatusSink, StatusSummary, StreamSink};
use crate::strategy::runner::StrategyRunner;

const MAX_RECENT_ERRORS: usize = 50;
const MAX_STREAM_EVENTS: usize = 200;

/// One caught strategy-hook panic or propagated service error, surfaced via
/// `/api/debug/state`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    pub scope: String,
    pub message: String,
}

pub struct AppState {
    pub db: Arc<Database>,
    pub app_config: Arc<AppConfig>,
    pub runtime_config: RwLock<RuntimeConfig>,
    pub runtime_config_path: String,

    accounts: AccountMap,
    positions: PositionMap,
    cooldowns: CooldownMap,
    profiles: ProfileMap,
    portfolio: Arc<PortfolioService>,
    position_service: Arc<PositionService>,
    runner: Arc<AsyncMutex<StrategyRunner>>,

    status: RwLock<HashMap<String, StatusSummary>>,
    stream_snapshot: RwLock<Json>,
    stream_events: RwLock<VecDeque<Json>>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,

    state_version: AtomicU64,
    ws_sequence_number: AtomicU64,
    start_time: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        app_config: Arc<AppConfig>,
        runtime_config: RuntimeConfig,
        runtime_config_path: impl Into<String>,
        accounts: AccountMap,
        positions: PositionMap,
        cooldowns: CooldownMap,
        profiles: ProfileMap,
        portfolio: Arc<PortfolioService>,
        position_service: Arc<PositionService>,
        runner: Arc<AsyncMutex<StrategyRunner>>,
    ) -> Self {
        Self {
            db,
            app_config,
            runtime_config: RwLock::new(runtime_config),
            runtime_config_path: runtime_config_path.into(),
            accounts,
            positions,
            cooldowns,
            profiles,
            portfolio,
            position_service,
            runner,
            status: RwLock::new(HashMap::new()),
            stream_snapshot: RwLock::new(json!({})),
            stream_events: RwLock::new(VecDeque::new()),
            recent_errors: RwLock::new(VecDeque::new()),
            state_version: AtomicU64::new(0),
            ws_sequence_number: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn status_for(&self, strategy: &str) -> Option<StatusSummary> {
        self.status.read().get(strategy).cloned()
    }

    pub fn all_status(&self) -> HashMap<String, StatusSummary> {
        self.status.read().clone()
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    pub fn stream_snapshot(&self) -> Json {
        self.stream_snapshot.read().clone()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Json> {
        self.stream_events.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn next_ws_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }

    pub fn portfolio(&self) -> Arc<PortfolioService> {
        self.portfolio.clone()
    }

    pub fn position_service(&self) -> Arc<PositionService> {
        self.position_service.clone()
    }

    pub fn runner(&self) -> Arc<AsyncMutex<StrategyRunner>> {
        self.runner.clone()
    }

    /// Record a caught strategy-hook panic or a non-fatal service error
    /// without aborting the ingestion task that found it.
    pub fn push_error(&self, scope: &str, message: impl Into<String>) {
        let record = ErrorRecord {
            timestamp: chrono::Utc::now().timestamp_millis(),
            scope: scope.to_string(),
            message: message.into(),
        };
        error!(scope = %record.scope, message = %record.message, "recorded error");
        let mut errors = self.recent_errors.write();
        errors.push_back(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        self.bump_version();
    }

    fn bump_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn save_runtime_config(&self) -> Result<()> {
        self.runtime_config.read().save(&self.runtime_config_path)
    }

    /// Clear a strategy's position and cooldown, reset its account to its
    /// configured initial capital, and republish status — the crate's
    /// resolved decision for `reset_strategy` (see DESIGN.md).
    pub async fn reset_strategy(&self, sid: &str) {
        let initial_capital = self.profiles.get(sid).map(|p| p.initial_capital).unwrap_or(1000.0);

        self.positions.write().insert(sid.to_string(), None);
        self.cooldowns.write().insert(sid.to_string(), 0);
        if let Some(acc) = self.accounts.write().get_mut(sid) {
            *acc = Account::new(initial_capital);
        }

        self.runner.lock().await.reset_strategy(sid);
        self.portfolio.update_status(self.portfolio.get_last_price()).await;
        self.bump_version();
    }
}

impl StatusSink for AppState {
    fn update(&self, summary: StatusSummary) {
        self.status.write().insert(summary.strategy.clone(), summary);
        self.bump_version();
    }
}

impl StreamSink for AppState {
    fn add_event(&self, event: Json) {
        let mut events = self.stream_events.write();
        events.push_back(event);
        while events.len() > MAX_STREAM_EVENTS {
            events.pop_front();
        }
        self.bump_version();
    }

    fn update_snapshot(&self, patch: Json) {
        {
            let mut snapshot = self.stream_snapshot.write();
            match (&mut *snapshot, &patch) {
                (Json::Object(existing), Json::Object(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => *snapshot = patch,
            }
        }
        self.bump_version();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::config::AlertsConfig;
    use crate::market_data::FuturesRestClient;
    use crate::strategy::test_strategy::TestStrategy;
    use crate::strategy::{Strategy, StrategyProfile};
    use crate::services::position::PositionService;

    struct NullStatusSink;
    impl StatusSink for NullStatusSink {
        fn update(&self, _summary: StatusSummary) {}
    }
    struct NullStreamSink;
    impl StreamSink for NullStreamSink {
        fn add_event(&self, _event: Json) {}
        fn update_snapshot(&self, _patch: Json) {}
    }

    async fn harness() -> AppState {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        db.init_schema().await.unwrap();
        let alert = Arc::new(AlertManager::new(db.clone(), AlertsConfig { enabled: false, ..Default::default() }));
        let accounts: AccountMap = Arc::new(RwLock::new(HashMap::from([("default".to_string(), Account::new(1000.0))])));
        let positions: PositionMap = Arc::new(RwLock::new(HashMap::new()));
        let cooldowns: CooldownMap = Arc::new(RwLock::new(HashMap::new()));
        let profile = StrategyProfile { initial_capital: 1000.0, ..Default::default() };
        let profiles: ProfileMap = Arc::new(HashMap::from([("default".to_string(), profile)]));
        let rest = FuturesRestClient::new("https://fapi.binance.com".to_string());

        let app_config = Arc::new(AppConfig::default());
        let portfolio = Arc::new(PortfolioService::new(
            db.clone(), alert.clone(), accounts.clone(), positions.clone(), cooldowns.clone(),
            profiles.clone(), vec!["default".to_string()], Arc::new(NullStatusSink),
            "BTCUSDT".to_string(), rest,
        ));

        let mut state_mgr = crate::state_manager::MarketStateManager::new();
        let strat = TestStrategy::new("default");
        state_mgr.register_strategy("default", &strat);
        let mut strategies: HashMap<String, Box<dyn Strategy>> = HashMap::new();
        strategies.insert("default".to_string(), Box::new(strat));

        let position_service = Arc::new(PositionService::new(
            db.clone(), alert, Arc::new(NullStreamSink), accounts.clone(), positions.clone(),
            cooldowns.clone(), profiles.clone(), portfolio.clone(), "BTCUSDT".to_string(),
        ));
        let runner = Arc::new(AsyncMutex::new(StrategyRunner::new(
            strategies, profiles.clone(), state_mgr, position_service.clone(), portfolio.clone(), Arc::new(NullStreamSink),
        )));

        AppState::new(
            db, app_config, RuntimeConfig::default(), "/tmp/unused_runtime_config.json",
            accounts, positions, cooldowns, profiles, portfolio, position_service, runner,
        )
    }

    #[tokio::test]
    async fn update_snapshot_merges_object_patches() {
        let state = harness().await;
        state.update_snapshot(json!({ "a": 1 }));
        state.update_snapshot(json!({ "b": 2 }));
        let snap = state.stream_snapshot();
        assert_eq!(snap["a"], json!(1));
        assert_eq!(snap["b"], json!(2));
    }

    #[tokio::test]
    async fn push_error_caps_at_max_recent_errors() {
        let state = harness().await;
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error("test", format!("err {i}"));
        }
        assert_eq!(state.recent_errors().len(), MAX_RECENT_ERRORS);
    }

    #[tokio::test]
    async fn reset_strategy_restores_initial_capital() {
        let state = harness().await;
        {
            let mut accounts = state.accounts.write();
            accounts.get_mut("default").unwrap().balance = 42.0;
        }
        state.reset_strategy("default").await;
        assert_eq!(state.accounts.read().get("default").unwrap().balance, 1000.0);
    }

    #[tokio::test]
    async fn status_sink_update_is_queryable_by_strategy() {
        let state = harness().await;
        state.update(StatusSummary { strategy: "default".to_string(), balance: 500.0, ..Default::default() });
        assert_eq!(state.status_for("default").unwrap().balance, 500.0);
        assert!(state.status_for("missing").is_none());
    }
}
