// =============================================================================
// Strategy plugin interface — closed set of tagged variants.
// =============================================================================
//
// Mirrors the original source's `StrategyContext`/`Strategy` protocol
// (`backend/strategy/*.py`), reshaped into a Rust trait object
// (`Box<dyn Strategy>`) the way the teacher dispatches through
// `Box<dyn ...>` trait objects at its own plugin seams (see `execution.rs`).

pub mod ma_cross;
pub mod registry;
pub mod rsi_overtrade;
pub mod runner;
pub mod test_strategy;

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::config::{AppConfig, MmrTier, StrategyEntryConfig};

/// One entry in a strategy's declared indicator requirement list.
#[derive(Debug, Clone)]
pub enum IndicatorRequirement {
    Ema { name: String, interval: String, length: usize },
    Rsi { name: String, interval: String, length: usize },
    Macd { name: String, interval: String, fast: usize, slow: usize, signal: usize },
    Atr { name: String, interval: String, length: usize },
}

impl IndicatorRequirement {
    pub fn name(&self) -> &str {
        match self {
            Self::Ema { name, .. }
            | Self::Rsi { name, .. }
            | Self::Macd { name, .. }
            | Self::Atr { name, .. } => name,
        }
    }

    pub fn interval(&self) -> &str {
        match self {
            Self::Ema { interval, .. }
            | Self::Rsi { interval, .. }
            | Self::Macd { interval, .. }
            | Self::Atr { interval, .. } => interval,
        }
    }

    pub fn build(&self) -> Box<dyn crate::indicators::IndicatorSpec> {
        match self {
            Self::Ema { name, interval, length } => {
                Box::new(crate::indicators::ema::EmaSpec::new(name.clone(), interval.clone(), *length))
            }
            Self::Rsi { name, interval, length } => {
                Box::new(crate::indicators::rsi::RsiSpec::new(name.clone(), interval.clone(), *length))
            }
            Self::Macd { name, interval, fast, slow, signal } => Box::new(
                crate::indicators::macd::MacdSpec::new(name.clone(), interval.clone(), *fast, *slow, *signal),
            ),
            Self::Atr { name, interval, length } => {
                Box::new(crate::indicators::atr::AtrSpec::new(name.clone(), interval.clone(), *length))
            }
        }
    }
}

/// Per-interval `{buffer_mult, extra}` applied on top of the raw warmup_bars
/// derived from a strategy's indicator requirements.
#[derive(Debug, Clone, Copy)]
pub struct WarmupPolicy {
    pub buffer_mult: f64,
    pub extra: usize,
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self { buffer_mult: 1.0, extra: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// A strategy's live position, as carried inside the context it reads (but
/// does not mutate — the PositionService is the sole writer).
#[derive(Debug, Clone, Copy)]
pub struct PositionState {
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub stop_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub tp1_hit: bool,
}

/// A signal to open a new position.
#[derive(Debug, Clone)]
pub struct EntrySignal {
    pub side: Side,
    pub entry_price: f64,
    pub stop_price: f64,
    pub tp1_price: f64,
    pub tp2_price: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitActionKind {
    Stop,
    Tp1,
    Tp2,
    CloseAll,
}

#[derive(Debug, Clone)]
pub struct ExitAction {
    pub action: ExitActionKind,
    pub price: f64,
    pub reason: String,
}

/// A single human-readable entry/exit condition check, as surfaced to the
/// `/api/conditions_summary` endpoint and the (unbuilt) frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub direction: String, // "long" | "short"
    pub timeframe: String,
    pub ok: bool,
    pub desc: String,
    pub value: Option<f64>,
    pub target: Option<f64>,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionSet {
    pub long: Vec<Condition>,
    pub short: Vec<Condition>,
}

/// What a strategy decided on a bar close or tick.
#[derive(Debug, Clone)]
pub enum Decision {
    Entry(EntrySignal),
    Exit(ExitAction),
}

/// Merged per-strategy config bundle injected via `configure()`.
#[derive(Debug, Clone, Default)]
pub struct StrategyProfile {
    pub strategy_params: HashMap<String, Json>,
    pub indicator_params: HashMap<String, Json>,
    pub initial_capital: f64,
    pub realtime_entry: bool,
    pub realtime_exit: bool,
    pub max_leverage: f64,
    pub fee_rate: f64,
    pub max_position_notional: f64,
    pub max_position_pct_equity: f64,
    pub mmr_tiers: Vec<crate::config::MmrTier>,
    pub cooldown_after_stop: i64,
}

impl StrategyProfile {
    pub fn param_f64(&self, name: &str, default: f64) -> f64 {
        self.strategy_params.get(name).and_then(Json::as_f64).unwrap_or(default)
    }

    pub fn param_bool(&self, name: &str, default: bool) -> bool {
        self.strategy_params.get(name).and_then(Json::as_bool).unwrap_or(default)
    }
}

/// Per-strategy, per-event context. Created by the `MarketStateManager`,
/// consumed by exactly one strategy call, never shared across strategies.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub timestamp: i64,
    pub interval: String,
    pub price: f64,
    pub close_15m: f64,
    pub low_15m: f64,
    pub high_15m: f64,
    pub indicators: HashMap<String, f64>,
    pub history: HashMap<String, Vec<f64>>,
    pub structure_stop: Option<f64>,
    pub position: Option<PositionState>,
    pub cooldown_bars_remaining: i64,
    pub params: HashMap<String, Json>,
}

impl StrategyContext {
    pub fn ind(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied()
    }

    pub fn feat(&self, name: &str) -> Option<f64> {
        match name {
            "structure_stop" => self.structure_stop,
            other => self.indicators.get(other).copied(),
        }
    }

    /// `k`-th most recent history element, 1-indexed from the end
    /// (`k=1` is the last element).
    pub fn prev(&self, name: &str, k: usize) -> Option<f64> {
        let series = self.history.get(name)?;
        if k == 0 || k > series.len() {
            return None;
        }
        series.get(series.len() - k).copied()
    }

    pub fn param(&self, name: &str) -> Option<&Json> {
        self.params.get(name)
    }

    pub fn param_f64(&self, name: &str, default: f64) -> f64 {
        self.params.get(name).and_then(Json::as_f64).unwrap_or(default)
    }

    pub fn param_bool(&self, name: &str, default: bool) -> bool {
        self.params.get(name).and_then(Json::as_bool).unwrap_or(default)
    }
}

/// Uniform interface every built-in strategy variant implements.
pub trait Strategy: Send {
    fn id(&self) -> &str;
    fn configure(&mut self, profile: StrategyProfile);
    fn indicator_requirements(&self) -> Vec<IndicatorRequirement>;
    fn warmup_policy(&self) -> HashMap<String, WarmupPolicy>;

    fn describe_conditions(
        &self,
        ctx: &StrategyContext,
        ind_1h_ready: bool,
        has_position: bool,
        cooldown_bars: i64,
    ) -> ConditionSet;

    /// Called once per 15m close.
    fn on_bar_close(&mut self, ctx: &StrategyContext) -> Option<Decision>;

    /// Called on open-bar updates, only when `realtime_entry`/`realtime_exit`
    /// is set.
    fn on_tick(&mut self, ctx: &StrategyContext, price: f64) -> Option<Decision>;

    /// Reserved hook; no-op in every built-in variant.
    fn on_state_restore(&mut self, _ctx: &StrategyContext) {}
}

/// Side-conservative stop combining a structural stop with an ATR-based
/// floor/ceiling — shared by `test` and `ma_cross`.
pub fn choose_stop(side: Side, entry: f64, structure_stop: Option<f64>, atr: f64, atr_mult: f64) -> f64 {
    let atr_stop = match side {
        Side::Long => entry - atr * atr_mult,
        Side::Short => entry + atr * atr_mult,
    };
    match (side, structure_stop) {
        (Side::Long, Some(s)) => s.min(atr_stop),
        (Side::Short, Some(s)) => s.max(atr_stop),
        (Side::Long, None) => atr_stop,
        (Side::Short, None) => atr_stop,
    }
}

/// `tp1 = entry ± R`, `tp2 = entry ± 2R` with `R = |entry - stop|`.
pub fn calc_targets(side: Side, entry: f64, stop: f64) -> (f64, f64) {
    let r = (entry - stop).abs();
    match side {
        Side::Long => (entry + r, entry + 2.0 * r),
        Side::Short => (entry - r, entry - 2.0 * r),
    }
}

/// Build a strategy's runtime `StrategyProfile` from the app config's merged
/// YAML document (`AppConfig::build_profile`), pulling `realtime_entry`,
/// `realtime_exit`, and `cooldown_after_stop` out of the flattened strategy
/// params block and the sizing/MMR fields out of `sim`/`risk`.
pub fn profile_from_config(
    app_config: &AppConfig,
    entry: &StrategyEntryConfig,
    strategy_defaults: &HashMap<String, Json>,
    indicator_defaults: &HashMap<String, Json>,
) -> Result<StrategyProfile> {
    let merged = app_config.build_profile(entry, strategy_defaults, indicator_defaults)?;
    let doc: Json = serde_yaml::from_value(merged)?;

    let sim = doc.get("sim").cloned().unwrap_or(Json::Null);
    let risk = doc.get("risk").cloned().unwrap_or(Json::Null);

    let mut strategy_params: HashMap<String, Json> = doc
        .get("strategy")
        .and_then(Json::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let indicator_params: HashMap<String, Json> = doc
        .get("indicators")
        .and_then(Json::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let realtime_entry = strategy_params.remove("realtime_entry").and_then(|v| v.as_bool()).unwrap_or(false);
    let realtime_exit = strategy_params.remove("realtime_exit").and_then(|v| v.as_bool()).unwrap_or(false);
    let cooldown_after_stop =
        strategy_params.get("cooldown_after_stop").and_then(Json::as_i64).unwrap_or(4);

    let max_leverage = sim.get("max_leverage").and_then(Json::as_f64).unwrap_or(20.0);
    let fee_rate = sim.get("fee_rate").and_then(Json::as_f64).unwrap_or(0.0004);

    let max_position_notional = risk.get("max_position_notional").and_then(Json::as_f64).unwrap_or(20_000.0);
    let max_position_pct_equity = risk.get("max_position_pct_equity").and_then(Json::as_f64).unwrap_or(1.0);
    let mmr_tiers: Vec<MmrTier> = risk
        .get("mmr_tiers")
        .and_then(Json::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    Some(MmrTier {
                        notional_usdt: t.get("notional_usdt")?.as_f64()?,
                        mmr: t.get("mmr")?.as_f64()?,
                        maint_amount: t.get("maint_amount").and_then(Json::as_f64).unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let initial_capital = doc.get("initial_capital").and_then(Json::as_f64).unwrap_or(1000.0);

    Ok(StrategyProfile {
        strategy_params,
        indicator_params,
        initial_capital,
        realtime_entry,
        realtime_exit,
        max_leverage,
        fee_rate,
        max_position_notional,
        max_position_pct_equity,
        mmr_tiers,
        cooldown_after_stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_stop_picks_more_conservative_long() {
        // structure stop tighter than ATR stop -> structure wins (min).
        let s = choose_stop(Side::Long, 100.0, Some(98.0), 5.0, 1.0);
        assert_eq!(s, 95.0f64.min(98.0));
    }

    #[test]
    fn calc_targets_long() {
        let (tp1, tp2) = calc_targets(Side::Long, 100.0, 95.0);
        assert_eq!(tp1, 105.0);
        assert_eq!(tp2, 110.0);
    }

    #[test]
    fn calc_targets_short() {
        let (tp1, tp2) = calc_targets(Side::Short, 100.0, 105.0);
        assert_eq!(tp1, 95.0);
        assert_eq!(tp2, 90.0);
    }

    #[test]
    fn prev_is_one_indexed_from_the_end() {
        let mut ctx = sample_ctx();
        ctx.history.insert("rsi14_15m".into(), vec![1.0, 2.0, 3.0]);
        assert_eq!(ctx.prev("rsi14_15m", 1), Some(3.0));
        assert_eq!(ctx.prev("rsi14_15m", 2), Some(2.0));
        assert_eq!(ctx.prev("rsi14_15m", 3), Some(1.0));
        assert_eq!(ctx.prev("rsi14_15m", 4), None);
    }

    #[test]
    fn profile_from_config_picks_up_registry_defaults_and_risk_sizing() {
        let app_config = AppConfig::default();
        let entry = StrategyEntryConfig { id: "default".into(), r#type: "ma_cross".into(), ..Default::default() };
        let (strategy_defaults, indicator_defaults) = crate::strategy::registry::get_strategy_defaults("ma_cross").unwrap();
        let profile = profile_from_config(&app_config, &entry, &strategy_defaults, &indicator_defaults).unwrap();

        assert!(!profile.realtime_entry);
        assert!(!profile.realtime_exit);
        assert_eq!(profile.cooldown_after_stop, 2);
        assert_eq!(profile.max_leverage, 20.0);
        assert_eq!(profile.max_position_notional, 20_000.0);
        assert_eq!(profile.mmr_tiers.len(), 5);
        assert_eq!(profile.param_f64("atr_stop_mult", 0.0), 1.2);
    }

    fn sample_ctx() -> StrategyContext {
        StrategyContext {
            timestamp: 0,
            interval: "15m".into(),
            price: 100.0,
            close_15m: 100.0,
            low_15m: 99.0,
            high_15m: 101.0,
            indicators: HashMap::new(),
            history: HashMap::new(),
            structure_stop: None,
            position: None,
            cooldown_bars_remaining: 0,
            params: HashMap::new(),
        }
    }
}
