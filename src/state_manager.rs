// =============================================================================
// MarketStateManager — warmup aggregation, indicator routing, context build.
// =============================================================================
//
// Ported from `backend/marketdata/state.py`. Owns the per-interval bar
// buffers and the `IndicatorEngine`; produces one `StrategyContext` per
// strategy on every 15m close, merging in that strategy's most recent ready
// 1h snapshot.

use std::collections::HashMap;

use crate::indicators::engine::IndicatorEngine;
use crate::market_data::{Bar, BufferManager};
use crate::strategy::{Strategy, StrategyContext, StrategyProfile};

/// A strategy's most recently closed-1h indicator snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Indicators1h {
    pub ema20: f64,
    pub ema60: f64,
    pub rsi14: f64,
    pub close: f64,
}

/// Aggregated REST-fetch and ring-buffer sizing requirements, keyed by
/// interval (`"15m"`, `"1h"`).
#[derive(Debug, Clone, Default)]
pub struct WarmupRequirements {
    pub warmup_bars: HashMap<String, usize>,
    pub buffer_capacity: HashMap<String, usize>,
}

/// What to push to stream clients after priming from warmup history.
#[derive(Debug, Clone, Default)]
pub struct PrimeSnapshot {
    pub last_bar_15m: Option<Bar>,
    pub last_indicators_15m: Option<HashMap<String, f64>>,
    pub sample_indicators_1h: Option<Indicators1h>,
}

/// Per-strategy output of a 15m bar close: a ready-to-evaluate context plus
/// the flattened indicator map for stream push.
#[derive(Debug, Clone)]
pub struct BarCloseOutcome {
    pub contexts: HashMap<String, StrategyContext>,
    pub stream_indicators_15m: Option<HashMap<String, f64>>,
    pub stream_indicators_1h: Option<HashMap<String, f64>>,
}

pub struct MarketStateManager {
    buffers: BufferManager,
    indicators: IndicatorEngine,
    ind_1h: HashMap<String, Indicators1h>,
}

impl MarketStateManager {
    pub fn new() -> Self {
        Self { buffers: BufferManager::new(), indicators: IndicatorEngine::new(), ind_1h: HashMap::new() }
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn set_buffer_capacity(&mut self, interval: &str, capacity: usize) {
        self.buffers.set_capacity(interval, capacity);
    }

    pub fn register_strategy(&mut self, strategy_id: &str, strategy: &dyn Strategy) {
        let specs = strategy.indicator_requirements().iter().map(|r| r.build()).collect();
        self.indicators.register(strategy_id, specs);
    }

    pub fn ind_1h_ready(&self, strategy_id: &str) -> bool {
        self.ind_1h.contains_key(strategy_id)
    }

    pub fn ind_1h_for(&self, strategy_id: &str) -> Option<Indicators1h> {
        self.ind_1h.get(strategy_id).copied()
    }

    /// Non-mutating per-strategy indicator preview for an in-progress 15m bar.
    pub fn preview_15m(&self, bar: &Bar) -> HashMap<String, HashMap<String, crate::indicators::IndicatorResult>> {
        self.indicators.preview("15m", bar)
    }

    /// `max(per-strategy bars * buffer_mult, bars + extra)` per interval,
    /// floored at the interval's minimum retained history.
    pub fn compute_warmup(
        strategies: &HashMap<String, Box<dyn Strategy>>,
        profiles: &HashMap<String, StrategyProfile>,
        default_buffer_mult: f64,
        default_extra_bars: usize,
        max_bars_15m: usize,
        max_bars_1h: usize,
    ) -> WarmupRequirements {
        let intervals = ["15m", "1h"];
        let mut warmup: HashMap<String, usize> = intervals.iter().map(|i| (i.to_string(), 0)).collect();

        for (sid, strat) in strategies {
            let policy = strat.warmup_policy();
            let mut per_interval: HashMap<String, usize> = intervals.iter().map(|i| (i.to_string(), 0)).collect();
            for req in strat.indicator_requirements() {
                let bars = req.build().warmup_bars();
                let entry = per_interval.entry(req.interval().to_string()).or_insert(0);
                *entry = (*entry).max(bars);
            }

            for interval in &intervals {
                let wp = policy.get(*interval).copied().unwrap_or_default();
                let buffer_mult = if wp.buffer_mult >= 1.0 { wp.buffer_mult } else { default_buffer_mult };
                let extra = if wp.extra > 0 { wp.extra } else { default_extra_bars };
                let min_bars = per_interval.get(*interval).copied().unwrap_or(0);
                let bars = ((min_bars as f64 * buffer_mult).round() as usize).max(min_bars + extra);
                let slot = warmup.entry(interval.to_string()).or_insert(0);
                *slot = (*slot).max(bars);
            }

            let _ = profiles.get(sid);
        }

        warmup.insert("15m".to_string(), (*warmup.get("15m").unwrap_or(&0)).max(500));
        warmup.insert("1h".to_string(), (*warmup.get("1h").unwrap_or(&0)).max(200));

        let mut buffer_capacity = HashMap::new();
        buffer_capacity.insert("15m".to_string(), warmup["15m"].max(max_bars_15m));
        buffer_capacity.insert("1h".to_string(), warmup["1h"].max(max_bars_1h));

        WarmupRequirements { warmup_bars: warmup, buffer_capacity }
    }

    /// Seed the ring buffer for `interval` with REST-fetched history, oldest
    /// first. Call once per interval before `prime_from_history`.
    pub fn load_warmup_bars(&mut self, interval: &str, bars: &[Bar]) {
        for bar in bars {
            self.buffers.append(interval, *bar);
        }
    }

    /// Run every buffered (REST-warmed) bar through the indicator engine so
    /// live processing starts from a fully warmed state.
    pub fn prime_from_history(&mut self) -> PrimeSnapshot {
        let bars_1h = self.buffers.snapshot("1h");
        for bar in &bars_1h {
            let snaps = self.indicators.update_on_close("1h", bar);
            self.absorb_1h_snapshots(snaps, bar.close);
        }

        let bars_15m = self.buffers.snapshot("15m");
        let mut last_bar_15m = None;
        let mut last_indicators_15m = None;
        for bar in &bars_15m {
            last_bar_15m = Some(*bar);
            let snaps = self.indicators.update_on_close("15m", bar);
            if let Some((_, res_map)) = snaps.into_iter().next() {
                last_indicators_15m = Some(flatten(&res_map));
            }
        }

        PrimeSnapshot {
            last_bar_15m,
            last_indicators_15m,
            sample_indicators_1h: self.ind_1h.values().next().copied(),
        }
    }

    /// Open-bar (`x=false`) update: no indicator mutation, only a 15m raw
    /// push payload.
    pub fn on_kline_update(&self, interval: &str, bar: &Bar) -> Option<Bar> {
        if interval == "15m" {
            Some(*bar)
        } else {
            None
        }
    }

    /// Commit a closed bar. Returns per-strategy contexts for 15m closes;
    /// 1h closes only update the cached snapshot used to enrich the next
    /// 15m context.
    pub fn on_kline_close(&mut self, interval: &str, bar: &Bar) -> BarCloseOutcome {
        self.buffers.append(interval, *bar);

        if interval == "1h" {
            let snaps = self.indicators.update_on_close("1h", bar);
            self.absorb_1h_snapshots(snaps, bar.close);
            let stream = self.ind_1h.values().next().map(|i| {
                HashMap::from([
                    ("ema20".to_string(), i.ema20),
                    ("ema60".to_string(), i.ema60),
                    ("rsi14".to_string(), i.rsi14),
                    ("close".to_string(), i.close),
                ])
            });
            return BarCloseOutcome { contexts: HashMap::new(), stream_indicators_15m: None, stream_indicators_1h: stream };
        }

        if interval != "15m" {
            return BarCloseOutcome { contexts: HashMap::new(), stream_indicators_15m: None, stream_indicators_1h: None };
        }

        let snaps = self.indicators.update_on_close("15m", bar);
        let mut contexts = HashMap::new();
        let mut stream_indicators_15m = None;

        for (sid, res_map) in snaps {
            let mut indicators = flatten(&res_map);
            if let Some(ind1) = self.ind_1h.get(&sid) {
                indicators.insert("ema20".to_string(), ind1.ema20);
                indicators.insert("ema60".to_string(), ind1.ema60);
                indicators.insert("rsi14".to_string(), ind1.rsi14);
            }
            indicators.insert("close_15m".to_string(), bar.close);

            let history: HashMap<String, Vec<f64>> = res_map
                .iter()
                .filter(|(_, r)| !r.history.is_empty())
                .map(|(k, r)| (k.clone(), r.history.clone()))
                .collect();

            stream_indicators_15m = Some(indicators.clone());

            contexts.insert(
                sid,
                StrategyContext {
                    timestamp: bar.close_time,
                    interval: "15m".to_string(),
                    price: bar.close,
                    close_15m: bar.close,
                    low_15m: bar.low,
                    high_15m: bar.high,
                    indicators,
                    history,
                    structure_stop: None,
                    position: None,
                    cooldown_bars_remaining: 0,
                    params: HashMap::new(),
                },
            );
        }

        BarCloseOutcome { contexts, stream_indicators_15m, stream_indicators_1h: None }
    }

    fn absorb_1h_snapshots(
        &mut self,
        snaps: HashMap<String, HashMap<String, crate::indicators::IndicatorResult>>,
        close: f64,
    ) {
        for (sid, res_map) in snaps {
            let (Some(ema_fast), Some(ema_slow), Some(rsi)) =
                (res_map.get("ema_fast"), res_map.get("ema_slow"), res_map.get("rsi"))
            else {
                continue;
            };
            let (Some(ema20), Some(ema60), Some(rsi14)) = (ema_fast.value, ema_slow.value, rsi.value) else {
                continue;
            };
            self.ind_1h.insert(sid, Indicators1h { ema20, ema60, rsi14, close });
        }
    }
}

impl Default for MarketStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten(res_map: &HashMap<String, crate::indicators::IndicatorResult>) -> HashMap<String, f64> {
    res_map.iter().filter_map(|(k, r)| r.value.map(|v| (k.clone(), v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_strategy::TestStrategy;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar { open_time, close_time: open_time + 899_999, open: close, high: close + 1.0, low: close - 1.0, close, volume: 1.0, trades: 1, is_closed: true }
    }

    #[test]
    fn on_kline_close_ignores_non_15m_non_1h_intervals() {
        let mut mgr = MarketStateManager::new();
        let outcome = mgr.on_kline_close("1m", &bar(0, 100.0));
        assert!(outcome.contexts.is_empty());
    }

    #[test]
    fn fifteen_minute_close_yields_one_context_per_registered_strategy() {
        let mut mgr = MarketStateManager::new();
        let strat = TestStrategy::new("default");
        mgr.register_strategy("default", &strat);

        let outcome = mgr.on_kline_close("15m", &bar(0, 100.0));
        assert!(outcome.contexts.contains_key("default"));
        assert_eq!(outcome.contexts["default"].close_15m, 100.0);
    }

    #[test]
    fn load_warmup_bars_then_prime_yields_last_bar_snapshot() {
        let mut mgr = MarketStateManager::new();
        let strat = TestStrategy::new("default");
        mgr.register_strategy("default", &strat);

        let bars: Vec<Bar> = (0..5).map(|i| bar(i * 900_000, 100.0 + i as f64)).collect();
        mgr.load_warmup_bars("15m", &bars);
        let snapshot = mgr.prime_from_history();
        assert_eq!(snapshot.last_bar_15m.unwrap().close, 104.0);
    }

    #[test]
    fn compute_warmup_applies_interval_floors() {
        let strategies: HashMap<String, Box<dyn Strategy>> =
            HashMap::from([("default".to_string(), Box::new(TestStrategy::new("default")) as Box<dyn Strategy>)]);
        let profiles = HashMap::new();
        let reqs = MarketStateManager::compute_warmup(&strategies, &profiles, 3.0, 200, 2000, 2000);
        assert!(reqs.warmup_bars["15m"] >= 500);
        assert!(reqs.warmup_bars["1h"] >= 200);
    }
}
