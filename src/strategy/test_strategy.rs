// =============================================================================
// `test` strategy — dual-timeframe trend-follow.
// =============================================================================
//
// Ported from `backend/strategy/test_strategy.py`. Entry requires a 1h
// direction filter, a 15m price-kiss, an RSI band (optionally slope-gated),
// and a strictly monotone MACD histogram over the last three closed bars.

use std::collections::HashMap;

use super::{
    calc_targets, choose_stop, Condition, ConditionSet, Decision, EntrySignal, ExitAction,
    ExitActionKind, IndicatorRequirement, Side, Strategy, StrategyContext, StrategyProfile,
    WarmupPolicy,
};

pub struct TestStrategy {
    id: String,
    profile: StrategyProfile,
}

impl TestStrategy {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), profile: StrategyProfile::default() }
    }

    fn macd_increasing(ctx: &StrategyContext) -> bool {
        match (ctx.prev("macd_hist_15m", 2), ctx.prev("macd_hist_15m", 1), ctx.ind("macd_hist_15m")) {
            (Some(p2), Some(p1), Some(cur)) => p2 < p1 && p1 < cur,
            _ => false,
        }
    }

    fn macd_decreasing(ctx: &StrategyContext) -> bool {
        match (ctx.prev("macd_hist_15m", 2), ctx.prev("macd_hist_15m", 1), ctx.ind("macd_hist_15m")) {
            (Some(p2), Some(p1), Some(cur)) => p2 > p1 && p1 > cur,
            _ => false,
        }
    }

    fn direction_1h(&self, ctx: &StrategyContext) -> (bool, bool) {
        let (Some(ema20), Some(ema60), Some(rsi), Some(close)) = (
            ctx.ind("ema20_1h"),
            ctx.ind("ema60_1h"),
            ctx.ind("rsi14_1h"),
            ctx.ind("close_1h"),
        ) else {
            return (false, false);
        };
        if close == 0.0 {
            return (false, false);
        }
        let trend_strength_min = self.profile.param_f64("trend_strength_min", 0.003);
        let strength = (ema20 - ema60).abs() / close;
        if strength < trend_strength_min {
            return (false, false);
        }
        let allow_long = close > ema60 && ema20 > ema60 && rsi > 50.0;
        let allow_short = close < ema60 && ema20 < ema60 && rsi < 50.0;
        (allow_long, allow_short)
    }

    fn price_kiss(ctx: &StrategyContext, side: Side) -> bool {
        let (Some(ema20), Some(ema60)) = (ctx.ind("ema20_15m"), ctx.ind("ema60_15m")) else {
            return false;
        };
        match side {
            Side::Long => ctx.low_15m <= ema20 && ctx.close_15m > ema60,
            Side::Short => ctx.high_15m >= ema20 && ctx.close_15m < ema60,
        }
    }

    fn rsi_band_ok(&self, ctx: &StrategyContext, side: Side) -> bool {
        let Some(rsi) = ctx.ind("rsi14_15m") else { return false };
        let slope_required = self.profile.param_bool("rsi_slope_required", true);

        let (lower, upper) = match side {
            Side::Long => (
                self.profile.param_f64("rsi_long_lower", 50.0),
                self.profile.param_f64("rsi_long_upper", 60.0),
            ),
            Side::Short => (
                self.profile.param_f64("rsi_short_lower", 40.0),
                self.profile.param_f64("rsi_short_upper", 50.0),
            ),
        };
        if rsi < lower || rsi > upper {
            return false;
        }
        if !slope_required {
            return true;
        }
        match ctx.prev("rsi14_15m", 1) {
            Some(prev) => match side {
                Side::Long => rsi >= prev,
                Side::Short => rsi <= prev,
            },
            None => false,
        }
    }

    fn try_entry(&self, ctx: &StrategyContext) -> Option<Decision> {
        if ctx.cooldown_bars_remaining > 0 {
            return None;
        }
        let (allow_long, allow_short) = self.direction_1h(ctx);
        let atr_mult = self.profile.param_f64("atr_stop_mult", 1.5);

        if allow_long
            && Self::price_kiss(ctx, Side::Long)
            && self.rsi_band_ok(ctx, Side::Long)
            && Self::macd_increasing(ctx)
        {
            let atr = ctx.ind("atr14_15m").unwrap_or(0.0);
            let entry = ctx.close_15m;
            let stop = choose_stop(Side::Long, entry, ctx.structure_stop, atr, atr_mult);
            let (tp1, tp2) = calc_targets(Side::Long, entry, stop);
            return Some(Decision::Entry(EntrySignal {
                side: Side::Long,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp1,
                tp2_price: tp2,
                reason: "trend_follow".into(),
            }));
        }

        if allow_short
            && Self::price_kiss(ctx, Side::Short)
            && self.rsi_band_ok(ctx, Side::Short)
            && Self::macd_decreasing(ctx)
        {
            let atr = ctx.ind("atr14_15m").unwrap_or(0.0);
            let entry = ctx.close_15m;
            let stop = choose_stop(Side::Short, entry, ctx.structure_stop, atr, atr_mult);
            let (tp1, tp2) = calc_targets(Side::Short, entry, stop);
            return Some(Decision::Entry(EntrySignal {
                side: Side::Short,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp1,
                tp2_price: tp2,
                reason: "trend_follow".into(),
            }));
        }

        None
    }
}

impl Strategy for TestStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&mut self, profile: StrategyProfile) {
        self.profile = profile;
    }

    fn indicator_requirements(&self) -> Vec<IndicatorRequirement> {
        vec![
            IndicatorRequirement::Ema { name: "ema20_15m".into(), interval: "15m".into(), length: 20 },
            IndicatorRequirement::Ema { name: "ema60_15m".into(), interval: "15m".into(), length: 60 },
            IndicatorRequirement::Rsi { name: "rsi14_15m".into(), interval: "15m".into(), length: 14 },
            IndicatorRequirement::Macd { name: "macd_hist_15m".into(), interval: "15m".into(), fast: 12, slow: 26, signal: 9 },
            IndicatorRequirement::Atr { name: "atr14_15m".into(), interval: "15m".into(), length: 14 },
            IndicatorRequirement::Ema { name: "ema20_1h".into(), interval: "1h".into(), length: 20 },
            IndicatorRequirement::Ema { name: "ema60_1h".into(), interval: "1h".into(), length: 60 },
            IndicatorRequirement::Rsi { name: "rsi14_1h".into(), interval: "1h".into(), length: 14 },
        ]
    }

    fn warmup_policy(&self) -> HashMap<String, WarmupPolicy> {
        HashMap::from([
            ("15m".to_string(), WarmupPolicy::default()),
            ("1h".to_string(), WarmupPolicy::default()),
        ])
    }

    fn describe_conditions(
        &self,
        ctx: &StrategyContext,
        ind_1h_ready: bool,
        has_position: bool,
        cooldown_bars: i64,
    ) -> ConditionSet {
        let mut set = ConditionSet::default();
        if has_position || !ind_1h_ready {
            return set;
        }
        let (allow_long, allow_short) = self.direction_1h(ctx);

        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "1h".into(),
            ok: allow_long,
            desc: "1h trend filter (close/ema20 > ema60, rsi>50)".into(),
            value: ctx.ind("rsi14_1h"),
            target: Some(50.0),
            label: "1h direction".into(),
        });
        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "15m".into(),
            ok: Self::price_kiss(ctx, Side::Long),
            desc: "15m price kiss on ema20".into(),
            value: Some(ctx.low_15m),
            target: ctx.ind("ema20_15m"),
            label: "price kiss".into(),
        });
        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "15m".into(),
            ok: self.rsi_band_ok(ctx, Side::Long),
            desc: "rsi14_15m inside long band".into(),
            value: ctx.ind("rsi14_15m"),
            target: None,
            label: "rsi band".into(),
        });
        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "15m".into(),
            ok: Self::macd_increasing(ctx),
            desc: "macd histogram strictly increasing".into(),
            value: ctx.ind("macd_hist_15m"),
            target: None,
            label: "macd monotone".into(),
        });

        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "1h".into(),
            ok: allow_short,
            desc: "1h trend filter (close/ema20 < ema60, rsi<50)".into(),
            value: ctx.ind("rsi14_1h"),
            target: Some(50.0),
            label: "1h direction".into(),
        });
        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "15m".into(),
            ok: Self::price_kiss(ctx, Side::Short),
            desc: "15m price kiss on ema20".into(),
            value: Some(ctx.high_15m),
            target: ctx.ind("ema20_15m"),
            label: "price kiss".into(),
        });
        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "15m".into(),
            ok: self.rsi_band_ok(ctx, Side::Short),
            desc: "rsi14_15m inside short band".into(),
            value: ctx.ind("rsi14_15m"),
            target: None,
            label: "rsi band".into(),
        });
        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "15m".into(),
            ok: Self::macd_decreasing(ctx),
            desc: "macd histogram strictly decreasing".into(),
            value: ctx.ind("macd_hist_15m"),
            target: None,
            label: "macd monotone".into(),
        });

        let _ = cooldown_bars;
        set
    }

    fn on_bar_close(&mut self, ctx: &StrategyContext) -> Option<Decision> {
        if let Some(pos) = ctx.position {
            let (Some(ema20), Some(rsi)) = (ctx.ind("ema20_15m"), ctx.ind("rsi14_15m")) else {
                return None;
            };
            let trend_fail = match pos.side {
                Side::Long => ctx.close_15m < ema20 && rsi < 50.0,
                Side::Short => ctx.close_15m > ema20 && rsi > 50.0,
            };
            if trend_fail {
                return Some(Decision::Exit(ExitAction {
                    action: ExitActionKind::CloseAll,
                    price: ctx.close_15m,
                    reason: "trend_fail".into(),
                }));
            }
            return None;
        }

        self.try_entry(ctx)
    }

    fn on_tick(&mut self, _ctx: &StrategyContext, _price: f64) -> Option<Decision> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_ctx() -> StrategyContext {
        StrategyContext {
            timestamp: 0,
            interval: "15m".into(),
            price: 100.0,
            close_15m: 100.0,
            low_15m: 99.5,
            high_15m: 100.5,
            indicators: HashMap::new(),
            history: HashMap::new(),
            structure_stop: None,
            position: None,
            cooldown_bars_remaining: 0,
            params: HashMap::new(),
        }
    }

    #[test]
    fn no_entry_without_1h_direction() {
        let strat = TestStrategy::new("t1");
        let ctx = base_ctx();
        assert!(strat.try_entry(&ctx).is_none());
    }

    #[test]
    fn long_entry_fires_when_all_conditions_met() {
        let mut strat = TestStrategy::new("t1");
        strat.configure(StrategyProfile::default());
        let mut ctx = base_ctx();
        ctx.indicators.insert("ema20_1h".into(), 105.0);
        ctx.indicators.insert("ema60_1h".into(), 100.0);
        ctx.indicators.insert("rsi14_1h".into(), 60.0);
        ctx.indicators.insert("close_1h".into(), 106.0);
        ctx.indicators.insert("ema20_15m".into(), 100.0);
        ctx.indicators.insert("ema60_15m".into(), 98.0);
        ctx.indicators.insert("rsi14_15m".into(), 55.0);
        ctx.indicators.insert("atr14_15m".into(), 2.0);
        ctx.indicators.insert("macd_hist_15m".into(), 1.0);
        ctx.history.insert("rsi14_15m".into(), vec![50.0, 54.0]);
        ctx.history.insert("macd_hist_15m".into(), vec![-1.0, 0.0]);
        ctx.close_15m = 100.0;
        ctx.low_15m = 99.0; // touches ema20

        let decision = strat.try_entry(&ctx);
        assert!(matches!(decision, Some(Decision::Entry(EntrySignal { side: Side::Long, .. }))));
    }

    #[test]
    fn trend_fail_exit_when_in_long_position() {
        let mut strat = TestStrategy::new("t1");
        let mut ctx = base_ctx();
        ctx.position = Some(super::super::PositionState {
            side: Side::Long,
            entry_price: 100.0,
            qty: 1.0,
            stop_price: 95.0,
            tp1_price: 105.0,
            tp2_price: 110.0,
            tp1_hit: false,
        });
        ctx.indicators.insert("ema20_15m".into(), 101.0);
        ctx.indicators.insert("rsi14_15m".into(), 45.0);
        ctx.close_15m = 99.0; // below ema20, rsi<50 -> trend_fail

        let decision = strat.on_bar_close(&ctx);
        assert!(matches!(decision, Some(Decision::Exit(ExitAction { action: ExitActionKind::CloseAll, .. }))));
    }
}
