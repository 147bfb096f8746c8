// =============================================================================
// `ma_cross` strategy — bar-close-only EMA cross with 1h RSI filter.
// =============================================================================
//
// Ported from `backend/strategy/ma_cross_strategy.py`.

use std::collections::HashMap;

use super::{
    calc_targets, choose_stop, Condition, ConditionSet, Decision, EntrySignal, ExitAction,
    ExitActionKind, IndicatorRequirement, Side, Strategy, StrategyContext, StrategyProfile,
    WarmupPolicy,
};

pub struct MaCrossStrategy {
    id: String,
    profile: StrategyProfile,
}

impl MaCrossStrategy {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), profile: StrategyProfile::default() }
    }

    fn cross_long(ctx: &StrategyContext) -> bool {
        match (ctx.ind("ema20_15m"), ctx.ind("ema60_15m"), ctx.ind("rsi14_1h")) {
            (Some(e20), Some(e60), Some(rsi)) => e20 > e60 && rsi > 50.0,
            _ => false,
        }
    }

    fn cross_short(ctx: &StrategyContext) -> bool {
        match (ctx.ind("ema20_15m"), ctx.ind("ema60_15m"), ctx.ind("rsi14_1h")) {
            (Some(e20), Some(e60), Some(rsi)) => e20 < e60 && rsi < 50.0,
            _ => false,
        }
    }
}

impl Strategy for MaCrossStrategy {
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
        _cooldown_bars: i64,
    ) -> ConditionSet {
        let mut set = ConditionSet::default();
        if has_position || !ind_1h_ready {
            return set;
        }
        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "15m".into(),
            ok: Self::cross_long(ctx),
            desc: "ema20_15m > ema60_15m and rsi14_1h > 50".into(),
            value: ctx.ind("ema20_15m"),
            target: ctx.ind("ema60_15m"),
            label: "ma cross".into(),
        });
        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "15m".into(),
            ok: Self::cross_short(ctx),
            desc: "ema20_15m < ema60_15m and rsi14_1h < 50".into(),
            value: ctx.ind("ema20_15m"),
            target: ctx.ind("ema60_15m"),
            label: "ma cross".into(),
        });
        set
    }

    fn on_bar_close(&mut self, ctx: &StrategyContext) -> Option<Decision> {
        let atr_mult = self.profile.param_f64("atr_stop_mult", 1.2);

        if let Some(pos) = ctx.position {
            let flipped = match pos.side {
                Side::Long => Self::cross_short(ctx),
                Side::Short => Self::cross_long(ctx),
            };
            if flipped {
                return Some(Decision::Exit(ExitAction {
                    action: ExitActionKind::CloseAll,
                    price: ctx.close_15m,
                    reason: "trend_flip".into(),
                }));
            }
            return None;
        }

        if ctx.cooldown_bars_remaining > 0 {
            return None;
        }

        let atr = ctx.ind("atr14_15m").unwrap_or(0.0);
        let entry = ctx.close_15m;

        if Self::cross_long(ctx) {
            let stop = choose_stop(Side::Long, entry, ctx.structure_stop, atr, atr_mult);
            let (tp1, tp2) = calc_targets(Side::Long, entry, stop);
            return Some(Decision::Entry(EntrySignal {
                side: Side::Long,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp1,
                tp2_price: tp2,
                reason: "ma_cross".into(),
            }));
        }
        if Self::cross_short(ctx) {
            let stop = choose_stop(Side::Short, entry, ctx.structure_stop, atr, atr_mult);
            let (tp1, tp2) = calc_targets(Side::Short, entry, stop);
            return Some(Decision::Entry(EntrySignal {
                side: Side::Short,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp1,
                tp2_price: tp2,
                reason: "ma_cross".into(),
            }));
        }
        None
    }

    fn on_tick(&mut self, _ctx: &StrategyContext, _price: f64) -> Option<Decision> {
        // Bar-close-only strategy — realtime_entry/realtime_exit both false.
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

    #[test]
    fn long_entry_on_bullish_cross_with_1h_confirmation() {
        let mut strat = MaCrossStrategy::new("mc1");
        strat.configure(StrategyProfile::default());
        let mut ctx = base_ctx();
        ctx.indicators.insert("ema20_15m".into(), 101.0);
        ctx.indicators.insert("ema60_15m".into(), 99.0);
        ctx.indicators.insert("rsi14_1h".into(), 55.0);
        ctx.indicators.insert("atr14_15m".into(), 2.0);

        let decision = strat.on_bar_close(&ctx);
        assert!(matches!(decision, Some(Decision::Entry(EntrySignal { side: Side::Long, .. }))));
    }

    #[test]
    fn no_entry_during_cooldown() {
        let mut strat = MaCrossStrategy::new("mc1");
        strat.configure(StrategyProfile::default());
        let mut ctx = base_ctx();
        ctx.indicators.insert("ema20_15m".into(), 101.0);
        ctx.indicators.insert("ema60_15m".into(), 99.0);
        ctx.indicators.insert("rsi14_1h".into(), 55.0);
        ctx.cooldown_bars_remaining = 2;

        assert!(strat.on_bar_close(&ctx).is_none());
    }

    #[test]
    fn flip_exit_closes_long_on_bearish_cross() {
        let mut strat = MaCrossStrategy::new("mc1");
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
        ctx.indicators.insert("ema20_15m".into(), 98.0);
        ctx.indicators.insert("ema60_15m".into(), 100.0);
        ctx.indicators.insert("rsi14_1h".into(), 40.0);

        let decision = strat.on_bar_close(&ctx);
        assert!(matches!(decision, Some(Decision::Exit(ExitAction { action: ExitActionKind::CloseAll, .. }))));
    }
}
