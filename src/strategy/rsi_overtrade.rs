// =============================================================================
// `simple_rsi_overtrade_strategy` — mean-reversion, 15m-only.
// =============================================================================
//
// Ported from `backend/strategy/simple_rsi_overtrade_strategy.py`. tp1 and
// tp2 are identical by construction, so TP1 and TP2 fire as a single close
// (see `PositionService::close_by_action`'s tie-break rule).

use std::collections::HashMap;

use super::{
    Condition, ConditionSet, Decision, EntrySignal, ExitAction, ExitActionKind,
    IndicatorRequirement, Side, Strategy, StrategyContext, StrategyProfile, WarmupPolicy,
};

pub struct SimpleRsiOvertradeStrategy {
    id: String,
    profile: StrategyProfile,
}

impl SimpleRsiOvertradeStrategy {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), profile: StrategyProfile::default() }
    }

    fn check_exit(&self, ctx: &StrategyContext, price: f64) -> Option<Decision> {
        let pos = ctx.position?;
        let crossed_stop = match pos.side {
            Side::Long => price <= pos.stop_price,
            Side::Short => price >= pos.stop_price,
        };
        if crossed_stop {
            return Some(Decision::Exit(ExitAction {
                action: ExitActionKind::Stop,
                price,
                reason: "stop".into(),
            }));
        }
        let crossed_tp2 = match pos.side {
            Side::Long => price >= pos.tp2_price,
            Side::Short => price <= pos.tp2_price,
        };
        if crossed_tp2 {
            return Some(Decision::Exit(ExitAction {
                action: ExitActionKind::Tp2,
                price,
                reason: "tp2".into(),
            }));
        }
        None
    }

    fn check_entry(&self, ctx: &StrategyContext) -> Option<Decision> {
        if ctx.cooldown_bars_remaining > 0 {
            return None;
        }
        let rsi = ctx.ind("rsi14_15m")?;
        let rsi_low = self.profile.param_f64("rsi_low", 30.0);
        let rsi_high = self.profile.param_f64("rsi_high", 70.0);
        let stop_loss_pct = self.profile.param_f64("stop_loss_pct", 0.01);
        let rr = self.profile.param_f64("rr", 1.5);
        let entry = ctx.close_15m;

        if rsi < rsi_low {
            let stop = entry * (1.0 - stop_loss_pct);
            let tp = entry + (entry - stop) * rr;
            return Some(Decision::Entry(EntrySignal {
                side: Side::Long,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp,
                tp2_price: tp,
                reason: "rsi_oversold".into(),
            }));
        }
        if rsi > rsi_high {
            let stop = entry * (1.0 + stop_loss_pct);
            let tp = entry - (stop - entry) * rr;
            return Some(Decision::Entry(EntrySignal {
                side: Side::Short,
                entry_price: entry,
                stop_price: stop,
                tp1_price: tp,
                tp2_price: tp,
                reason: "rsi_overbought".into(),
            }));
        }
        None
    }
}

impl Strategy for SimpleRsiOvertradeStrategy {
    fn id(&self) -> &str {
        &self.id
    }

    fn configure(&mut self, profile: StrategyProfile) {
        self.profile = profile;
    }

    fn indicator_requirements(&self) -> Vec<IndicatorRequirement> {
        vec![IndicatorRequirement::Rsi { name: "rsi14_15m".into(), interval: "15m".into(), length: 14 }]
    }

    fn warmup_policy(&self) -> HashMap<String, WarmupPolicy> {
        HashMap::from([("15m".to_string(), WarmupPolicy::default())])
    }

    fn describe_conditions(
        &self,
        ctx: &StrategyContext,
        _ind_1h_ready: bool,
        has_position: bool,
        _cooldown_bars: i64,
    ) -> ConditionSet {
        let mut set = ConditionSet::default();
        if has_position {
            return set;
        }
        let rsi = ctx.ind("rsi14_15m");
        let rsi_low = self.profile.param_f64("rsi_low", 30.0);
        let rsi_high = self.profile.param_f64("rsi_high", 70.0);
        set.long.push(Condition {
            direction: "long".into(),
            timeframe: "15m".into(),
            ok: rsi.is_some_and(|r| r < rsi_low),
            desc: format!("rsi14_15m < {rsi_low}"),
            value: rsi,
            target: Some(rsi_low),
            label: "rsi oversold".into(),
        });
        set.short.push(Condition {
            direction: "short".into(),
            timeframe: "15m".into(),
            ok: rsi.is_some_and(|r| r > rsi_high),
            desc: format!("rsi14_15m > {rsi_high}"),
            value: rsi,
            target: Some(rsi_high),
            label: "rsi overbought".into(),
        });
        set
    }

    fn on_bar_close(&mut self, ctx: &StrategyContext) -> Option<Decision> {
        if ctx.position.is_some() {
            self.check_exit(ctx, ctx.close_15m)
        } else {
            self.check_entry(ctx)
        }
    }

    fn on_tick(&mut self, ctx: &StrategyContext, price: f64) -> Option<Decision> {
        self.check_exit(ctx, price)
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
    fn long_entry_when_oversold() {
        let mut strat = SimpleRsiOvertradeStrategy::new("r1");
        strat.configure(StrategyProfile::default());
        let mut ctx = base_ctx();
        ctx.indicators.insert("rsi14_15m".into(), 25.0);

        let decision = strat.on_bar_close(&ctx);
        match decision {
            Some(Decision::Entry(sig)) => {
                assert_eq!(sig.side, Side::Long);
                assert_eq!(sig.tp1_price, sig.tp2_price);
            }
            other => panic!("expected long entry, got {other:?}"),
        }
    }

    #[test]
    fn tick_exit_stops_out_long_position() {
        let strat = SimpleRsiOvertradeStrategy::new("r1");
        let mut ctx = base_ctx();
        ctx.position = Some(super::super::PositionState {
            side: Side::Long,
            entry_price: 100.0,
            qty: 1.0,
            stop_price: 99.0,
            tp1_price: 101.5,
            tp2_price: 101.5,
            tp1_hit: false,
        });
        let decision = strat.check_exit(&ctx, 98.5);
        assert!(matches!(decision, Some(Decision::Exit(ExitAction { action: ExitActionKind::Stop, .. }))));
    }
}
