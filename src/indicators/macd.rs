// =============================================================================
// MACD histogram — incremental spec.
// =============================================================================
//
// Two EMAs on close (each seeded with the first close, per the EMA rule);
// macd = ema_fast - ema_slow; signal = EMA(macd, signal_length) seeded with
// the first computed macd value; hist = macd - signal. The spec's primary
// value is `hist`; `extras.macd`/`extras.signal` carry the two lines.

use std::collections::HashMap;

use super::ema::EmaSpec;
use super::{push_history, IndicatorResult, IndicatorSpec};
use crate::market_data::Bar;

#[derive(Debug, Clone)]
pub struct MacdSpec {
    name: String,
    interval: String,
    fast: EmaSpec,
    slow: EmaSpec,
    signal_length: usize,
    signal_ema: Option<f64>,
    history_size: usize,
    history: Vec<f64>,
}

impl MacdSpec {
    pub fn new(
        name: impl Into<String>,
        interval: impl Into<String>,
        fast: usize,
        slow: usize,
        signal: usize,
    ) -> Self {
        let interval = interval.into();
        Self {
            name: name.into(),
            fast: EmaSpec::new("__macd_fast", interval.clone(), fast),
            slow: EmaSpec::new("__macd_slow", interval.clone(), slow),
            signal_length: signal,
            signal_ema: None,
            history_size: 3,
            history: Vec::new(),
            interval,
        }
    }

    fn signal_k(&self) -> f64 {
        2.0 / (self.signal_length as f64 + 1.0)
    }
}

impl IndicatorSpec for MacdSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> &str {
        &self.interval
    }

    fn warmup_bars(&self) -> usize {
        self.fast
            .warmup_bars()
            .max(self.slow.warmup_bars())
            .max(self.signal_length + self.slow.warmup_bars())
    }

    fn history_size(&self) -> usize {
        self.history_size
    }

    fn update(&mut self, bar: &Bar) -> IndicatorResult {
        let fast = self.fast.update(bar).value.expect("ema always produces a value");
        let slow = self.slow.update(bar).value.expect("ema always produces a value");
        let macd = fast - slow;

        let signal = match self.signal_ema {
            None => macd,
            Some(prev) => macd * self.signal_k() + prev * (1.0 - self.signal_k()),
        };
        self.signal_ema = Some(signal);

        let hist = macd - signal;
        push_history(&mut self.history, hist, self.history_size);

        let mut extras = HashMap::new();
        extras.insert("macd".to_string(), macd);
        extras.insert("signal".to_string(), signal);

        IndicatorResult {
            name: self.name.clone(),
            value: Some(hist),
            history: self.history.clone(),
            extras,
        }
    }

    fn preview(&self, bar: &Bar) -> IndicatorResult {
        let fast = self.fast.preview(bar).value.expect("ema always produces a value");
        let slow = self.slow.preview(bar).value.expect("ema always produces a value");
        let macd = fast - slow;

        let signal = match self.signal_ema {
            None => macd,
            Some(prev) => macd * self.signal_k() + prev * (1.0 - self.signal_k()),
        };

        let hist = macd - signal;
        let mut extras = HashMap::new();
        extras.insert("macd".to_string(), macd);
        extras.insert("signal".to_string(), signal);

        IndicatorResult {
            name: self.name.clone(),
            value: Some(hist),
            history: self.history.clone(),
            extras,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 1,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trades: 1,
            is_closed: true,
        }
    }

    #[test]
    fn first_bar_zero_histogram() {
        let mut macd = MacdSpec::new("macd_hist_15m", "15m", 12, 26, 9);
        let r = macd.update(&bar(100.0));
        // fast==slow==100 on bar one, so macd==0, signal seeds to macd==0.
        assert_eq!(r.value, Some(0.0));
    }

    #[test]
    fn trending_series_produces_nonzero_histogram() {
        let mut macd = MacdSpec::new("macd_hist_15m", "15m", 3, 6, 3);
        let mut last = 0.0;
        for i in 0..20 {
            last = macd.update(&bar(100.0 + i as f64)).value.unwrap();
        }
        assert!(last.abs() > 0.0);
    }

    #[test]
    fn preview_matches_subsequent_commit() {
        let mut macd = MacdSpec::new("macd_hist_15m", "15m", 3, 6, 3);
        for i in 0..10 {
            macd.update(&bar(100.0 + i as f64));
        }
        let preview = macd.preview(&bar(150.0));
        let committed = macd.update(&bar(150.0));
        assert!((preview.value.unwrap() - committed.value.unwrap()).abs() < 1e-9);
    }
}
