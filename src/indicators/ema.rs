// =============================================================================
// Exponential Moving Average — incremental spec.
// =============================================================================
//
// ema <- close*k + ema*(1-k), k = 2/(length+1). Seeded with close on the
// first bar. warmup_bars = max(2, length+1).

use super::{push_history, IndicatorResult, IndicatorSpec};
use crate::market_data::Bar;

#[derive(Debug, Clone)]
pub struct EmaSpec {
    name: String,
    interval: String,
    length: usize,
    history_size: usize,
    ema: Option<f64>,
    history: Vec<f64>,
}

impl EmaSpec {
    pub fn new(name: impl Into<String>, interval: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            interval: interval.into(),
            length,
            history_size: 3,
            ema: None,
            history: Vec::new(),
        }
    }

    fn k(&self) -> f64 {
        2.0 / (self.length as f64 + 1.0)
    }

    fn next_value(&self, close: f64) -> f64 {
        match self.ema {
            None => close,
            Some(prev) => close * self.k() + prev * (1.0 - self.k()),
        }
    }
}

impl IndicatorSpec for EmaSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> &str {
        &self.interval
    }

    fn warmup_bars(&self) -> usize {
        (self.length + 1).max(2)
    }

    fn history_size(&self) -> usize {
        self.history_size
    }

    fn update(&mut self, bar: &Bar) -> IndicatorResult {
        let value = self.next_value(bar.close);
        self.ema = Some(value);
        push_history(&mut self.history, value, self.history_size);
        IndicatorResult {
            name: self.name.clone(),
            value: Some(value),
            history: self.history.clone(),
            extras: Default::default(),
        }
    }

    fn preview(&self, bar: &Bar) -> IndicatorResult {
        let value = self.next_value(bar.close);
        IndicatorResult {
            name: self.name.clone(),
            value: Some(value),
            history: self.history.clone(),
            extras: Default::default(),
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
    fn first_bar_seeds_with_close() {
        let mut ema = EmaSpec::new("ema20_15m", "15m", 20);
        let r = ema.update(&bar(100.0));
        assert_eq!(r.value, Some(100.0));
    }

    #[test]
    fn subsequent_bars_apply_smoothing() {
        let mut ema = EmaSpec::new("ema3", "15m", 3);
        ema.update(&bar(10.0));
        let r = ema.update(&bar(20.0));
        // k = 2/4 = 0.5 -> 20*0.5 + 10*0.5 = 15
        assert!((r.value.unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn preview_does_not_mutate_state() {
        let mut ema = EmaSpec::new("ema3", "15m", 3);
        ema.update(&bar(10.0));
        let preview = ema.preview(&bar(999.0));
        let committed = ema.update(&bar(20.0));
        // The preview's hypothetical 999.0 input must not have leaked into state.
        assert!((committed.value.unwrap() - 15.0).abs() < 1e-9);
        assert!(preview.value.unwrap() > 500.0);
    }

    #[test]
    fn history_caps_at_history_size() {
        let mut ema = EmaSpec::new("ema3", "15m", 3);
        for i in 0..10 {
            ema.update(&bar(100.0 + i as f64));
        }
        assert_eq!(ema.history.len(), 3);
    }
}
