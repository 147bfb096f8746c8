// =============================================================================
// Average True Range (Wilder smoothing) — incremental spec.
// =============================================================================
//
// TR = max(H-L, |H-prevClose|, |L-prevClose|); first bar uses H-L. Seeded
// with atr=TR on the first bar, then atr <- (atr*(L-1) + TR) / L.
// history_size=1 — no built-in strategy reads a trailing ATR window, only
// the current value (see DESIGN.md Open Question resolution).

use super::{IndicatorResult, IndicatorSpec};
use crate::market_data::Bar;

#[derive(Debug, Clone)]
pub struct AtrSpec {
    name: String,
    interval: String,
    length: usize,
    last_close: Option<f64>,
    atr: Option<f64>,
}

impl AtrSpec {
    pub fn new(name: impl Into<String>, interval: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            interval: interval.into(),
            length,
            last_close: None,
            atr: None,
        }
    }

    fn next_value(&self, bar: &Bar) -> f64 {
        let tr = bar.true_range(self.last_close);
        match self.atr {
            None => tr,
            Some(prev) => (prev * (self.length as f64 - 1.0) + tr) / self.length as f64,
        }
    }
}

impl IndicatorSpec for AtrSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> &str {
        &self.interval
    }

    fn warmup_bars(&self) -> usize {
        self.length + 1
    }

    fn history_size(&self) -> usize {
        1
    }

    fn update(&mut self, bar: &Bar) -> IndicatorResult {
        let value = self.next_value(bar);
        self.atr = Some(value);
        self.last_close = Some(bar.close);
        IndicatorResult {
            name: self.name.clone(),
            value: Some(value),
            history: vec![value],
            extras: Default::default(),
        }
    }

    fn preview(&self, bar: &Bar) -> IndicatorResult {
        let value = self.next_value(bar);
        IndicatorResult {
            name: self.name.clone(),
            value: Some(value),
            history: self.atr.map(|v| vec![v]).unwrap_or_default(),
            extras: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 1,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            trades: 1,
            is_closed: true,
        }
    }

    #[test]
    fn first_bar_seeds_with_high_minus_low() {
        let mut atr = AtrSpec::new("atr14_15m", "15m", 14);
        let r = atr.update(&bar(105.0, 95.0, 100.0));
        assert_eq!(r.value, Some(10.0));
    }

    #[test]
    fn gap_reflected_via_prev_close() {
        let mut atr = AtrSpec::new("atr3", "15m", 3);
        atr.update(&bar(105.0, 95.0, 95.0));
        // gap up: |115-95|=20 > 115-108=7
        let r = atr.update(&bar(115.0, 108.0, 112.0));
        assert!((r.value.unwrap() - (10.0 * 2.0 + 20.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn history_size_is_one() {
        let mut atr = AtrSpec::new("atr3", "15m", 3);
        for _ in 0..5 {
            atr.update(&bar(105.0, 95.0, 100.0));
        }
        assert_eq!(atr.history_size(), 1);
    }
}
