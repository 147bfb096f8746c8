// =============================================================================
// RSI (Wilder smoothing) — incremental spec.
// =============================================================================
//
// On the first close, only `last_close` is stored and the result is null.
// The seed for avg_gain/avg_loss is the simple average of gain/loss over the
// first `length` closes following that initial one (the teacher-style batch
// seed, not a single-point seed — see DESIGN.md for this Open Question).
// Thereafter Wilder smoothing: avg <- (avg*(L-1) + x) / L.

use super::{push_history, IndicatorResult, IndicatorSpec};
use crate::market_data::Bar;

#[derive(Debug, Clone)]
pub struct RsiSpec {
    name: String,
    interval: String,
    length: usize,
    history_size: usize,
    last_close: Option<f64>,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
    seed_gains: Vec<f64>,
    seed_losses: Vec<f64>,
    history: Vec<f64>,
}

impl RsiSpec {
    pub fn new(name: impl Into<String>, interval: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            interval: interval.into(),
            length,
            history_size: 3,
            last_close: None,
            avg_gain: None,
            avg_loss: None,
            seed_gains: Vec::new(),
            seed_losses: Vec::new(),
            history: Vec::new(),
        }
    }

    fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        }
    }

    /// Pure preview-side computation: given the state as-of `last_close`,
    /// what result would committing `close` produce?
    fn compute(&self, close: f64) -> Option<f64> {
        let last_close = self.last_close?;
        let gain = (close - last_close).max(0.0);
        let loss = (last_close - close).max(0.0);

        if let (Some(ag), Some(al)) = (self.avg_gain, self.avg_loss) {
            let l = self.length as f64;
            let ag = (ag * (l - 1.0) + gain) / l;
            let al = (al * (l - 1.0) + loss) / l;
            return Some(Self::rsi_from(ag, al));
        }

        // Still seeding: not enough gain/loss samples yet to produce a value.
        if self.seed_gains.len() + 1 < self.length {
            return None;
        }
        let mut gains = self.seed_gains.clone();
        let mut losses = self.seed_losses.clone();
        gains.push(gain);
        losses.push(loss);
        let ag = gains.iter().sum::<f64>() / self.length as f64;
        let al = losses.iter().sum::<f64>() / self.length as f64;
        Some(Self::rsi_from(ag, al))
    }
}

impl IndicatorSpec for RsiSpec {
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
        self.history_size
    }

    fn update(&mut self, bar: &Bar) -> IndicatorResult {
        let close = bar.close;

        let Some(last_close) = self.last_close else {
            self.last_close = Some(close);
            return IndicatorResult::null(self.name.clone());
        };

        let gain = (close - last_close).max(0.0);
        let loss = (last_close - close).max(0.0);
        self.last_close = Some(close);

        let value = if let (Some(ag), Some(al)) = (self.avg_gain, self.avg_loss) {
            let l = self.length as f64;
            let ag = (ag * (l - 1.0) + gain) / l;
            let al = (al * (l - 1.0) + loss) / l;
            self.avg_gain = Some(ag);
            self.avg_loss = Some(al);
            Some(Self::rsi_from(ag, al))
        } else {
            self.seed_gains.push(gain);
            self.seed_losses.push(loss);
            if self.seed_gains.len() < self.length {
                None
            } else {
                let ag = self.seed_gains.iter().sum::<f64>() / self.length as f64;
                let al = self.seed_losses.iter().sum::<f64>() / self.length as f64;
                self.avg_gain = Some(ag);
                self.avg_loss = Some(al);
                Some(Self::rsi_from(ag, al))
            }
        };

        if let Some(v) = value {
            push_history(&mut self.history, v, self.history_size);
        }

        IndicatorResult {
            name: self.name.clone(),
            value,
            history: self.history.clone(),
            extras: Default::default(),
        }
    }

    fn preview(&self, bar: &Bar) -> IndicatorResult {
        IndicatorResult {
            name: self.name.clone(),
            value: self.compute(bar.close),
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
    fn first_close_is_null() {
        let mut rsi = RsiSpec::new("rsi14_15m", "15m", 14);
        let r = rsi.update(&bar(44.0));
        assert!(r.value.is_none());
    }

    #[test]
    fn wilder_sequence_matches_reference() {
        // Reference sequence from Wilder 1978, length=14, expect ~70.53 at the
        // last close.
        let closes = [
            44.0, 44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89,
            46.03, 45.61, 46.28,
        ];
        let mut rsi = RsiSpec::new("rsi14_15m", "15m", 14);
        let mut last = None;
        for c in closes {
            last = rsi.update(&bar(c)).value;
        }
        let v = last.expect("should have a value by the last close");
        assert!((v - 70.53).abs() < 0.5, "got {v}");
    }

    #[test]
    fn avg_loss_zero_yields_rsi_100() {
        let mut rsi = RsiSpec::new("rsi3", "15m", 3);
        let mut last = None;
        for c in [10.0, 11.0, 12.0, 13.0, 14.0] {
            last = rsi.update(&bar(c)).value;
        }
        assert_eq!(last, Some(100.0));
    }

    #[test]
    fn preview_matches_subsequent_commit() {
        let mut rsi = RsiSpec::new("rsi3", "15m", 3);
        for c in [10.0, 11.0, 9.0] {
            rsi.update(&bar(c));
        }
        let preview = rsi.preview(&bar(12.0));
        let committed = rsi.update(&bar(12.0));
        assert_eq!(preview.value, committed.value);
    }
}
