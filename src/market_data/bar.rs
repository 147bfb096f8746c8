// =============================================================================
// Bar — a single OHLCV candlestick, closed or in-progress.
// =============================================================================

use serde::{Deserialize, Serialize};

/// One candlestick. Time fields are integer milliseconds. Identity is
/// `(symbol, interval, open_time)` — upserts are idempotent on that key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: i64,
    pub is_closed: bool,
}

impl Bar {
    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        match prev_close {
            None => self.high - self.low,
            Some(pc) => (self.high - self.low)
                .max((self.high - pc).abs())
                .max((self.low - pc).abs()),
        }
    }
}

/// Composite key identifying one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64) -> Bar {
        Bar {
            open_time: 0,
            close_time: 1,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
            trades: 1,
            is_closed: true,
        }
    }

    #[test]
    fn true_range_without_prev_close_is_high_minus_low() {
        let b = bar(105.0, 95.0);
        assert_eq!(b.true_range(None), 10.0);
    }

    #[test]
    fn true_range_reflects_gap_against_prev_close() {
        let b = bar(115.0, 108.0);
        // |115 - 95| = 20 > 115 - 108 = 7
        assert_eq!(b.true_range(Some(95.0)), 20.0);
    }
}
