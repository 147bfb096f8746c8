// =============================================================================
// BufferManager — bounded, append-only per-interval bar history.
// =============================================================================
//
// Sizing is computed once at startup from aggregated strategy requirements:
// `max(per-strategy warmup_bars * buffer_mult + extra, floor)`, with
// per-interval floors of 500 (15m) / 200 (1h). Grounded in the teacher's
// `CandleBuffer` ring-trimming discipline (market_data/candle_buffer.rs),
// retargeted from a single combined ring to one ring per interval with
// bars instead of full Binance kline fields.

use std::collections::VecDeque;

use crate::market_data::Bar;

/// Per-interval floor so even a strategy with a tiny warmup still gets a
/// reasonable amount of history to browse/replay.
pub fn interval_floor(interval: &str) -> usize {
    match interval {
        "15m" => 500,
        "1h" => 200,
        _ => 200,
    }
}

/// `max(per-strategy warmup_bars * buffer_mult + extra, floor)` aggregated
/// across every strategy that uses `interval`.
pub fn compute_buffer_size(warmup_bars: &[(usize, f64, usize)], interval: &str) -> usize {
    let floor = interval_floor(interval);
    warmup_bars
        .iter()
        .map(|&(warmup, buffer_mult, extra)| {
            ((warmup as f64 * buffer_mult).ceil() as usize) + extra
        })
        .max()
        .unwrap_or(0)
        .max(floor)
}

/// Bounded ring of bars for one interval, in event order, oldest first.
pub struct BufferManager {
    rings: std::collections::HashMap<String, VecDeque<Bar>>,
    capacities: std::collections::HashMap<String, usize>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self {
            rings: std::collections::HashMap::new(),
            capacities: std::collections::HashMap::new(),
        }
    }

    pub fn set_capacity(&mut self, interval: impl Into<String>, capacity: usize) {
        let interval = interval.into();
        self.rings
            .entry(interval.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        self.capacities.insert(interval, capacity.max(1));
    }

    /// Append a closed bar, dropping the oldest bar once at capacity.
    pub fn append(&mut self, interval: &str, bar: Bar) {
        let cap = *self.capacities.get(interval).unwrap_or(&interval_floor(interval));
        let ring = self
            .rings
            .entry(interval.to_string())
            .or_insert_with(|| VecDeque::with_capacity(cap));
        ring.push_back(bar);
        while ring.len() > cap {
            ring.pop_front();
        }
    }

    /// Immutable snapshot of the buffered bars for `interval`, oldest first.
    pub fn snapshot(&self, interval: &str) -> Vec<Bar> {
        self.rings
            .get(interval)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn last(&self, interval: &str) -> Option<Bar> {
        self.rings.get(interval).and_then(|r| r.back().copied())
    }

    pub fn len(&self, interval: &str) -> usize {
        self.rings.get(interval).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, interval: &str) -> bool {
        self.len(interval) == 0
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64) -> Bar {
        Bar {
            open_time,
            close_time: open_time + 899_999,
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
    fn buffer_size_respects_floor() {
        // A strategy whose own warmup is tiny still gets the interval floor.
        assert_eq!(compute_buffer_size(&[(10, 1.0, 0)], "15m"), 500);
        assert_eq!(compute_buffer_size(&[(10, 1.0, 0)], "1h"), 200);
    }

    #[test]
    fn buffer_size_scales_with_largest_strategy_requirement() {
        let size = compute_buffer_size(&[(100, 2.0, 50), (40, 1.0, 0)], "15m");
        assert_eq!(size, 500); // 100*2+50=250 still under the 500 floor
        let size2 = compute_buffer_size(&[(400, 2.0, 50)], "15m");
        assert_eq!(size2, 850);
    }

    #[test]
    fn ring_trims_to_capacity() {
        let mut mgr = BufferManager::new();
        mgr.set_capacity("15m", 3);
        for i in 0..5 {
            mgr.append("15m", bar(i * 900_000, 100.0 + i as f64));
        }
        assert_eq!(mgr.len("15m"), 3);
        let snap = mgr.snapshot("15m");
        assert_eq!(snap.first().unwrap().close, 102.0);
        assert_eq!(snap.last().unwrap().close, 104.0);
    }
}
