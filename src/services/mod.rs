// =============================================================================
// Services — portfolio/account bookkeeping and position lifecycle.
// =============================================================================
//
// Shared state shapes wiring `PortfolioService` and `PositionService`
// together, grounded in `backend/services/{portfolio_service,position_service}.py`.
// Per §9's cyclic-reference resolution: `PortfolioService` holds the same
// `PositionMap` as `PositionService` but only ever reads it; `PositionService`
// is the sole writer.

pub mod portfolio;
pub mod position;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as Json;

use crate::strategy::{PositionState, Side, StrategyProfile};

/// Per-strategy simulated account. `equity = balance + upl`,
/// `free_margin = equity - margin_used` (I2).
#[derive(Debug, Clone, Copy)]
pub struct Account {
    pub balance: f64,
    pub equity: f64,
    pub upl: f64,
    pub margin_used: f64,
    pub free_margin: f64,
}

impl Account {
    pub fn new(initial_capital: f64) -> Self {
        Self { balance: initial_capital, equity: initial_capital, upl: 0.0, margin_used: 0.0, free_margin: initial_capital }
    }
}

pub type PositionMap = Arc<RwLock<HashMap<String, Option<PositionState>>>>;
pub type AccountMap = Arc<RwLock<HashMap<String, Account>>>;
pub type CooldownMap = Arc<RwLock<HashMap<String, i64>>>;
pub type ProfileMap = Arc<HashMap<String, StrategyProfile>>;

/// The live-status payload published to `status_store` after every account
/// or position mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSummary {
    pub strategy: String,
    pub balance: f64,
    pub equity: f64,
    pub upl: f64,
    pub margin_used: f64,
    pub free_margin: f64,
    pub liq_price: Option<f64>,
    pub position_side: Option<Side>,
    pub position_qty: Option<f64>,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub cooldown_bars: i64,
}

/// Sink for the process-wide "current status" store, implemented by
/// `AppState`. Kept as a trait so `services` does not depend on `app_state`.
pub trait StatusSink: Send + Sync {
    fn update(&self, summary: StatusSummary);
}

/// Sink for the append-only event/snapshot stream pushed to `/ws/stream`
/// clients, implemented by `AppState`.
pub trait StreamSink: Send + Sync {
    fn add_event(&self, event: Json);
    fn update_snapshot(&self, patch: Json);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_new_starts_at_initial_capital_with_zero_upl() {
        let acc = Account::new(1000.0);
        assert_eq!(acc.balance, 1000.0);
        assert_eq!(acc.equity, 1000.0);
        assert_eq!(acc.free_margin, 1000.0);
        assert_eq!(acc.upl, 0.0);
    }
}
