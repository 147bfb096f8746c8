// =============================================================================
// Persisted row types — the shapes written to and read from the embedded
// SQL store (see `db.rs` and `schema.sql`).
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single committed (closed) candlestick, as stored in `klines`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: i64,
    pub is_closed: bool,
    pub source: String,
    pub created_at: i64,
}

/// An append-only fill record, entry or exit leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub strategy: String,
    pub symbol: String,
    pub position_id: i64,
    pub side: String,
    pub trade_type: String,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
    pub fee_amount: f64,
    pub fee_rate: f64,
    pub timestamp: i64,
    pub reason: String,
    pub created_at: i64,
}

/// Upsert payload for opening or updating an OPEN position row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionOpen {
    pub position_id: Option<i64>,
    pub strategy: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub leverage: i64,
    pub margin: f64,
    pub stop_price: Option<f64>,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub status: String,
    pub realized_pnl: f64,
    pub fees_total: f64,
    pub liq_price: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Finalization payload for closing a position row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClose {
    pub position_id: i64,
    pub strategy: String,
    pub status: String,
    pub realized_pnl: f64,
    pub fees_total: f64,
    pub liq_price: Option<f64>,
    pub close_time: i64,
    pub close_reason: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub strategy: String,
    pub timestamp: i64,
    pub balance: f64,
    pub equity: f64,
    pub upl: f64,
    pub margin_used: f64,
    pub free_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub strategy: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: f64,
    pub currency: String,
    pub symbol: String,
    pub reference: String,
    pub note: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: i64,
    pub channel: String,
    pub level: String,
    pub message: String,
    pub dedup_key: Option<String>,
    pub created_at: i64,
}

/// A row read back from `trades`, for the `/api/trades` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub trade_id: i64,
    pub strategy: String,
    pub symbol: String,
    pub position_id: i64,
    pub side: String,
    pub trade_type: String,
    pub price: f64,
    pub qty: f64,
    pub notional: f64,
    pub fee_amount: f64,
    pub fee_rate: f64,
    pub timestamp: i64,
    pub reason: String,
    pub created_at: i64,
}

/// A row read back from `ledger`, for the `/api/ledger` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub ledger_id: i64,
    pub strategy: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: f64,
    pub currency: String,
    pub symbol: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub note: String,
    pub created_at: i64,
}

/// A row read back from `positions`, used for recovery and tie-break reads
/// that need the persisted `position_id`/entry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub position_id: i64,
    pub strategy: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub leverage: i64,
    pub margin: f64,
    pub stop_price: Option<f64>,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub status: String,
    pub realized_pnl: f64,
    pub fees_total: f64,
    pub liq_price: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}
