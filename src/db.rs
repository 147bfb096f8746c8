// =============================================================================
// Persistence — thin async wrapper over a single-connection SQLite pool.
// =============================================================================
//
// Mirrors the teacher's `runtime_config.rs` atomic-write discipline for the
// on-disk artifact, but here the artifact is a relational store rather than a
// JSON file. A single `SqlitePool` capped at one connection keeps every
// caller serialized through one handle, matching the concurrency model's
// "DB connection serialized through a single handle" rule.
//
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::models::{
    Alert, EquitySnapshot, Kline, LedgerEntry, LedgerRow, PositionClose, PositionOpen, PositionRow,
    Trade, TradeRow,
};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if absent) the SQLite file at `path` and apply the DDL
    /// script embedded at compile time.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .with_context(|| format!("invalid sqlite path {}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;

        info!(path = %path.display(), "db connected");
        Ok(Self { pool })
    }

    /// In-memory pool for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite db")?;
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../schema.sql"))
            .execute(&self.pool)
            .await
            .context("failed to apply schema.sql")?;
        info!("db schema initialized");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("db closed");
    }

    // -- klines ---------------------------------------------------------

    pub async fn upsert_kline(&self, k: &Kline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO klines (
              symbol, interval, open_time, close_time, open, high, low, close,
              volume, trades, is_closed, source, created_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
              close_time=excluded.close_time,
              open=excluded.open,
              high=excluded.high,
              low=excluded.low,
              close=excluded.close,
              volume=excluded.volume,
              trades=excluded.trades,
              is_closed=excluded.is_closed,
              source=excluded.source,
              created_at=excluded.created_at
            "#,
        )
        .bind(&k.symbol)
        .bind(&k.interval)
        .bind(k.open_time)
        .bind(k.close_time)
        .bind(k.open)
        .bind(k.high)
        .bind(k.low)
        .bind(k.close)
        .bind(k.volume)
        .bind(k.trades)
        .bind(k.is_closed)
        .bind(&k.source)
        .bind(k.created_at)
        .execute(&self.pool)
        .await
        .context("upsert_kline failed")?;
        Ok(())
    }

    // -- trades -----------------------------------------------------------

    pub async fn insert_trade(&self, t: &Trade) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO trades (
              strategy, symbol, position_id, side, trade_type, price, qty, notional,
              fee_amount, fee_rate, timestamp, reason, created_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
            RETURNING trade_id
            "#,
        )
        .bind(&t.strategy)
        .bind(&t.symbol)
        .bind(t.position_id)
        .bind(&t.side)
        .bind(&t.trade_type)
        .bind(t.price)
        .bind(t.qty)
        .bind(t.notional)
        .bind(t.fee_amount)
        .bind(t.fee_rate)
        .bind(t.timestamp)
        .bind(&t.reason)
        .bind(t.created_at)
        .fetch_one(&self.pool)
        .await
        .context("insert_trade failed")?;
        Ok(row.get("trade_id"))
    }

    // -- positions ----------------------------------------------------------

    /// Insert a new OPEN position, or update an existing one by `position_id`.
    pub async fn upsert_position_open(&self, p: &PositionOpen) -> Result<i64> {
        if let Some(id) = p.position_id {
            sqlx::query(
                r#"
                UPDATE positions SET
                  symbol=?, side=?, qty=?, entry_price=?, entry_time=?, leverage=?, margin=?,
                  stop_price=?, tp1_price=?, tp2_price=?, status=?, realized_pnl=?, fees_total=?,
                  liq_price=?, updated_at=?
                WHERE position_id=?
                "#,
            )
            .bind(&p.symbol)
            .bind(&p.side)
            .bind(p.qty)
            .bind(p.entry_price)
            .bind(p.entry_time)
            .bind(p.leverage)
            .bind(p.margin)
            .bind(p.stop_price)
            .bind(p.tp1_price)
            .bind(p.tp2_price)
            .bind(&p.status)
            .bind(p.realized_pnl)
            .bind(p.fees_total)
            .bind(p.liq_price)
            .bind(p.updated_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update position failed")?;
            return Ok(id);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO positions (
              strategy, symbol, side, qty, entry_price, entry_time, leverage, margin,
              stop_price, tp1_price, tp2_price, status, realized_pnl, fees_total,
              liq_price, created_at, updated_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            RETURNING position_id
            "#,
        )
        .bind(&p.strategy)
        .bind(&p.symbol)
        .bind(&p.side)
        .bind(p.qty)
        .bind(p.entry_price)
        .bind(p.entry_time)
        .bind(p.leverage)
        .bind(p.margin)
        .bind(p.stop_price)
        .bind(p.tp1_price)
        .bind(p.tp2_price)
        .bind(&p.status)
        .bind(p.realized_pnl)
        .bind(p.fees_total)
        .bind(p.liq_price)
        .bind(p.created_at)
        .bind(p.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("insert position failed")?;
        Ok(row.get("position_id"))
    }

    pub async fn close_position(&self, p: &PositionClose) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
              status=?, realized_pnl=?, fees_total=?, liq_price=?, close_time=?, close_reason=?, updated_at=?
            WHERE position_id=?
            "#,
        )
        .bind(&p.status)
        .bind(p.realized_pnl)
        .bind(p.fees_total)
        .bind(p.liq_price)
        .bind(p.close_time)
        .bind(&p.close_reason)
        .bind(p.updated_at)
        .bind(p.position_id)
        .execute(&self.pool)
        .await
        .context("close_position failed")?;
        Ok(())
    }

    pub async fn get_open_position(
        &self,
        symbol: &str,
        strategy: &str,
    ) -> Result<Option<PositionRow>> {
        let row = sqlx::query(
            "SELECT * FROM positions WHERE status='OPEN' AND symbol=? AND strategy=? ORDER BY entry_time DESC LIMIT 1",
        )
        .bind(symbol)
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await
        .context("get_open_position failed")?;

        Ok(row.map(|r| PositionRow {
            position_id: r.get("position_id"),
            strategy: r.get("strategy"),
            symbol: r.get("symbol"),
            side: r.get("side"),
            qty: r.get("qty"),
            entry_price: r.get("entry_price"),
            entry_time: r.get("entry_time"),
            leverage: r.get("leverage"),
            margin: r.get("margin"),
            stop_price: r.get("stop_price"),
            tp1_price: r.get("tp1_price"),
            tp2_price: r.get("tp2_price"),
            status: r.get("status"),
            realized_pnl: r.get("realized_pnl"),
            fees_total: r.get("fees_total"),
            liq_price: r.get("liq_price"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    pub async fn get_positions(
        &self,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<PositionRow>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT * FROM positions WHERE status=? ORDER BY entry_time DESC LIMIT ?")
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM positions ORDER BY entry_time DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .context("get_positions failed")?;

        Ok(rows
            .into_iter()
            .map(|r| PositionRow {
                position_id: r.get("position_id"),
                strategy: r.get("strategy"),
                symbol: r.get("symbol"),
                side: r.get("side"),
                qty: r.get("qty"),
                entry_price: r.get("entry_price"),
                entry_time: r.get("entry_time"),
                leverage: r.get("leverage"),
                margin: r.get("margin"),
                stop_price: r.get("stop_price"),
                tp1_price: r.get("tp1_price"),
                tp2_price: r.get("tp2_price"),
                status: r.get("status"),
                realized_pnl: r.get("realized_pnl"),
                fees_total: r.get("fees_total"),
                liq_price: r.get("liq_price"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Most recent trades, optionally filtered to one strategy.
    pub async fn get_trades(&self, strategy: Option<&str>, limit: i64) -> Result<Vec<TradeRow>> {
        let rows = if let Some(strategy) = strategy {
            sqlx::query("SELECT * FROM trades WHERE strategy=? ORDER BY timestamp DESC LIMIT ?")
                .bind(strategy)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM trades ORDER BY timestamp DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .context("get_trades failed")?;

        Ok(rows
            .into_iter()
            .map(|r| TradeRow {
                trade_id: r.get("trade_id"),
                strategy: r.get("strategy"),
                symbol: r.get("symbol"),
                position_id: r.get("position_id"),
                side: r.get("side"),
                trade_type: r.get("trade_type"),
                price: r.get("price"),
                qty: r.get("qty"),
                notional: r.get("notional"),
                fee_amount: r.get("fee_amount"),
                fee_rate: r.get("fee_rate"),
                timestamp: r.get("timestamp"),
                reason: r.get("reason"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Klines for `symbol`/`interval`, most recent first.
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: i64) -> Result<Vec<Kline>> {
        let rows = sqlx::query(
            "SELECT * FROM klines WHERE symbol=? AND interval=? ORDER BY open_time DESC LIMIT ?",
        )
        .bind(symbol)
        .bind(interval)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("get_klines failed")?;

        Ok(rows
            .into_iter()
            .map(|r| Kline {
                symbol: r.get("symbol"),
                interval: r.get("interval"),
                open_time: r.get("open_time"),
                close_time: r.get("close_time"),
                open: r.get("open"),
                high: r.get("high"),
                low: r.get("low"),
                close: r.get("close"),
                volume: r.get("volume"),
                trades: r.get("trades"),
                is_closed: r.get("is_closed"),
                source: r.get("source"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    // -- equity / ledger / alerts --------------------------------------------

    pub async fn insert_equity_snapshot(&self, s: &EquitySnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO equity_snapshots (strategy, timestamp, balance, equity, upl, margin_used, free_margin) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(&s.strategy)
        .bind(s.timestamp)
        .bind(s.balance)
        .bind(s.equity)
        .bind(s.upl)
        .bind(s.margin_used)
        .bind(s.free_margin)
        .execute(&self.pool)
        .await
        .context("insert_equity_snapshot failed")?;
        Ok(())
    }

    pub async fn last_equity_snapshot(&self, strategy: &str) -> Result<Option<EquitySnapshot>> {
        let row = sqlx::query(
            "SELECT strategy, timestamp, balance, equity, upl, margin_used, free_margin FROM equity_snapshots WHERE strategy=? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(strategy)
        .fetch_optional(&self.pool)
        .await
        .context("last_equity_snapshot failed")?;

        Ok(row.map(|r| EquitySnapshot {
            strategy: r.get("strategy"),
            timestamp: r.get("timestamp"),
            balance: r.get("balance"),
            equity: r.get("equity"),
            upl: r.get("upl"),
            margin_used: r.get("margin_used"),
            free_margin: r.get("free_margin"),
        }))
    }

    /// Most recent equity snapshots for `strategy`, newest first.
    pub async fn get_equity_snapshots(&self, strategy: &str, limit: i64) -> Result<Vec<EquitySnapshot>> {
        let rows = sqlx::query(
            "SELECT strategy, timestamp, balance, equity, upl, margin_used, free_margin FROM equity_snapshots WHERE strategy=? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(strategy)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("get_equity_snapshots failed")?;

        Ok(rows
            .into_iter()
            .map(|r| EquitySnapshot {
                strategy: r.get("strategy"),
                timestamp: r.get("timestamp"),
                balance: r.get("balance"),
                equity: r.get("equity"),
                upl: r.get("upl"),
                margin_used: r.get("margin_used"),
                free_margin: r.get("free_margin"),
            })
            .collect())
    }

    pub async fn insert_ledger(&self, l: &LedgerEntry) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO ledger (strategy, timestamp, type, amount, currency, symbol, ref, note, created_at) VALUES (?,?,?,?,?,?,?,?,?) RETURNING ledger_id",
        )
        .bind(&l.strategy)
        .bind(l.timestamp)
        .bind(&l.kind)
        .bind(l.amount)
        .bind(&l.currency)
        .bind(&l.symbol)
        .bind(&l.reference)
        .bind(&l.note)
        .bind(l.created_at)
        .fetch_one(&self.pool)
        .await
        .context("insert_ledger failed")?;
        Ok(row.get("ledger_id"))
    }

    /// Idempotency check for funding settlement (I3): does a funding ledger
    /// entry already exist for `(strategy, fundingTime)`?
    pub async fn funding_entry_exists(&self, strategy: &str, funding_time_ref: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM ledger WHERE strategy=? AND type='funding' AND ref=? LIMIT 1",
        )
        .bind(strategy)
        .bind(funding_time_ref)
        .fetch_optional(&self.pool)
        .await
        .context("funding_entry_exists failed")?;
        Ok(row.is_some())
    }

    /// Most recent ledger entries, optionally filtered to one strategy.
    pub async fn get_ledger(&self, strategy: Option<&str>, limit: i64) -> Result<Vec<LedgerRow>> {
        let rows = if let Some(strategy) = strategy {
            sqlx::query("SELECT * FROM ledger WHERE strategy=? ORDER BY timestamp DESC LIMIT ?")
                .bind(strategy)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT * FROM ledger ORDER BY timestamp DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .context("get_ledger failed")?;

        Ok(rows
            .into_iter()
            .map(|r| LedgerRow {
                ledger_id: r.get("ledger_id"),
                strategy: r.get("strategy"),
                timestamp: r.get("timestamp"),
                kind: r.get("type"),
                amount: r.get("amount"),
                currency: r.get("currency"),
                symbol: r.get("symbol"),
                reference: r.get("ref"),
                note: r.get("note"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn insert_alert(&self, a: &Alert) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (timestamp, channel, level, message, dedup_key, created_at) VALUES (?,?,?,?,?,?)",
        )
        .bind(a.timestamp)
        .bind(&a.channel)
        .bind(&a.level)
        .bind(&a.message)
        .bind(&a.dedup_key)
        .bind(a.created_at)
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?;
        Ok(())
    }

    // -- app_state key/value ------------------------------------------------

    pub async fn app_state_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM app_state WHERE key=?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("app_state_get failed")?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn app_state_set(&self, key: &str, value: &str, updated_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_state (key, value, updated_at) VALUES (?,?,?)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("app_state_set failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionClose, PositionOpen};

    async fn memdb() -> Database {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_schema().await.unwrap();
        db
    }

    #[tokio::test]
    async fn open_then_close_position_roundtrip() {
        let db = memdb().await;
        let id = db
            .upsert_position_open(&PositionOpen {
                position_id: None,
                strategy: "default".into(),
                symbol: "BTCUSDT".into(),
                side: "LONG".into(),
                qty: 200.0,
                entry_price: 100.0,
                entry_time: 1,
                leverage: 20,
                margin: 1000.0,
                stop_price: Some(95.0),
                tp1_price: Some(105.0),
                tp2_price: Some(110.0),
                status: "OPEN".into(),
                realized_pnl: 0.0,
                fees_total: 8.0,
                liq_price: Some(90.0),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();

        let open = db.get_open_position("BTCUSDT", "default").await.unwrap();
        assert!(open.is_some());
        assert_eq!(open.unwrap().position_id, id);

        db.close_position(&PositionClose {
            position_id: id,
            strategy: "default".into(),
            status: "CLOSED".into(),
            realized_pnl: 1500.0,
            fees_total: 16.6,
            liq_price: Some(90.0),
            close_time: 2,
            close_reason: Some("tp2".into()),
            updated_at: 2,
        })
        .await
        .unwrap();

        let open = db.get_open_position("BTCUSDT", "default").await.unwrap();
        assert!(open.is_none());
    }

    #[tokio::test]
    async fn funding_idempotency_check() {
        let db = memdb().await;
        assert!(!db.funding_entry_exists("default", "12345").await.unwrap());
        db.insert_ledger(&LedgerEntry {
            strategy: "default".into(),
            timestamp: 12345,
            kind: "funding".into(),
            amount: 2.0,
            currency: "USDT".into(),
            symbol: "BTCUSDT".into(),
            reference: "12345".into(),
            note: "rate=0.0001".into(),
            created_at: 12345,
        })
        .await
        .unwrap();
        assert!(db.funding_entry_exists("default", "12345").await.unwrap());
    }

    #[tokio::test]
    async fn kline_upsert_is_idempotent_on_identity() {
        let db = memdb().await;
        let mut k = Kline {
            symbol: "BTCUSDT".into(),
            interval: "15m".into(),
            open_time: 1000,
            close_time: 1899,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
            trades: 5,
            is_closed: false,
            source: "ws".into(),
            created_at: 1,
        };
        db.upsert_kline(&k).await.unwrap();
        k.is_closed = true;
        k.close = 100.9;
        db.upsert_kline(&k).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) as c FROM klines WHERE symbol=? AND interval=? AND open_time=?")
            .bind("BTCUSDT")
            .bind("15m")
            .bind(1000i64)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let count: i64 = row.get("c");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn get_trades_filters_by_strategy_and_orders_newest_first() {
        let db = memdb().await;
        let trade = |strategy: &str, ts: i64| Trade {
            strategy: strategy.into(),
            symbol: "BTCUSDT".into(),
            position_id: 1,
            side: "LONG".into(),
            trade_type: "ENTRY".into(),
            price: 100.0,
            qty: 1.0,
            notional: 100.0,
            fee_amount: 0.04,
            fee_rate: 0.0004,
            timestamp: ts,
            reason: "test".into(),
            created_at: ts,
        };
        db.insert_trade(&trade("default", 1)).await.unwrap();
        db.insert_trade(&trade("default", 2)).await.unwrap();
        db.insert_trade(&trade("other", 3)).await.unwrap();

        let rows = db.get_trades(Some("default"), 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 2);

        let all = db.get_trades(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn get_ledger_and_equity_snapshots_roundtrip() {
        let db = memdb().await;
        db.insert_ledger(&LedgerEntry {
            strategy: "default".into(),
            timestamp: 1,
            kind: "fee".into(),
            amount: -0.04,
            currency: "USDT".into(),
            symbol: "BTCUSDT".into(),
            reference: "1".into(),
            note: "entry fee".into(),
            created_at: 1,
        })
        .await
        .unwrap();
        let ledger = db.get_ledger(Some("default"), 10).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, "fee");

        db.insert_equity_snapshot(&EquitySnapshot {
            strategy: "default".into(),
            timestamp: 1,
            balance: 1000.0,
            equity: 1000.0,
            upl: 0.0,
            margin_used: 0.0,
            free_margin: 1000.0,
        })
        .await
        .unwrap();
        let snaps = db.get_equity_snapshots("default", 10).await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].balance, 1000.0);
    }
}
