// =============================================================================
// PositionService — position lifecycle: open, partial close, full close.
// =============================================================================
//
// Ported from `backend/services/position_service.py`. Sole writer of the
// shared `PositionMap`; `PortfolioService` only reads it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::alerts::AlertManager;
use crate::db::Database;
use crate::models::{LedgerEntry, PositionClose, PositionOpen, Trade};
use crate::strategy::{EntrySignal, ExitAction, ExitActionKind, PositionState, Side};

use super::portfolio::PortfolioService;
use super::{AccountMap, CooldownMap, PositionMap, ProfileMap, StreamSink};

pub struct PositionService {
    db: Arc<Database>,
    alert: Arc<AlertManager>,
    stream_store: Arc<dyn StreamSink>,
    accounts: AccountMap,
    positions: PositionMap,
    cooldowns: CooldownMap,
    profiles: ProfileMap,
    portfolio: Arc<PortfolioService>,
    symbol: String,
}

impl PositionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        alert: Arc<AlertManager>,
        stream_store: Arc<dyn StreamSink>,
        accounts: AccountMap,
        positions: PositionMap,
        cooldowns: CooldownMap,
        profiles: ProfileMap,
        portfolio: Arc<PortfolioService>,
        symbol: String,
    ) -> Self {
        Self { db, alert, stream_store, accounts, positions, cooldowns, profiles, portfolio, symbol }
    }

    pub fn get_position(&self, sid: &str) -> Option<PositionState> {
        self.positions.read().get(sid).and_then(|p| p.as_ref()).copied()
    }

    pub fn get_cooldown(&self, sid: &str) -> i64 {
        self.cooldowns.read().get(sid).copied().unwrap_or(0)
    }

    /// Decremented only on 15m bar close (per the crate's cooldown-decay
    /// decision), clamped at zero.
    pub fn decrement_cooldown(&self, sid: &str) {
        let mut cooldowns = self.cooldowns.write();
        if let Some(c) = cooldowns.get_mut(sid) {
            *c = (*c - 1).max(0);
        }
    }

    /// Recover every strategy's open position from the DB on startup,
    /// falling back to the `"default"` strategy's open row when none exists
    /// for this strategy id.
    ///
    /// Recovered positions always set `tp1_hit=false`, matching the
    /// original's recovery path literally even though a reduced qty with
    /// `stop_price == entry_price` implies TP1 already fired — see DESIGN.md.
    pub async fn load_open_positions(&self) -> Result<()> {
        let sids: Vec<String> = self.profiles.keys().cloned().collect();
        let mut positions = self.positions.write();
        for sid in sids {
            let mut row = self.db.get_open_position(&self.symbol, &sid).await?;
            if row.is_none() && sid != "default" {
                row = self.db.get_open_position(&self.symbol, "default").await?;
            }
            let state = row.map(|r| PositionState {
                side: if r.side == "LONG" { Side::Long } else { Side::Short },
                entry_price: r.entry_price,
                qty: r.qty,
                stop_price: r.stop_price.unwrap_or(r.entry_price),
                tp1_price: r.tp1_price.unwrap_or(r.entry_price),
                tp2_price: r.tp2_price.unwrap_or(r.entry_price),
                tp1_hit: false,
            });
            positions.insert(sid, state);
        }
        Ok(())
    }

    /// Sizing: `notional_cap = min(max_position_notional, balance * max_position_pct_equity * max_leverage)`,
    /// `qty = notional_cap / entry_price`, fee debited immediately, margin reserved.
    pub async fn open_position(&self, sid: &str, signal: &EntrySignal) -> Result<()> {
        if self.get_position(sid).is_some() {
            return Ok(());
        }
        let Some(profile) = self.profiles.get(sid) else {
            return Ok(());
        };

        let balance = self.accounts.read().get(sid).map(|a| a.balance).unwrap_or(0.0);
        let notional_cap = profile
            .max_position_notional
            .min(balance * profile.max_position_pct_equity * profile.max_leverage);
        let qty = notional_cap / signal.entry_price;
        let notional = qty * signal.entry_price;
        let fee = notional * profile.fee_rate;
        let margin = notional / profile.max_leverage;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let liq_price = self.portfolio.calc_liq_price(sid, signal.entry_price, signal.side);

        {
            let mut accounts = self.accounts.write();
            if let Some(acc) = accounts.get_mut(sid) {
                acc.balance -= fee;
            }
        }

        let position_id = self
            .db
            .upsert_position_open(&PositionOpen {
                position_id: None,
                strategy: sid.to_string(),
                symbol: self.symbol.clone(),
                side: signal.side.to_string(),
                qty,
                entry_price: signal.entry_price,
                entry_time: now_ms,
                leverage: profile.max_leverage as i64,
                margin,
                stop_price: Some(signal.stop_price),
                tp1_price: Some(signal.tp1_price),
                tp2_price: Some(signal.tp2_price),
                status: "OPEN".into(),
                realized_pnl: 0.0,
                fees_total: fee,
                liq_price: Some(liq_price),
                created_at: now_ms,
                updated_at: now_ms,
            })
            .await?;

        self.db
            .insert_trade(&Trade {
                strategy: sid.to_string(),
                symbol: self.symbol.clone(),
                position_id,
                side: signal.side.to_string(),
                trade_type: "ENTRY".into(),
                price: signal.entry_price,
                qty,
                notional,
                fee_amount: fee,
                fee_rate: profile.fee_rate,
                timestamp: now_ms,
                reason: signal.reason.clone(),
                created_at: now_ms,
            })
            .await?;

        self.db
            .insert_ledger(&LedgerEntry {
                strategy: sid.to_string(),
                timestamp: now_ms,
                kind: "fee".into(),
                amount: -fee,
                currency: "USDT".into(),
                symbol: self.symbol.clone(),
                reference: position_id.to_string(),
                note: "entry fee".into(),
                created_at: now_ms,
            })
            .await?;

        self.positions.write().insert(
            sid.to_string(),
            Some(PositionState {
                side: signal.side,
                entry_price: signal.entry_price,
                qty,
                stop_price: signal.stop_price,
                tp1_price: signal.tp1_price,
                tp2_price: signal.tp2_price,
                tp1_hit: false,
            }),
        );

        self.stream_store.add_event(json!({
            "type": "trade", "strategy": sid, "side": signal.side.to_string(),
            "trade_type": "entry", "price": signal.entry_price, "qty": qty, "reason": signal.reason,
        }));
        self.stream_store.add_event(json!({
            "type": "entry", "strategy": sid, "side": signal.side.to_string(), "price": signal.entry_price,
        }));
        self.stream_store
            .update_snapshot(json!({ "strategy": sid, "last_signal": signal.reason }));

        self.alert
            .alert(
                "INFO",
                &format!("ENTRY[{sid}]"),
                &format!("{} {:.4} @ {:.2} ({})", signal.side, qty, signal.entry_price, signal.reason),
                Some(&format!("entry_{sid}")),
            )
            .await;

        info!(strategy = sid, side = %signal.side, qty, entry = signal.entry_price, "position opened");
        Ok(())
    }

    /// Applies an exit action, recursing to synthesize an implicit TP1 leg
    /// before a direct TP2 close when the two target prices differ.
    pub async fn close_by_action(&self, sid: &str, action: &ExitAction) -> Result<()> {
        let Some(pos) = self.get_position(sid) else { return Ok(()) };

        if action.action == ExitActionKind::Tp1 && pos.tp1_hit {
            return Ok(());
        }

        if action.action == ExitActionKind::Tp2 && !pos.tp1_hit && (pos.tp1_price - pos.tp2_price).abs() > 1e-9 {
            let tp1_action = ExitAction { action: ExitActionKind::Tp1, price: pos.tp1_price, reason: action.reason.clone() };
            Box::pin(self.close_by_action(sid, &tp1_action)).await?;
            let Some(residual) = self.get_position(sid) else { return Ok(()) };
            return Box::pin(self.close_inner(sid, action, residual)).await;
        }

        self.close_inner(sid, action, pos).await
    }

    async fn close_inner(&self, sid: &str, action: &ExitAction, pos: PositionState) -> Result<()> {
        let Some(profile) = self.profiles.get(sid) else { return Ok(()) };
        let now_ms = chrono::Utc::now().timestamp_millis();

        if action.action == ExitActionKind::Tp1 {
            let close_qty = pos.qty * 0.5;
            let remaining_qty = pos.qty - close_qty;
            let pnl = self.portfolio.calc_realized_pnl(&pos, action.price, close_qty);
            let notional = close_qty * action.price;
            let fee = notional * profile.fee_rate;

            {
                let mut accounts = self.accounts.write();
                if let Some(acc) = accounts.get_mut(sid) {
                    acc.balance += pnl - fee;
                }
            }

            let row = self.db.get_open_position(&self.symbol, sid).await?;
            let position_id = row.as_ref().map(|r| r.position_id).unwrap_or_default();
            let accumulated_pnl = row.as_ref().map(|r| r.realized_pnl).unwrap_or(0.0) + pnl;
            let accumulated_fees = row.as_ref().map(|r| r.fees_total).unwrap_or(0.0) + fee;

            self.db
                .upsert_position_open(&PositionOpen {
                    position_id: Some(position_id),
                    strategy: sid.to_string(),
                    symbol: self.symbol.clone(),
                    side: pos.side.to_string(),
                    qty: remaining_qty,
                    entry_price: pos.entry_price,
                    entry_time: row.as_ref().map(|r| r.entry_time).unwrap_or(now_ms),
                    leverage: profile.max_leverage as i64,
                    margin: remaining_qty * pos.entry_price / profile.max_leverage,
                    stop_price: Some(pos.entry_price),
                    tp1_price: Some(pos.tp1_price),
                    tp2_price: Some(pos.tp2_price),
                    status: "OPEN".into(),
                    realized_pnl: accumulated_pnl,
                    fees_total: accumulated_fees,
                    liq_price: Some(self.portfolio.calc_liq_price(sid, pos.entry_price, pos.side)),
                    created_at: row.as_ref().map(|r| r.created_at).unwrap_or(now_ms),
                    updated_at: now_ms,
                })
                .await?;

            self.db
                .insert_trade(&Trade {
                    strategy: sid.to_string(),
                    symbol: self.symbol.clone(),
                    position_id,
                    side: pos.side.to_string(),
                    trade_type: "TP1".into(),
                    price: action.price,
                    qty: close_qty,
                    notional,
                    fee_amount: fee,
                    fee_rate: profile.fee_rate,
                    timestamp: now_ms,
                    reason: action.reason.clone(),
                    created_at: now_ms,
                })
                .await?;

            self.positions.write().insert(
                sid.to_string(),
                Some(PositionState {
                    qty: remaining_qty,
                    stop_price: pos.entry_price,
                    tp1_hit: true,
                    ..pos
                }),
            );

            self.stream_store.add_event(json!({
                "type": "tp1", "strategy": sid, "price": action.price, "qty": close_qty, "pnl": pnl,
            }));
            self.alert
                .alert("INFO", &format!("TP1[{sid}]"), &format!("closed {close_qty:.4} @ {:.2} pnl={pnl:.4}", action.price), None)
                .await;
            return Ok(());
        }

        // STOP / TP2 / CLOSE_ALL: close the full remaining position.
        let pnl = self.portfolio.calc_realized_pnl(&pos, action.price, pos.qty);
        let notional = pos.qty * action.price;
        let fee = notional * profile.fee_rate;

        {
            let mut accounts = self.accounts.write();
            if let Some(acc) = accounts.get_mut(sid) {
                acc.balance += pnl - fee;
            }
        }

        let row = self.db.get_open_position(&self.symbol, sid).await?;
        let position_id = row.as_ref().map(|r| r.position_id).unwrap_or_default();
        let accumulated_pnl = row.as_ref().map(|r| r.realized_pnl).unwrap_or(0.0) + pnl;
        let accumulated_fees = row.as_ref().map(|r| r.fees_total).unwrap_or(0.0) + fee;

        self.db
            .close_position(&PositionClose {
                position_id,
                strategy: sid.to_string(),
                status: "CLOSED".into(),
                realized_pnl: accumulated_pnl,
                fees_total: accumulated_fees,
                liq_price: Some(self.portfolio.calc_liq_price(sid, pos.entry_price, pos.side)),
                close_time: now_ms,
                close_reason: Some(action.reason.clone()),
                updated_at: now_ms,
            })
            .await?;

        self.db
            .insert_trade(&Trade {
                strategy: sid.to_string(),
                symbol: self.symbol.clone(),
                position_id,
                side: pos.side.to_string(),
                trade_type: exit_trade_type(action.action).into(),
                price: action.price,
                qty: pos.qty,
                notional,
                fee_amount: fee,
                fee_rate: profile.fee_rate,
                timestamp: now_ms,
                reason: action.reason.clone(),
                created_at: now_ms,
            })
            .await?;

        self.db
            .insert_ledger(&LedgerEntry {
                strategy: sid.to_string(),
                timestamp: now_ms,
                kind: "realized_pnl".into(),
                amount: pnl,
                currency: "USDT".into(),
                symbol: self.symbol.clone(),
                reference: position_id.to_string(),
                note: action.reason.clone(),
                created_at: now_ms,
            })
            .await?;

        if action.action == ExitActionKind::Stop {
            let mut cooldowns = self.cooldowns.write();
            cooldowns.insert(sid.to_string(), profile.cooldown_after_stop);
        }

        self.positions.write().insert(sid.to_string(), None);

        self.stream_store.add_event(json!({
            "type": "exit", "strategy": sid, "action": format!("{:?}", action.action),
            "price": action.price, "pnl": pnl,
        }));
        self.stream_store.add_event(json!({
            "type": "trade", "strategy": sid, "side": pos.side.to_string(),
            "trade_type": exit_trade_type(action.action), "price": action.price, "qty": pos.qty,
        }));

        self.alert
            .alert(
                "INFO",
                &format!("{:?}[{sid}]", action.action).to_uppercase(),
                &format!("closed {:.4} @ {:.2} pnl={pnl:.4}", pos.qty, action.price),
                None,
            )
            .await;

        info!(strategy = sid, action = ?action.action, pnl, "position closed");

        self.portfolio.apply_funding(true, Some(action.price), Some(sid)).await?;
        Ok(())
    }
}

fn exit_trade_type(action: ExitActionKind) -> &'static str {
    match action {
        ExitActionKind::Stop => "STOP",
        ExitActionKind::Tp1 => "TP1",
        ExitActionKind::Tp2 => "TP2",
        ExitActionKind::CloseAll => "CLOSE_ALL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    struct NullStreamSink;
    impl StreamSink for NullStreamSink {
        fn add_event(&self, _event: serde_json::Value) {}
        fn update_snapshot(&self, _patch: serde_json::Value) {}
    }
    struct NullStatusSink;
    impl super::super::StatusSink for NullStatusSink {
        fn update(&self, _summary: super::super::StatusSummary) {}
    }

    fn test_profile() -> crate::strategy::StrategyProfile {
        crate::strategy::StrategyProfile {
            max_leverage: 20.0,
            fee_rate: 0.0004,
            max_position_notional: 20_000.0,
            max_position_pct_equity: 1.0,
            cooldown_after_stop: 4,
            mmr_tiers: vec![crate::config::MmrTier { notional_usdt: 1_000_000_000.0, mmr: 0.004, maint_amount: 0.0 }],
            ..Default::default()
        }
    }

    async fn harness() -> (PositionService, PositionMap, AccountMap) {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        db.init_schema().await.unwrap();
        let alert = Arc::new(AlertManager::new(db.clone(), crate::config::AlertsConfig { enabled: false, ..Default::default() }));
        let positions: PositionMap = Arc::new(RwLock::new(HashMap::new()));
        let accounts: AccountMap = Arc::new(RwLock::new(HashMap::from([("default".to_string(), super::super::Account::new(1000.0))])));
        let cooldowns: CooldownMap = Arc::new(RwLock::new(HashMap::new()));
        let profiles: ProfileMap = Arc::new(HashMap::from([("default".to_string(), test_profile())]));
        let rest = crate::market_data::FuturesRestClient::new("https://fapi.binance.com".to_string());
        let portfolio = Arc::new(PortfolioService::new(
            db.clone(),
            alert.clone(),
            accounts.clone(),
            positions.clone(),
            cooldowns.clone(),
            profiles.clone(),
            vec!["default".to_string()],
            Arc::new(NullStatusSink),
            "BTCUSDT".to_string(),
            rest,
        ));
        let svc = PositionService::new(
            db,
            alert,
            Arc::new(NullStreamSink),
            accounts.clone(),
            positions.clone(),
            cooldowns,
            profiles,
            portfolio,
            "BTCUSDT".to_string(),
        );
        (svc, positions, accounts)
    }

    #[tokio::test]
    async fn open_position_reserves_margin_and_debits_fee() {
        let (svc, positions, accounts) = harness().await;
        let signal = EntrySignal {
            side: Side::Long,
            entry_price: 100.0,
            stop_price: 95.0,
            tp1_price: 105.0,
            tp2_price: 110.0,
            reason: "test".into(),
        };
        svc.open_position("default", &signal).await.unwrap();

        let pos = positions.read().get("default").unwrap().clone().unwrap();
        assert_eq!(pos.qty, 200.0);
        assert!(accounts.read().get("default").unwrap().balance < 1000.0);
    }

    #[tokio::test]
    async fn open_position_is_a_no_op_when_already_open() {
        let (svc, positions, _accounts) = harness().await;
        let signal = EntrySignal { side: Side::Long, entry_price: 100.0, stop_price: 95.0, tp1_price: 105.0, tp2_price: 110.0, reason: "test".into() };
        svc.open_position("default", &signal).await.unwrap();
        svc.open_position("default", &signal).await.unwrap();
        assert!(positions.read().get("default").unwrap().is_some());
    }

    #[tokio::test]
    async fn tp1_then_tp2_closes_in_two_steps() {
        let (svc, positions, _accounts) = harness().await;
        let signal = EntrySignal { side: Side::Long, entry_price: 100.0, stop_price: 95.0, tp1_price: 105.0, tp2_price: 110.0, reason: "test".into() };
        svc.open_position("default", &signal).await.unwrap();

        svc.close_by_action("default", &ExitAction { action: ExitActionKind::Tp1, price: 105.0, reason: "tp1".into() }).await.unwrap();
        let pos = positions.read().get("default").unwrap().clone().unwrap();
        assert!(pos.tp1_hit);
        assert_eq!(pos.qty, 100.0);
        assert_eq!(pos.stop_price, 100.0);

        svc.close_by_action("default", &ExitAction { action: ExitActionKind::Tp2, price: 110.0, reason: "tp2".into() }).await.unwrap();
        assert!(positions.read().get("default").unwrap().is_none());
    }

    #[tokio::test]
    async fn direct_tp2_synthesizes_tp1_leg_first() {
        let (svc, positions, _accounts) = harness().await;
        let signal = EntrySignal { side: Side::Long, entry_price: 100.0, stop_price: 95.0, tp1_price: 105.0, tp2_price: 110.0, reason: "test".into() };
        svc.open_position("default", &signal).await.unwrap();

        svc.close_by_action("default", &ExitAction { action: ExitActionKind::Tp2, price: 110.0, reason: "tp2_direct".into() }).await.unwrap();
        assert!(positions.read().get("default").unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_sets_cooldown() {
        let (svc, _positions, _accounts) = harness().await;
        let signal = EntrySignal { side: Side::Long, entry_price: 100.0, stop_price: 95.0, tp1_price: 105.0, tp2_price: 110.0, reason: "test".into() };
        svc.open_position("default", &signal).await.unwrap();
        svc.close_by_action("default", &ExitAction { action: ExitActionKind::Stop, price: 95.0, reason: "stop".into() }).await.unwrap();
        assert_eq!(svc.get_cooldown("default"), 4);
    }
}
