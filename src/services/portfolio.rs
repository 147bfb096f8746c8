// =============================================================================
// PortfolioService — account bookkeeping, liquidation math, funding settlement.
// =============================================================================
//
// Ported from `backend/services/portfolio_service.py`. Holds the same
// `PositionMap` as `PositionService` but only ever reads it (see §9's
// cyclic-reference note in the crate's design ledger).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::alerts::AlertManager;
use crate::config::MmrTier;
use crate::db::Database;
use crate::market_data::FuturesRestClient;
use crate::models::{EquitySnapshot, LedgerEntry};
use crate::strategy::{PositionState, Side};

use super::{Account, AccountMap, CooldownMap, PositionMap, ProfileMap, StatusSink, StatusSummary};

pub struct PortfolioService {
    db: Arc<Database>,
    alert: Arc<AlertManager>,
    accounts: AccountMap,
    positions: PositionMap,
    cooldowns: CooldownMap,
    profiles: ProfileMap,
    strategy_order: Vec<String>,
    status_store: Arc<dyn StatusSink>,
    symbol: String,
    rest: FuturesRestClient,
    last_price: Mutex<f64>,
}

impl PortfolioService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        alert: Arc<AlertManager>,
        accounts: AccountMap,
        positions: PositionMap,
        cooldowns: CooldownMap,
        profiles: ProfileMap,
        strategy_order: Vec<String>,
        status_store: Arc<dyn StatusSink>,
        symbol: String,
        rest: FuturesRestClient,
    ) -> Self {
        Self {
            db,
            alert,
            accounts,
            positions,
            cooldowns,
            profiles,
            strategy_order,
            status_store,
            symbol,
            rest,
            last_price: Mutex::new(0.0),
        }
    }

    pub fn set_last_price(&self, price: f64) {
        *self.last_price.lock() = price;
    }

    pub fn get_last_price(&self) -> f64 {
        *self.last_price.lock()
    }

    /// Recover each account's balance/equity/UPL/margin from the most recent
    /// persisted snapshot, falling back to the `"default"` strategy's
    /// snapshot for ids not yet persisted.
    pub async fn load_account_state(&self) -> Result<()> {
        let mut accounts = self.accounts.write();
        for sid in &self.strategy_order {
            let mut row = self.db.last_equity_snapshot(sid).await?;
            if row.is_none() && sid != "default" {
                row = self.db.last_equity_snapshot("default").await?;
            }
            if let Some(snapshot) = row {
                if let Some(acc) = accounts.get_mut(sid) {
                    acc.balance = snapshot.balance;
                    acc.equity = snapshot.equity;
                    acc.upl = snapshot.upl;
                    acc.margin_used = snapshot.margin_used;
                    acc.free_margin = snapshot.free_margin;
                }
            }
        }
        Ok(())
    }

    pub fn calc_realized_pnl(&self, pos: &PositionState, price: f64, qty: f64) -> f64 {
        match pos.side {
            Side::Long => (price - pos.entry_price) * qty,
            Side::Short => (pos.entry_price - price) * qty,
        }
    }

    /// Tiers sorted by `notional_usdt` ascending; first tier whose bound is
    /// `>= notional` wins, else the last (highest) tier.
    fn select_mmr(&self, sid: &str, notional: f64) -> (f64, f64) {
        let Some(profile) = self.profiles.get(sid) else { return (0.0, 0.0) };
        let mut tiers: Vec<MmrTier> = profile.mmr_tiers.clone();
        tiers.sort_by(|a, b| a.notional_usdt.partial_cmp(&b.notional_usdt).unwrap());
        for tier in &tiers {
            if notional <= tier.notional_usdt {
                return (tier.mmr, tier.maint_amount);
            }
        }
        tiers.last().map(|t| (t.mmr, t.maint_amount)).unwrap_or((0.0, 0.0))
    }

    pub fn calc_liq_price(&self, sid: &str, entry_price: f64, side: Side) -> f64 {
        let Some(profile) = self.profiles.get(sid) else { return entry_price };
        let leverage = profile.max_leverage;
        let qty = self.positions.read().get(sid).and_then(|p| p.as_ref()).map(|p| p.qty).unwrap_or(0.0);
        if qty <= 0.0 {
            return entry_price;
        }
        let notional_entry = entry_price * qty;
        let (mmr, maint_amount) = self.select_mmr(sid, notional_entry);
        let margin = notional_entry / leverage;
        match side {
            Side::Long => {
                let num = margin - entry_price * qty - maint_amount;
                let denom = (mmr - 1.0) * qty;
                if denom == 0.0 { entry_price } else { num / denom }
            }
            Side::Short => {
                let num = margin + entry_price * qty - maint_amount;
                let denom = (1.0 + mmr) * qty;
                if denom == 0.0 { entry_price } else { num / denom }
            }
        }
    }

    /// Recompute every account's UPL/equity/margin at `price` and publish the
    /// first-listed strategy's summary to the status store.
    pub async fn update_status(&self, price: f64) {
        {
            let positions = self.positions.read();
            let mut accounts = self.accounts.write();
            for sid in &self.strategy_order {
                let pos = positions.get(sid).and_then(|p| p.as_ref());
                let Some(profile) = self.profiles.get(sid) else { continue };
                let (upl, margin_used) = match pos {
                    Some(p) => {
                        let upl = self.calc_realized_pnl(p, price, p.qty);
                        let margin_used = p.qty * price / profile.max_leverage;
                        (upl, margin_used)
                    }
                    None => (0.0, 0.0),
                };
                if let Some(acc) = accounts.get_mut(sid) {
                    acc.upl = upl;
                    acc.equity = acc.balance + upl;
                    acc.margin_used = margin_used;
                    acc.free_margin = acc.equity - margin_used;
                }
            }
        }

        let Some(sid) = self.strategy_order.first().cloned() else { return };
        let pos = self.positions.read().get(&sid).and_then(|p| p.as_ref()).copied();
        let acc = *self.accounts.read().get(&sid).unwrap_or(&Account::new(0.0));
        let liq = pos.map(|p| self.calc_liq_price(&sid, p.entry_price, p.side));
        let cooldown_bars = self.cooldowns.read().get(&sid).copied().unwrap_or(0);

        self.status_store.update(StatusSummary {
            strategy: sid,
            balance: acc.balance,
            equity: acc.equity,
            upl: acc.upl,
            margin_used: acc.margin_used,
            free_margin: acc.free_margin,
            liq_price: liq,
            position_side: pos.map(|p| p.side),
            position_qty: pos.map(|p| p.qty),
            entry_price: pos.map(|p| p.entry_price),
            stop_price: pos.map(|p| p.stop_price),
            tp1_price: pos.map(|p| p.tp1_price),
            tp2_price: pos.map(|p| p.tp2_price),
            cooldown_bars,
        });
    }

    pub async fn snapshot_equity(&self) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let accounts: Vec<(String, Account)> = {
            let accounts = self.accounts.read();
            self.strategy_order.iter().filter_map(|sid| accounts.get(sid).map(|a| (sid.clone(), *a))).collect()
        };
        for (sid, acc) in accounts {
            self.db
                .insert_equity_snapshot(&EquitySnapshot {
                    strategy: sid,
                    timestamp: now_ms,
                    balance: acc.balance,
                    equity: acc.equity,
                    upl: acc.upl,
                    margin_used: acc.margin_used,
                    free_margin: acc.free_margin,
                })
                .await?;
        }
        Ok(())
    }

    /// Runs forever, settling funding every 60s. The caller cancels the
    /// enclosing task on shutdown.
    pub async fn funding_loop(&self) {
        loop {
            if let Err(err) = self.apply_funding(false, None, None).await {
                error!(error = %err, "funding loop error");
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }

    pub async fn apply_funding(&self, force: bool, price_hint: Option<f64>, sid: Option<&str>) -> Result<()> {
        let observation = match self.rest.get_latest_funding_rate(&self.symbol).await {
            Ok(Some(obs)) => obs,
            Ok(None) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "fetch fundingRate failed");
                return Ok(());
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        if !force && (now_ms - observation.funding_time).abs() > 3 * 60 * 1000 {
            return Ok(());
        }

        let targets: Vec<String> = match sid {
            Some(s) => vec![s.to_string()],
            None => self.strategy_order.clone(),
        };

        let mut last_settled_price = price_hint.unwrap_or(self.get_last_price());

        for strategy_id in targets {
            let pos = self.positions.read().get(&strategy_id).and_then(|p| p.as_ref()).copied();
            let Some(pos) = pos else { continue };

            let funding_ref = observation.funding_time.to_string();
            if self.db.funding_entry_exists(&strategy_id, &funding_ref).await? && !force {
                continue;
            }

            let price = price_hint.unwrap_or_else(|| {
                let last = self.get_last_price();
                if last > 0.0 { last } else { pos.entry_price }
            });
            last_settled_price = price;
            let notional = pos.qty * price;
            let pnl = notional * observation.funding_rate * pos.side.sign();

            {
                let mut accounts = self.accounts.write();
                if let Some(acc) = accounts.get_mut(&strategy_id) {
                    acc.balance += pnl;
                }
            }

            self.db
                .insert_ledger(&LedgerEntry {
                    strategy: strategy_id.clone(),
                    timestamp: observation.funding_time,
                    kind: "funding".into(),
                    amount: pnl,
                    currency: "USDT".into(),
                    symbol: self.symbol.clone(),
                    reference: funding_ref.clone(),
                    note: format!("rate={}", observation.funding_rate),
                    created_at: now_ms,
                })
                .await?;

            self.alert
                .alert(
                    "INFO",
                    &format!("FUNDING[{strategy_id}]"),
                    &format!("rate={:.6} pnl={:.4}", observation.funding_rate, pnl),
                    Some(&format!("funding_{strategy_id}_{}", observation.funding_time)),
                )
                .await;

            info!(strategy = %strategy_id, rate = observation.funding_rate, pnl, "funding settled");
        }

        self.update_status(last_settled_price).await;
        self.snapshot_equity().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    struct NullStatusSink;
    impl StatusSink for NullStatusSink {
        fn update(&self, _summary: StatusSummary) {}
    }

    fn profile(max_leverage: f64, tiers: Vec<MmrTier>) -> crate::strategy::StrategyProfile {
        crate::strategy::StrategyProfile { max_leverage, mmr_tiers: tiers, ..Default::default() }
    }

    async fn service() -> (PortfolioService, PositionMap, AccountMap) {
        let db = StdArc::new(Database::connect_in_memory().await.unwrap());
        db.init_schema().await.unwrap();
        let alert = StdArc::new(AlertManager::new(db.clone(), crate::config::AlertsConfig { enabled: false, ..Default::default() }));
        let positions: PositionMap = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let accounts: AccountMap = Arc::new(parking_lot::RwLock::new(HashMap::from([(
            "default".to_string(),
            Account::new(1000.0),
        )])));
        let cooldowns: CooldownMap = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let tiers = vec![
            MmrTier { notional_usdt: 5000.0, mmr: 0.004, maint_amount: 0.0 },
            MmrTier { notional_usdt: 1_000_000_000.0, mmr: 0.025, maint_amount: 10_000.0 },
        ];
        let profiles: ProfileMap = Arc::new(HashMap::from([("default".to_string(), profile(20.0, tiers))]));
        let rest = FuturesRestClient::new("https://fapi.binance.com".to_string());
        let svc = PortfolioService::new(
            db,
            alert,
            accounts.clone(),
            positions.clone(),
            cooldowns,
            profiles,
            vec!["default".to_string()],
            StdArc::new(NullStatusSink),
            "BTCUSDT".to_string(),
            rest,
        );
        (svc, positions, accounts)
    }

    #[tokio::test]
    async fn calc_liq_price_returns_entry_when_flat() {
        let (svc, _positions, _accounts) = service().await;
        let liq = svc.calc_liq_price("default", 100.0, Side::Long);
        assert_eq!(liq, 100.0);
    }

    #[tokio::test]
    async fn calc_liq_price_long_below_entry() {
        let (svc, positions, _accounts) = service().await;
        positions.write().insert(
            "default".to_string(),
            Some(PositionState {
                side: Side::Long,
                entry_price: 100.0,
                qty: 200.0,
                stop_price: 95.0,
                tp1_price: 105.0,
                tp2_price: 110.0,
                tp1_hit: false,
            }),
        );
        let liq = svc.calc_liq_price("default", 100.0, Side::Long);
        assert!(liq < 100.0);
    }

    #[tokio::test]
    async fn update_status_keeps_equity_identity() {
        let (svc, positions, accounts) = service().await;
        positions.write().insert(
            "default".to_string(),
            Some(PositionState {
                side: Side::Long,
                entry_price: 100.0,
                qty: 200.0,
                stop_price: 95.0,
                tp1_price: 105.0,
                tp2_price: 110.0,
                tp1_hit: false,
            }),
        );
        svc.update_status(105.0).await;
        let acc = *accounts.read().get("default").unwrap();
        assert_eq!(acc.upl, (105.0 - 100.0) * 200.0);
        assert_eq!(acc.equity, acc.balance + acc.upl);
        assert_eq!(acc.free_margin, acc.equity - acc.margin_used);
    }
}
