//! Position Tracker
//! Mission: Fold fills into position state under per-(binding, symbol)
//! locks, keep PnL arithmetic honest, snapshot every mutation, and
//! reconcile against the venue's authoritative view

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::connectors::VenueConnector;
use crate::error::{GatewayError, Result};
use crate::models::{Position, PositionHistory, PositionSide, PositionStatus, VenueBinding};
use crate::notify::{NotificationBus, NotificationKind, NotificationPriority};
use crate::store::Store;
use crate::util::{position_lock_key, LockMap};

const QTY_EPSILON: f64 = 1e-12;
/// Positions within this distance of liquidation are reported at all.
const LIQUIDATION_WATCH_PCT: f64 = 10.0;
/// Below this distance the report escalates to HIGH.
const LIQUIDATION_HIGH_PCT: f64 = 5.0;

/// One position mutation: a signed quantity delta plus the PnL, fee and
/// marks that came with it.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub symbol: String,
    pub size_delta: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub mark_price: Option<f64>,
    pub liquidation_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidationAlertLevel {
    High,
    Medium,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidationRisk {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    pub distance_pct: f64,
    pub risk_level: LiquidationAlertLevel,
}

/// Per-account performance over a trailing window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PositionMetrics {
    pub total_positions: usize,
    pub open_positions: usize,
    pub total_unrealized_pnl: f64,
    pub total_realized_pnl: f64,
    pub total_margin: f64,
    pub total_notional_value: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
}

pub struct PositionTracker {
    store: Store,
    notifier: Arc<NotificationBus>,
    locks: LockMap,
}

impl PositionTracker {
    pub fn new(store: Store, notifier: Arc<NotificationBus>) -> Self {
        Self {
            store,
            notifier,
            locks: LockMap::new(),
        }
    }

    /// Apply a fill (or venue push) to the position for (binding, symbol).
    pub async fn apply_update(
        &self,
        binding: &VenueBinding,
        update: &PositionUpdate,
    ) -> Result<Position> {
        let lock = self.locks.entry(&position_lock_key(binding.id, &update.symbol));
        let _guard = lock.lock().await;

        let existing = self
            .store
            .get_open_position(binding.id, &update.symbol)
            .await?;

        match existing {
            None => self.open_position(binding, update).await,
            Some(position) => self.mutate_position(position, update).await,
        }
    }

    async fn open_position(
        &self,
        binding: &VenueBinding,
        update: &PositionUpdate,
    ) -> Result<Position> {
        if update.size_delta.abs() < QTY_EPSILON {
            return Err(GatewayError::ValidationFailed(format!(
                "no open position for {} and zero delta",
                update.symbol
            )));
        }

        let now = Utc::now();
        let entry = update.mark_price.unwrap_or(0.0);
        let quantity = update.size_delta.abs();
        let position = Position {
            id: 0,
            account_id: binding.account_id,
            binding_id: binding.id,
            symbol: update.symbol.clone(),
            side: PositionSide::from_delta(update.size_delta),
            status: PositionStatus::Open,
            quantity,
            initial_quantity: quantity,
            entry_price: entry,
            mark_price: entry,
            liquidation_price: update.liquidation_price,
            exit_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: update.realized_pnl,
            margin: 0.0,
            margin_ratio: None,
            leverage: 1.0,
            is_isolated: false,
            stop_loss_price: None,
            take_profit_price: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            opened_at: now,
            closed_at: None,
            updated_at: now,
        };
        let position = self.store.insert_position(&position).await?;
        self.record_history(&position, update.size_delta, update.fee)
            .await?;

        info!(
            binding_id = binding.id,
            symbol = %position.symbol,
            side = position.side.as_str(),
            quantity = position.quantity,
            entry = position.entry_price,
            "position opened"
        );
        self.notifier.publish(
            binding.account_id,
            NotificationKind::PositionOpened,
            NotificationPriority::Medium,
            "Position Opened",
            &format!(
                "Opened {} {} {} at {}",
                position.side.as_str(),
                position.quantity,
                position.symbol,
                position.entry_price
            ),
            json!({
                "symbol": position.symbol,
                "side": position.side,
                "quantity": position.quantity,
                "entry_price": position.entry_price,
            }),
        );
        Ok(position)
    }

    async fn mutate_position(
        &self,
        mut position: Position,
        update: &PositionUpdate,
    ) -> Result<Position> {
        let signed = position.signed_quantity();
        let new_signed = signed + update.size_delta;

        position.realized_pnl += update.realized_pnl;
        if let Some(liq) = update.liquidation_price {
            position.liquidation_price = Some(liq);
        }

        let crossed_or_flat =
            new_signed.abs() < QTY_EPSILON || new_signed.signum() != signed.signum();
        if crossed_or_flat {
            position.quantity = 0.0;
            position.status = PositionStatus::Closed;
            position.closed_at = Some(Utc::now());
            position.unrealized_pnl = 0.0;
            if let Some(mark) = update.mark_price {
                position.mark_price = mark;
                position.exit_price = Some(mark);
            }
            self.store.update_position(&position).await?;
            self.record_history(&position, update.size_delta, update.fee)
                .await?;
            self.notify_closed(&position);
            return Ok(position);
        }

        let increasing = update.size_delta.signum() == signed.signum();
        if increasing && update.size_delta.abs() > QTY_EPSILON {
            let added = update.size_delta.abs();
            let fill_price = update.mark_price.unwrap_or(position.entry_price);
            let total = position.quantity + added;
            position.entry_price =
                (position.entry_price * position.quantity + fill_price * added) / total;
        }
        position.quantity = new_signed.abs();

        if let Some(mark) = update.mark_price {
            position.mark_price = mark;
            position.unrealized_pnl = position.unrealized_at(mark);
        }

        self.store.update_position(&position).await?;
        self.record_history(&position, update.size_delta, update.fee)
            .await?;
        Ok(position)
    }

    /// Close an OPEN position at a known exit price, realizing the final
    /// PnL of the remaining quantity.
    pub async fn close_position(
        &self,
        binding: &VenueBinding,
        symbol: &str,
        exit_price: f64,
    ) -> Result<Position> {
        let lock = self.locks.entry(&position_lock_key(binding.id, symbol));
        let _guard = lock.lock().await;

        let mut position = self
            .store
            .get_open_position(binding.id, symbol)
            .await?
            .ok_or_else(|| GatewayError::PositionNotFound(symbol.to_string()))?;

        let final_pnl = match position.side {
            PositionSide::Long => (exit_price - position.entry_price) * position.quantity,
            PositionSide::Short => (position.entry_price - exit_price) * position.quantity,
        };
        let closed_quantity = position.quantity;

        position.realized_pnl += final_pnl;
        position.unrealized_pnl = 0.0;
        position.quantity = 0.0;
        position.exit_price = Some(exit_price);
        position.mark_price = exit_price;
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());

        self.store.update_position(&position).await?;
        self.record_history(
            &position,
            -closed_quantity * position.side.as_sign(),
            0.0,
        )
        .await?;
        self.notify_closed(&position);
        Ok(position)
    }

    /// Mark a position liquidated. Terminal; emits a CRITICAL alert.
    pub async fn mark_liquidated(&self, binding: &VenueBinding, symbol: &str) -> Result<Position> {
        let lock = self.locks.entry(&position_lock_key(binding.id, symbol));
        let _guard = lock.lock().await;

        let mut position = self
            .store
            .get_open_position(binding.id, symbol)
            .await?
            .ok_or_else(|| GatewayError::PositionNotFound(symbol.to_string()))?;

        position.quantity = 0.0;
        position.unrealized_pnl = 0.0;
        position.status = PositionStatus::Liquidated;
        position.closed_at = Some(Utc::now());
        self.store.update_position(&position).await?;
        self.record_history(&position, 0.0, 0.0).await?;

        self.notifier.publish(
            position.account_id,
            NotificationKind::PositionLiquidated,
            NotificationPriority::Critical,
            "Position Liquidated",
            &format!("Your {} position has been liquidated", position.symbol),
            json!({"symbol": position.symbol}),
        );
        Ok(position)
    }

    /// Pull the venue's position snapshot and overwrite local state. Any
    /// locally-OPEN position missing from the (full) snapshot is closed.
    pub async fn sync_positions(
        &self,
        binding: &VenueBinding,
        connector: &dyn VenueConnector,
    ) -> Result<usize> {
        let venue_positions = connector.get_positions(None).await?;
        let mut synced = 0;

        for remote in &venue_positions {
            let lock = self.locks.entry(&position_lock_key(binding.id, &remote.symbol));
            let _guard = lock.lock().await;

            match self.store.get_open_position(binding.id, &remote.symbol).await? {
                Some(mut local) => {
                    local.side = remote.side;
                    local.quantity = remote.quantity;
                    local.entry_price = remote.entry_price;
                    local.mark_price = remote.mark_price;
                    local.unrealized_pnl = remote.unrealized_pnl;
                    local.realized_pnl = remote.realized_pnl;
                    local.liquidation_price = remote.liquidation_price;
                    local.margin = remote.margin;
                    local.margin_ratio = remote.margin_ratio;
                    local.leverage = remote.leverage;
                    local.is_isolated = remote.is_isolated;
                    self.store.update_position(&local).await?;
                    self.record_history(&local, 0.0, 0.0).await?;
                }
                None => {
                    let now = Utc::now();
                    let fresh = Position {
                        id: 0,
                        account_id: binding.account_id,
                        binding_id: binding.id,
                        symbol: remote.symbol.clone(),
                        side: remote.side,
                        status: PositionStatus::Open,
                        quantity: remote.quantity,
                        initial_quantity: remote.quantity,
                        entry_price: remote.entry_price,
                        mark_price: remote.mark_price,
                        liquidation_price: remote.liquidation_price,
                        exit_price: None,
                        unrealized_pnl: remote.unrealized_pnl,
                        realized_pnl: remote.realized_pnl,
                        margin: remote.margin,
                        margin_ratio: remote.margin_ratio,
                        leverage: remote.leverage,
                        is_isolated: remote.is_isolated,
                        stop_loss_price: None,
                        take_profit_price: None,
                        stop_loss_order_id: None,
                        take_profit_order_id: None,
                        opened_at: now,
                        closed_at: None,
                        updated_at: now,
                    };
                    let created = self.store.insert_position(&fresh).await?;
                    self.record_history(&created, 0.0, 0.0).await?;
                }
            }
            synced += 1;
        }

        // Stale close: the venue snapshot is authoritative and unfiltered,
        // so a locally-OPEN symbol it omits no longer exists remotely.
        let local_open = self.store.open_positions_for_binding(binding.id).await?;
        for mut local in local_open {
            let still_open = venue_positions.iter().any(|p| p.symbol == local.symbol);
            if still_open {
                continue;
            }
            let lock = self.locks.entry(&position_lock_key(binding.id, &local.symbol));
            let _guard = lock.lock().await;

            warn!(
                binding_id = binding.id,
                symbol = %local.symbol,
                "position absent from venue snapshot, closing locally"
            );
            local.quantity = 0.0;
            local.unrealized_pnl = 0.0;
            local.status = PositionStatus::Closed;
            local.closed_at = Some(Utc::now());
            self.store.update_position(&local).await?;
            self.record_history(&local, 0.0, 0.0).await?;
        }

        Ok(synced)
    }

    /// Open positions within 10% of their liquidation price, tagged HIGH
    /// under 5%.
    pub async fn check_liquidation_risk(&self, account_id: i64) -> Result<Vec<LiquidationRisk>> {
        let positions = self.store.open_positions_for_account(account_id).await?;
        let mut at_risk = Vec::new();

        for position in positions {
            let Some(distance_pct) = position.liquidation_distance_pct() else {
                continue;
            };
            if distance_pct >= LIQUIDATION_WATCH_PCT {
                continue;
            }
            at_risk.push(LiquidationRisk {
                symbol: position.symbol.clone(),
                side: position.side,
                quantity: position.quantity,
                mark_price: position.mark_price,
                liquidation_price: position.liquidation_price.unwrap_or(0.0),
                distance_pct,
                risk_level: if distance_pct < LIQUIDATION_HIGH_PCT {
                    LiquidationAlertLevel::High
                } else {
                    LiquidationAlertLevel::Medium
                },
            });
        }
        Ok(at_risk)
    }

    /// Performance metrics over a trailing window (default 30 days).
    pub async fn metrics(&self, account_id: i64, period_days: i64) -> Result<PositionMetrics> {
        let since = Utc::now() - Duration::days(period_days);
        let positions = self.store.positions_since(account_id, since).await?;

        let mut metrics = PositionMetrics {
            total_positions: positions.len(),
            ..Default::default()
        };
        let mut wins: Vec<f64> = Vec::new();
        let mut losses: Vec<f64> = Vec::new();

        for position in &positions {
            if position.status == PositionStatus::Open {
                metrics.open_positions += 1;
                metrics.total_unrealized_pnl += position.unrealized_pnl;
                metrics.total_margin += position.margin;
                metrics.total_notional_value += position.notional_value();
            }
            metrics.total_realized_pnl += position.realized_pnl;

            if position.status.is_terminal() {
                if position.realized_pnl > 0.0 {
                    wins.push(position.realized_pnl);
                } else if position.realized_pnl < 0.0 {
                    losses.push(position.realized_pnl.abs());
                }
            }
        }

        let closed = wins.len() + losses.len();
        if closed > 0 {
            metrics.win_rate = wins.len() as f64 / closed as f64;
        }
        if !wins.is_empty() {
            metrics.avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        }
        if !losses.is_empty() {
            metrics.avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        }
        let total_wins: f64 = wins.iter().sum();
        let total_losses: f64 = losses.iter().sum();
        metrics.profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else {
            total_wins
        };

        let series = self.store.pnl_series_for_account(account_id, since).await?;
        metrics.max_drawdown = max_drawdown_pct(&series);
        Ok(metrics)
    }

    async fn record_history(&self, position: &Position, size_delta: f64, _fee: f64) -> Result<()> {
        self.store
            .insert_position_history(&PositionHistory {
                id: 0,
                position_id: position.id,
                quantity: position.quantity,
                mark_price: position.mark_price,
                unrealized_pnl: position.unrealized_pnl,
                realized_pnl: position.realized_pnl,
                margin: position.margin,
                bid_price: None,
                ask_price: None,
                funding_rate: None,
                size_delta,
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    fn notify_closed(&self, position: &Position) {
        let pnl = position.realized_pnl;
        let pnl_text = if pnl >= 0.0 {
            format!("Profit: ${pnl:.2}")
        } else {
            format!("Loss: ${:.2}", pnl.abs())
        };
        self.notifier.publish(
            position.account_id,
            NotificationKind::PositionClosed,
            NotificationPriority::Medium,
            "Position Closed",
            &format!("Closed {} position. {}", position.symbol, pnl_text),
            json!({
                "symbol": position.symbol,
                "realized_pnl": position.realized_pnl,
            }),
        );
    }
}

/// Max drawdown over the cumulative (realized + unrealized) PnL series,
/// as `max(peak − trough) / peak` in percent.
fn max_drawdown_pct(series: &[(chrono::DateTime<Utc>, f64)]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let mut running = 0.0;
    let mut cumulative = Vec::with_capacity(series.len());
    for (_, pnl) in series {
        running += pnl;
        cumulative.push(running);
    }

    let mut peak = cumulative[0];
    let mut max_drawdown: f64 = 0.0;
    for value in cumulative {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - value) / peak);
        }
    }
    max_drawdown * 100.0
}

trait SideSign {
    fn as_sign(&self) -> f64;
}

impl SideSign for PositionSide {
    fn as_sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;
    use crate::store::NewBinding;

    async fn setup() -> (PositionTracker, VenueBinding) {
        let store = Store::open_in_memory().unwrap();
        let account = store
            .insert_account("a", "a@example.com", "h", 100_000.0, 10.0)
            .await
            .unwrap();
        let binding = store
            .insert_binding(&NewBinding {
                account_id: account.id,
                venue: Venue::Mock,
                name: "main".to_string(),
                testnet: true,
                encrypted_api_key: None,
                encrypted_api_secret: None,
                encrypted_private_key: None,
                wallet_address: None,
                vault_index: None,
                requests_per_minute: 60,
            })
            .await
            .unwrap();
        let tracker = PositionTracker::new(store, Arc::new(NotificationBus::default()));
        (tracker, binding)
    }

    fn update(symbol: &str, delta: f64, mark: Option<f64>) -> PositionUpdate {
        PositionUpdate {
            symbol: symbol.to_string(),
            size_delta: delta,
            mark_price: mark,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_long_then_vwap_increase() {
        let (tracker, binding) = setup().await;

        let pos = tracker
            .apply_update(&binding, &update("BTC-PERP", 1.0, Some(50_000.0)))
            .await
            .unwrap();
        assert_eq!(pos.side, PositionSide::Long);
        assert_eq!(pos.entry_price, 50_000.0);

        // Add 1 more at 52k: entry becomes 51k.
        let pos = tracker
            .apply_update(&binding, &update("BTC-PERP", 1.0, Some(52_000.0)))
            .await
            .unwrap();
        assert_eq!(pos.quantity, 2.0);
        assert!((pos.entry_price - 51_000.0).abs() < 1e-9);
        // Unrealized at mark 52k: (52k-51k)*2.
        assert!((pos.unrealized_pnl - 2_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_short_unrealized_mirrors() {
        let (tracker, binding) = setup().await;
        let pos = tracker
            .apply_update(&binding, &update("ETH-PERP", -1.5, Some(3_000.5)))
            .await
            .unwrap();
        assert_eq!(pos.side, PositionSide::Short);

        let pos = tracker
            .apply_update(&binding, &update("ETH-PERP", -0.0, Some(2_900.5)))
            .await
            .unwrap();
        // Short gains as price drops: (3000.5 - 2900.5) * 1.5.
        assert!((pos.unrealized_pnl - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reduction_keeps_entry_and_accumulates_realized() {
        let (tracker, binding) = setup().await;
        tracker
            .apply_update(&binding, &update("BTC-PERP", 2.0, Some(50_000.0)))
            .await
            .unwrap();

        let mut reduce = update("BTC-PERP", -0.5, Some(51_000.0));
        reduce.realized_pnl = 500.0;
        let pos = tracker.apply_update(&binding, &reduce).await.unwrap();
        assert_eq!(pos.quantity, 1.5);
        assert_eq!(pos.entry_price, 50_000.0);
        assert_eq!(pos.realized_pnl, 500.0);
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_delta_to_zero_closes() {
        let (tracker, binding) = setup().await;
        tracker
            .apply_update(&binding, &update("BTC-PERP", 1.0, Some(50_000.0)))
            .await
            .unwrap();
        let pos = tracker
            .apply_update(&binding, &update("BTC-PERP", -1.0, Some(51_000.0)))
            .await
            .unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.quantity, 0.0);
        assert!(pos.closed_at.is_some());

        // Crossing through zero also closes (never flips).
        tracker
            .apply_update(&binding, &update("SOL-PERP", 5.0, Some(100.0)))
            .await
            .unwrap();
        let crossed = tracker
            .apply_update(&binding, &update("SOL-PERP", -8.0, Some(100.0)))
            .await
            .unwrap();
        assert_eq!(crossed.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn test_close_position_realizes_final_pnl() {
        let (tracker, binding) = setup().await;
        tracker
            .apply_update(&binding, &update("BTC-PERP", 1.0, Some(50_000.0)))
            .await
            .unwrap();

        let closed = tracker
            .close_position(&binding, "BTC-PERP", 53_000.0)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, 3_000.0);
        assert_eq!(closed.exit_price, Some(53_000.0));

        // A second close fails: nothing is open.
        assert!(matches!(
            tracker.close_position(&binding, "BTC-PERP", 53_000.0).await,
            Err(GatewayError::PositionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_liquidation_risk_scenario() {
        let (tracker, binding) = setup().await;
        let mut open = update("BTC-PERP", 1.0, Some(46_000.0));
        open.liquidation_price = Some(45_000.0);
        tracker.apply_update(&binding, &open).await.unwrap();

        let risks = tracker
            .check_liquidation_risk(binding.account_id)
            .await
            .unwrap();
        assert_eq!(risks.len(), 1);
        let risk = &risks[0];
        assert_eq!(risk.symbol, "BTC-PERP");
        // (46000 - 45000) / 46000 ≈ 2.17%.
        assert!((risk.distance_pct - 2.1739).abs() < 0.01);
        assert_eq!(risk.risk_level, LiquidationAlertLevel::High);
    }

    #[tokio::test]
    async fn test_liquidation_risk_ignores_far_positions() {
        let (tracker, binding) = setup().await;
        let mut open = update("BTC-PERP", 1.0, Some(50_000.0));
        open.liquidation_price = Some(40_000.0);
        tracker.apply_update(&binding, &open).await.unwrap();

        let risks = tracker
            .check_liquidation_risk(binding.account_id)
            .await
            .unwrap();
        assert!(risks.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_win_rate_and_profit_factor() {
        let (tracker, binding) = setup().await;

        // Two winners, one loser.
        for (symbol, entry, exit) in [
            ("BTC-PERP", 50_000.0, 51_000.0),
            ("ETH-PERP", 3_000.0, 3_100.0),
            ("SOL-PERP", 100.0, 90.0),
        ] {
            tracker
                .apply_update(&binding, &update(symbol, 1.0, Some(entry)))
                .await
                .unwrap();
            tracker
                .close_position(&binding, symbol, exit)
                .await
                .unwrap();
        }

        let metrics = tracker.metrics(binding.account_id, 30).await.unwrap();
        assert_eq!(metrics.total_positions, 3);
        assert_eq!(metrics.open_positions, 0);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.avg_loss, 10.0);
        assert!((metrics.profit_factor - 110.0).abs() < 1e-9);
        assert!(metrics.max_drawdown > 0.0);
    }

    #[tokio::test]
    async fn test_sync_creates_updates_and_stale_closes() {
        use crate::connectors::mock::MockConnector;
        use crate::connectors::{ConnectorConfig, Credentials, VenuePosition};
        use std::time::Duration as StdDuration;

        let (tracker, binding) = setup().await;
        let connector = MockConnector::new(ConnectorConfig {
            venue: Venue::Mock,
            testnet: true,
            rest_url: "mock://local".to_string(),
            ws_url: None,
            requests_per_minute: 600,
            request_timeout: StdDuration::from_secs(5),
        });
        connector.connect().await.unwrap();
        connector
            .authenticate(&Credentials::default())
            .await
            .unwrap();

        // Local position the venue no longer has.
        tracker
            .apply_update(&binding, &update("DOGE-PERP", 100.0, Some(0.1)))
            .await
            .unwrap();

        // Venue-side position the store does not know about.
        connector.seed_position(VenuePosition {
            symbol: "BTC-PERP".to_string(),
            side: PositionSide::Long,
            quantity: 0.25,
            entry_price: 48_000.0,
            mark_price: 50_500.0,
            liquidation_price: Some(40_000.0),
            unrealized_pnl: 625.0,
            realized_pnl: 0.0,
            margin: 12_000.0,
            margin_ratio: None,
            leverage: 1.0,
            is_isolated: false,
        });

        let synced = tracker.sync_positions(&binding, &connector).await.unwrap();
        assert_eq!(synced, 1);

        let store = &tracker.store;
        let created = store
            .get_open_position(binding.id, "BTC-PERP")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.quantity, 0.25);
        assert_eq!(created.entry_price, 48_000.0);

        let stale = store.get_open_position(binding.id, "DOGE-PERP").await.unwrap();
        assert!(stale.is_none());
    }

    #[test]
    fn test_max_drawdown_formula() {
        // Cumulative series: 100, 150, 90, 120 → peak 150, trough 90.
        let now = Utc::now();
        let series = vec![
            (now, 100.0),
            (now, 50.0),
            (now, -60.0),
            (now, 30.0),
        ];
        let dd = max_drawdown_pct(&series);
        assert!((dd - (150.0 - 90.0) / 150.0 * 100.0).abs() < 1e-9);
        assert_eq!(max_drawdown_pct(&[]), 0.0);
    }
}
