//! Risk Engine
//! Mission: Pre-trade limit enforcement (every violation reported, no
//! short-circuit), continuous post-trade monitoring with alerting, and an
//! idempotent emergency flatten

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::executor::OrderExecutor;
use crate::models::{OrderSide, PositionSide};
use crate::notify::{NotificationBus, NotificationKind, NotificationPriority};
use crate::store::Store;

/// Parametric VaR placeholder: 2% daily volatility at 95% confidence.
const VAR_DAILY_VOL: f64 = 0.02;
const VAR_Z_SCORE: f64 = 2.33;
/// Liquidation warning threshold inside the monitoring loop.
const LIQUIDATION_WARN_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Per-account limits, defaulted when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_size_usd: f64,
    pub max_leverage: f64,
    pub max_drawdown_pct: f64,
    pub max_exposure_usd: f64,
    pub min_margin_ratio: f64,
    pub max_orders_per_minute: i64,
    pub max_daily_loss_usd: f64,
    pub position_limits_per_symbol: HashMap<String, f64>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: 100_000.0,
            max_leverage: 10.0,
            max_drawdown_pct: 20.0,
            max_exposure_usd: 500_000.0,
            min_margin_ratio: 0.05,
            max_orders_per_minute: 60,
            max_daily_loss_usd: 10_000.0,
            position_limits_per_symbol: HashMap::new(),
        }
    }
}

/// One failed pre-trade rule. `rule` names the limit; `message` carries
/// the numbers.
#[derive(Debug, Clone, Serialize)]
pub struct RiskViolation {
    pub rule: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub account_id: i64,
    pub timestamp: DateTime<Utc>,
    pub total_exposure: f64,
    pub margin_usage_pct: f64,
    pub leverage_ratio: f64,
    pub var_95: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub risk_level: RiskLevel,
    pub alerts: Vec<String>,
}

pub struct RiskEngine {
    store: Store,
    notifier: Arc<NotificationBus>,
    limits: RwLock<HashMap<i64, RiskLimits>>,
    default_limits: RiskLimits,
    /// Bound after construction; the executor holds the engine, so the
    /// back-reference is weak.
    executor: RwLock<Weak<OrderExecutor>>,
    monitors: Mutex<HashMap<i64, JoinHandle<()>>>,
    monitor_interval_secs: u64,
    /// Margin usage fraction that triggers a MARGIN_CALL notification.
    margin_call_ratio: f64,
}

impl RiskEngine {
    pub fn new(
        store: Store,
        notifier: Arc<NotificationBus>,
        default_limits: RiskLimits,
        monitor_interval_secs: u64,
        margin_call_ratio: f64,
    ) -> Self {
        Self {
            store,
            notifier,
            limits: RwLock::new(HashMap::new()),
            default_limits,
            executor: RwLock::new(Weak::new()),
            monitors: Mutex::new(HashMap::new()),
            monitor_interval_secs,
            margin_call_ratio,
        }
    }

    /// Wire the executor in after both services exist.
    pub fn bind_executor(&self, executor: &Arc<OrderExecutor>) {
        *self.executor.write() = Arc::downgrade(executor);
    }

    pub fn set_limits(&self, account_id: i64, limits: RiskLimits) {
        self.limits.write().insert(account_id, limits);
    }

    pub fn limits_for(&self, account_id: i64) -> RiskLimits {
        self.limits
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }

    /// Pre-trade check. Every failing rule is reported; an empty vector
    /// means the order passes.
    pub async fn check(
        &self,
        account_id: i64,
        symbol: &str,
        _side: OrderSide,
        quantity: f64,
        price: f64,
        leverage: f64,
    ) -> Result<Vec<RiskViolation>> {
        let limits = self.limits_for(account_id);
        let mut violations = Vec::new();

        let order_value = quantity * price;
        let leveraged_value = order_value * leverage;

        if order_value > limits.max_position_size_usd {
            violations.push(RiskViolation {
                rule: "PositionSize",
                message: format!(
                    "Position size ${order_value:.2} exceeds limit ${:.2}",
                    limits.max_position_size_usd
                ),
            });
        }

        if leverage > limits.max_leverage {
            violations.push(RiskViolation {
                rule: "Leverage",
                message: format!(
                    "Leverage {leverage}x exceeds limit {}x",
                    limits.max_leverage
                ),
            });
        }

        if let Some(symbol_limit) = limits.position_limits_per_symbol.get(symbol) {
            if order_value > *symbol_limit {
                violations.push(RiskViolation {
                    rule: "SymbolPositionSize",
                    message: format!(
                        "Position size for {symbol} exceeds limit ${symbol_limit:.2}"
                    ),
                });
            }
        }

        let current_exposure = self.total_exposure(account_id).await?;
        let new_exposure = current_exposure + leveraged_value;
        if new_exposure > limits.max_exposure_usd {
            violations.push(RiskViolation {
                rule: "Exposure",
                message: format!(
                    "Total exposure ${new_exposure:.2} would exceed limit ${:.2}",
                    limits.max_exposure_usd
                ),
            });
        }

        // Margin against the cached binding balances; staleness accepted.
        let required_margin = if leverage > 0.0 {
            order_value / leverage
        } else {
            order_value
        };
        let available = self.store.available_balance_for_account(account_id).await?;
        if required_margin > available {
            violations.push(RiskViolation {
                rule: "Margin",
                message: format!(
                    "Insufficient margin: required ${required_margin:.2}, available ${available:.2}"
                ),
            });
        }

        let recent = self
            .store
            .count_orders_since(account_id, Utc::now() - Duration::seconds(60))
            .await?;
        if recent >= limits.max_orders_per_minute {
            violations.push(RiskViolation {
                rule: "OrderRate",
                message: format!(
                    "Order rate limit exceeded: {recent}/{} orders per minute",
                    limits.max_orders_per_minute
                ),
            });
        }

        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);
        let daily_pnl = self.store.realized_pnl_since(account_id, midnight).await?;
        if daily_pnl < -limits.max_daily_loss_usd {
            violations.push(RiskViolation {
                rule: "DailyLoss",
                message: format!("Daily loss limit exceeded: ${daily_pnl:.2}"),
            });
        }

        Ok(violations)
    }

    pub async fn total_exposure(&self, account_id: i64) -> Result<f64> {
        let positions = self.store.open_positions_for_account(account_id).await?;
        Ok(positions
            .iter()
            .map(|p| p.quantity * p.mark_price * p.leverage)
            .sum())
    }

    /// Compute the account's risk metrics from open positions, cached
    /// balances and the PnL history.
    pub async fn metrics(&self, account_id: i64) -> Result<RiskMetrics> {
        let positions = self.store.open_positions_for_account(account_id).await?;

        let mut total_exposure = 0.0;
        let mut margin_used = 0.0;
        let mut total_value = 0.0;
        for position in &positions {
            let value = position.notional_value();
            total_exposure += value * position.leverage;
            margin_used += position.margin;
            total_value += value;
        }

        let total_balance = self.store.total_balance_for_account(account_id).await?;
        let margin_usage_pct = if total_balance > 0.0 {
            margin_used / total_balance * 100.0
        } else {
            0.0
        };
        let leverage_ratio = if total_balance > 0.0 {
            total_exposure / total_balance
        } else {
            0.0
        };

        let var_95 = total_value * VAR_DAILY_VOL * VAR_Z_SCORE;

        let since = Utc::now() - Duration::days(30);
        let series = self.store.pnl_series_for_account(account_id, since).await?;
        let max_drawdown = drawdown_pct(&series);
        let sharpe_ratio = naive_sharpe(&series);

        let risk_level = classify_risk(margin_usage_pct, leverage_ratio, max_drawdown);

        let mut alerts = Vec::new();
        if margin_usage_pct > 80.0 {
            alerts.push(format!("High margin usage: {margin_usage_pct:.1}%"));
        }
        if leverage_ratio > 8.0 {
            alerts.push(format!("High leverage: {leverage_ratio:.1}x"));
        }
        if max_drawdown > 15.0 {
            alerts.push(format!("Significant drawdown: {max_drawdown:.1}%"));
        }

        Ok(RiskMetrics {
            account_id,
            timestamp: Utc::now(),
            total_exposure,
            margin_usage_pct,
            leverage_ratio,
            var_95,
            max_drawdown,
            sharpe_ratio,
            risk_level,
            alerts,
        })
    }

    /// Start (or restart) the monitoring loop for an account.
    pub fn monitor(self: &Arc<Self>, account_id: i64) {
        let engine = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.monitor_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.monitor_tick(account_id).await {
                    // The loop survives individual tick failures.
                    error!(account_id, error = %e, "risk monitor tick failed");
                }
            }
        });

        let mut monitors = self.monitors.lock();
        if let Some(previous) = monitors.insert(account_id, handle) {
            previous.abort();
        }
        info!(account_id, "risk monitoring started");
    }

    pub fn stop_monitoring(&self, account_id: i64) {
        if let Some(handle) = self.monitors.lock().remove(&account_id) {
            handle.abort();
            info!(account_id, "risk monitoring stopped");
        }
    }

    pub fn stop_all_monitors(&self) {
        for (_, handle) in self.monitors.lock().drain() {
            handle.abort();
        }
    }

    async fn monitor_tick(&self, account_id: i64) -> Result<()> {
        let positions = self.store.open_positions_for_account(account_id).await?;

        for position in &positions {
            // Liquidation proximity warning.
            if let Some(distance) = position.liquidation_distance_pct() {
                if distance < LIQUIDATION_WARN_PCT {
                    self.notifier.publish(
                        account_id,
                        NotificationKind::RiskAlert,
                        NotificationPriority::High,
                        "Liquidation Warning",
                        &format!(
                            "{} within {distance:.1}% of liquidation",
                            position.symbol
                        ),
                        json!({
                            "symbol": position.symbol,
                            "distance_pct": distance,
                            "liquidation_price": position.liquidation_price,
                        }),
                    );
                }
            }

            // Stop-loss / take-profit triggers.
            let stop_hit = position.stop_loss_price.is_some_and(|stop| match position.side {
                PositionSide::Long => position.mark_price <= stop,
                PositionSide::Short => position.mark_price >= stop,
            });
            let target_hit = position
                .take_profit_price
                .is_some_and(|target| match position.side {
                    PositionSide::Long => position.mark_price >= target,
                    PositionSide::Short => position.mark_price <= target,
                });
            if stop_hit || target_hit {
                let reason = if stop_hit { "stop-loss" } else { "take-profit" };
                info!(
                    account_id,
                    symbol = %position.symbol,
                    reason,
                    mark = position.mark_price,
                    "protective trigger crossed"
                );
                let executor = self.executor.read().upgrade();
                if let Some(executor) = executor {
                    if let Err(e) = executor
                        .flatten_position(account_id, position.binding_id, &position.symbol)
                        .await
                    {
                        warn!(symbol = %position.symbol, error = %e, "{reason} close failed");
                    }
                }
            }
        }

        let metrics = self.metrics(account_id).await?;
        if metrics.margin_usage_pct >= self.margin_call_ratio * 100.0 {
            self.notifier.publish(
                account_id,
                NotificationKind::MarginCall,
                NotificationPriority::Critical,
                "Margin Call",
                &format!(
                    "Your margin level is at {:.1}%. Please add funds or reduce positions.",
                    metrics.margin_usage_pct
                ),
                json!({"margin_usage_pct": metrics.margin_usage_pct}),
            );
        }
        if metrics.risk_level == RiskLevel::Critical {
            self.handle_critical(account_id, &metrics);
        }
        Ok(())
    }

    fn handle_critical(&self, account_id: i64, metrics: &RiskMetrics) {
        error!(
            account_id,
            alerts = ?metrics.alerts,
            "CRITICAL risk level"
        );
        // Operator policy decides whether to flatten; the engine alerts.
        self.notifier.publish(
            account_id,
            NotificationKind::RiskAlert,
            NotificationPriority::Critical,
            "Critical Risk Level",
            &metrics.alerts.join(", "),
            json!({
                "margin_usage_pct": metrics.margin_usage_pct,
                "leverage_ratio": metrics.leverage_ratio,
                "max_drawdown": metrics.max_drawdown,
            }),
        );
    }

    /// Close every OPEN position with reduce-only market orders, then
    /// cancel every non-terminal order. Safe to call repeatedly: once
    /// flat, both steps are no-ops.
    pub async fn emergency_close_all(&self, account_id: i64) -> Result<usize> {
        warn!(account_id, "emergency close triggered");
        let Some(executor) = self.executor.read().upgrade() else {
            return Err(crate::error::GatewayError::Internal(
                "risk engine has no executor bound".to_string(),
            ));
        };

        let positions = self.store.open_positions_for_account(account_id).await?;
        let mut closed = 0;
        for position in &positions {
            match executor
                .flatten_position(account_id, position.binding_id, &position.symbol)
                .await
            {
                Ok(_) => {
                    closed += 1;
                    info!(symbol = %position.symbol, "position closed by emergency flatten");
                }
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "emergency close failed");
                }
            }
        }

        let canceled = executor.cancel_all(account_id, None, None).await?;

        self.notifier.publish(
            account_id,
            NotificationKind::RiskAlert,
            NotificationPriority::Critical,
            "Emergency Flatten",
            &format!("Closed {closed} positions, canceled {canceled} orders"),
            json!({"positions_closed": closed, "orders_canceled": canceled}),
        );
        Ok(closed)
    }
}

fn classify_risk(margin_usage_pct: f64, leverage_ratio: f64, max_drawdown: f64) -> RiskLevel {
    if margin_usage_pct > 90.0 || leverage_ratio > 10.0 || max_drawdown > 25.0 {
        RiskLevel::Critical
    } else if margin_usage_pct > 70.0 || leverage_ratio > 7.0 || max_drawdown > 15.0 {
        RiskLevel::High
    } else if margin_usage_pct > 50.0 || leverage_ratio > 5.0 || max_drawdown > 10.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn drawdown_pct(series: &[(DateTime<Utc>, f64)]) -> f64 {
    if series.is_empty() {
        return 0.0;
    }
    let mut running = 0.0;
    let mut peak = f64::MIN;
    let mut max_drawdown: f64 = 0.0;
    for (_, pnl) in series {
        running += pnl;
        if running > peak {
            peak = running;
        }
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - running) / peak);
        }
    }
    max_drawdown * 100.0
}

/// Annualized mean/stdev over the PnL increments. A placeholder measure;
/// returns 0 when there is not enough history to be meaningful.
fn naive_sharpe(series: &[(DateTime<Utc>, f64)]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let n = series.len() as f64;
    let mean = series.iter().map(|(_, p)| p).sum::<f64>() / n;
    let variance = series
        .iter()
        .map(|(_, p)| (p - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let stdev = variance.sqrt();
    if stdev <= f64::EPSILON {
        return 0.0;
    }
    mean / stdev * (365.0f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;
    use crate::store::NewBinding;

    async fn setup() -> (Arc<RiskEngine>, i64) {
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
        store
            .update_binding_balances(binding.id, 50_000.0, 50_000.0, 0.0, 0.0)
            .await
            .unwrap();

        let engine = Arc::new(RiskEngine::new(
            store,
            Arc::new(NotificationBus::default()),
            RiskLimits::default(),
            30,
            0.8,
        ));
        (engine, account.id)
    }

    #[tokio::test]
    async fn test_clean_order_passes() {
        let (engine, account_id) = setup().await;
        let violations = engine
            .check(account_id, "BTC-PERP", OrderSide::Buy, 0.1, 50_000.0, 1.0)
            .await
            .unwrap();
        assert!(violations.is_empty());
    }

    #[tokio::test]
    async fn test_leverage_cap_single_violation() {
        let (engine, account_id) = setup().await;
        let violations = engine
            .check(account_id, "BTC-PERP", OrderSide::Buy, 0.1, 50_000.0, 15.0)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Leverage");
        assert!(violations[0].message.contains("15"));
    }

    #[tokio::test]
    async fn test_all_violations_reported_not_short_circuited() {
        let (engine, account_id) = setup().await;
        let mut limits = RiskLimits::default();
        limits
            .position_limits_per_symbol
            .insert("BTC-PERP".to_string(), 1_000.0);
        engine.set_limits(account_id, limits);

        // Huge order at huge leverage: size, symbol cap, leverage,
        // exposure and margin all fail at once.
        let violations = engine
            .check(account_id, "BTC-PERP", OrderSide::Buy, 100.0, 50_000.0, 20.0)
            .await
            .unwrap();
        let rules: Vec<&str> = violations.iter().map(|v| v.rule).collect();
        assert!(rules.contains(&"PositionSize"));
        assert!(rules.contains(&"SymbolPositionSize"));
        assert!(rules.contains(&"Leverage"));
        assert!(rules.contains(&"Exposure"));
        assert!(rules.contains(&"Margin"));
        assert_eq!(rules.len(), 5);
    }

    #[tokio::test]
    async fn test_margin_uses_cached_balance() {
        let (engine, account_id) = setup().await;
        // 50k notional at 10x needs 5k margin against a 50k balance.
        let ok = engine
            .check(account_id, "ETH-PERP", OrderSide::Buy, 20.0, 2_500.0, 10.0)
            .await
            .unwrap();
        assert!(ok.is_empty());

        // 52.5k notional at 1x exceeds the cached 50k.
        let violations = engine
            .check(account_id, "ETH-PERP", OrderSide::Buy, 21.0, 2_500.0, 1.0)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Margin");
    }

    #[tokio::test]
    async fn test_risk_level_matrix() {
        assert_eq!(classify_risk(95.0, 1.0, 0.0), RiskLevel::Critical);
        assert_eq!(classify_risk(75.0, 1.0, 0.0), RiskLevel::High);
        assert_eq!(classify_risk(55.0, 1.0, 0.0), RiskLevel::Medium);
        assert_eq!(classify_risk(10.0, 6.0, 0.0), RiskLevel::Medium);
        assert_eq!(classify_risk(10.0, 1.0, 30.0), RiskLevel::Critical);
        assert_eq!(classify_risk(10.0, 1.0, 1.0), RiskLevel::Low);
    }

    #[tokio::test]
    async fn test_metrics_flat_account() {
        let (engine, account_id) = setup().await;
        let metrics = engine.metrics(account_id).await.unwrap();
        assert_eq!(metrics.total_exposure, 0.0);
        assert_eq!(metrics.var_95, 0.0);
        assert_eq!(metrics.risk_level, RiskLevel::Low);
        assert!(metrics.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_custom_limits_replace_defaults() {
        let (engine, account_id) = setup().await;
        engine.set_limits(
            account_id,
            RiskLimits {
                max_leverage: 3.0,
                ..Default::default()
            },
        );
        let violations = engine
            .check(account_id, "BTC-PERP", OrderSide::Buy, 0.01, 50_000.0, 5.0)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Leverage");

        // Another account still gets defaults.
        let other = engine
            .check(account_id + 1, "BTC-PERP", OrderSide::Buy, 0.0001, 50_000.0, 5.0)
            .await
            .unwrap();
        assert!(other.iter().all(|v| v.rule != "Leverage"));
    }
}
