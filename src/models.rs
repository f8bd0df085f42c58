//! Domain Models
//! Mission: Invariant-bearing entities shared by the store, executor,
//! tracker and risk engine. Wire DTOs live in `connectors`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported venues. `edgex` and `vest` are recognized tags whose
/// connectors are not yet registered; the registry reports them as such.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Hyperliquid,
    Lighter,
    Extended,
    Edgex,
    Vest,
    Mock,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Hyperliquid => "hyperliquid",
            Venue::Lighter => "lighter",
            Venue::Extended => "extended",
            Venue::Edgex => "edgex",
            Venue::Vest => "vest",
            Venue::Mock => "mock",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hyperliquid" => Some(Venue::Hyperliquid),
            "lighter" => Some(Venue::Lighter),
            "extended" => Some(Venue::Extended),
            "edgex" => Some(Venue::Edgex),
            "vest" => Some(Venue::Vest),
            "mock" | "test" => Some(Venue::Mock),
            _ => None,
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Sign applied to quantities when folding fills into a position.
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    TakeProfit,
    TakeProfitLimit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop => "STOP",
            OrderKind::StopLimit => "STOP_LIMIT",
            OrderKind::TakeProfit => "TAKE_PROFIT",
            OrderKind::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MARKET" => Some(OrderKind::Market),
            "LIMIT" => Some(OrderKind::Limit),
            "STOP" => Some(OrderKind::Stop),
            "STOP_LIMIT" => Some(OrderKind::StopLimit),
            "TAKE_PROFIT" => Some(OrderKind::TakeProfit),
            "TAKE_PROFIT_LIMIT" => Some(OrderKind::TakeProfitLimit),
            _ => None,
        }
    }

    /// Kinds that require a limit price on the request.
    pub fn requires_price(&self) -> bool {
        matches!(
            self,
            OrderKind::Limit | OrderKind::StopLimit | OrderKind::TakeProfitLimit
        )
    }

    /// Kinds that require a stop/trigger price on the request.
    pub fn requires_stop_price(&self) -> bool {
        matches!(
            self,
            OrderKind::Stop | OrderKind::StopLimit | OrderKind::TakeProfit | OrderKind::TakeProfitLimit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtt,
    PostOnly,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::Gtt => "GTT",
            TimeInForce::PostOnly => "POST_ONLY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GTC" => Some(TimeInForce::Gtc),
            "IOC" => Some(TimeInForce::Ioc),
            "FOK" => Some(TimeInForce::Fok),
            "GTT" => Some(TimeInForce::Gtt),
            "POST_ONLY" => Some(TimeInForce::PostOnly),
            _ => None,
        }
    }
}

/// Order lifecycle. Progression is monotonic:
/// PENDING → NEW → {PARTIALLY_FILLED → FILLED, CANCELED, REJECTED, EXPIRED}.
/// Once terminal the status (and filled quantity) are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(OrderStatus::Pending),
            "NEW" | "OPEN" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" | "PARTIAL" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Rank used to enforce monotonic progression. Terminal states share
    /// the top rank; which terminal state wins is decided by whoever gets
    /// there first.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::New => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// Side implied by a signed quantity delta.
    pub fn from_delta(delta: f64) -> Self {
        if delta >= 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Liquidated => "LIQUIDATED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSING" => Some(PositionStatus::Closing),
            "CLOSED" => Some(PositionStatus::Closed),
            "LIQUIDATED" => Some(PositionStatus::Liquidated),
            _ => None,
        }
    }

    /// LIQUIDATED is terminal; CLOSED positions stay for audit.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Liquidated)
    }
}

/// User-level principal. Owns venue bindings; destroyed only by explicit
/// deletion, never by cascade from a binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Per-account risk defaults, seed values for the risk engine.
    pub max_position_size_usd: f64,
    pub max_leverage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Credentials and cached balances for one (venue, account-name) pair.
/// (account, venue, name) is unique. Inactive bindings never receive
/// dispatch; deactivation is a soft delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBinding {
    pub id: i64,
    pub account_id: i64,
    pub venue: Venue,
    pub name: String,
    pub testnet: bool,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub encrypted_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_api_secret: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_private_key: Option<String>,
    pub wallet_address: Option<String>,
    pub vault_index: Option<i64>,
    // Cached balances, refreshed by the account manager and reconciler.
    pub total_balance: f64,
    pub available_balance: f64,
    pub margin_balance: f64,
    pub unrealized_pnl: f64,
    pub requests_per_minute: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable order record. Identity (`id`) is immutable; the venue order id
/// can be replaced once by a cancel-replace modify.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub account_id: i64,
    pub binding_id: i64,
    pub venue_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub average_fill_price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub is_isolated: bool,
    pub fee: f64,
    pub fee_asset: Option<String>,
    pub placed_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Individual fill belonging to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub order_id: i64,
    pub venue_trade_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub fee_asset: Option<String>,
    pub is_maker: bool,
    /// Set when this fill reduced an existing position.
    pub realized_pnl: Option<f64>,
    pub executed_at: DateTime<Utc>,
}

/// Aggregate net exposure per (binding, symbol). At most one OPEN position
/// per pair; quantity > 0 while OPEN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub account_id: i64,
    pub binding_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub quantity: f64,
    pub initial_quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub margin: f64,
    pub margin_ratio: Option<f64>,
    pub leverage: f64,
    pub is_isolated: bool,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// LONG: (mark − entry) × qty; SHORT: (entry − mark) × qty.
    pub fn unrealized_at(&self, mark: f64) -> f64 {
        match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark) * self.quantity,
        }
    }

    /// Relative distance from mark to liquidation, in the adverse
    /// direction. Negative means the mark is already past liquidation.
    pub fn liquidation_distance_pct(&self) -> Option<f64> {
        let liq = self.liquidation_price?;
        if self.mark_price <= 0.0 {
            return None;
        }
        let dist = match self.side {
            PositionSide::Long => (self.mark_price - liq) / self.mark_price,
            PositionSide::Short => (liq - self.mark_price) / self.mark_price,
        };
        Some(dist * 100.0)
    }

    /// Signed quantity: positive LONG, negative SHORT.
    pub fn signed_quantity(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.quantity,
            PositionSide::Short => -self.quantity,
        }
    }

    pub fn notional_value(&self) -> f64 {
        self.quantity * self.mark_price
    }
}

/// Append-only snapshot taken on every position mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistory {
    pub id: i64,
    pub position_id: i64,
    pub quantity: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub margin: f64,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub funding_rate: Option<f64>,
    /// The signed quantity delta that caused this snapshot.
    pub size_delta: f64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_aliases() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::from_str(s.as_str()), Some(s));
        }
        // Venue spellings.
        assert_eq!(OrderStatus::from_str("cancelled"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::from_str("open"), Some(OrderStatus::New));
        assert_eq!(OrderStatus::from_str("weird"), None);
    }

    #[test]
    fn test_status_ranks_are_monotonic() {
        assert!(OrderStatus::Pending.rank() < OrderStatus::New.rank());
        assert!(OrderStatus::New.rank() < OrderStatus::PartiallyFilled.rank());
        assert!(OrderStatus::PartiallyFilled.rank() < OrderStatus::Filled.rank());
        assert_eq!(OrderStatus::Canceled.rank(), OrderStatus::Filled.rank());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_unrealized_pnl_mirrors_by_side() {
        let mut pos = sample_position();
        pos.side = PositionSide::Long;
        assert!((pos.unrealized_at(51_000.0) - 100.0).abs() < 1e-9);
        pos.side = PositionSide::Short;
        assert!((pos.unrealized_at(51_000.0) + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_liquidation_distance_directional() {
        let mut pos = sample_position();
        pos.mark_price = 46_000.0;
        pos.liquidation_price = Some(45_000.0);
        let dist = pos.liquidation_distance_pct().unwrap();
        assert!((dist - 100.0 * 1_000.0 / 46_000.0).abs() < 1e-9);

        pos.side = PositionSide::Short;
        pos.mark_price = 46_000.0;
        pos.liquidation_price = Some(47_000.0);
        let dist = pos.liquidation_distance_pct().unwrap();
        assert!(dist > 0.0);
    }

    #[test]
    fn test_order_kind_price_requirements() {
        assert!(OrderKind::Limit.requires_price());
        assert!(OrderKind::StopLimit.requires_price());
        assert!(!OrderKind::Market.requires_price());
        assert!(OrderKind::Stop.requires_stop_price());
        assert!(!OrderKind::Limit.requires_stop_price());
    }

    fn sample_position() -> Position {
        Position {
            id: 1,
            account_id: 1,
            binding_id: 1,
            symbol: "BTC-PERP".to_string(),
            side: PositionSide::Long,
            status: PositionStatus::Open,
            quantity: 0.1,
            initial_quantity: 0.1,
            entry_price: 50_000.0,
            mark_price: 50_000.0,
            liquidation_price: None,
            exit_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin: 500.0,
            margin_ratio: None,
            leverage: 10.0,
            is_isolated: false,
            stop_loss_price: None,
            take_profit_price: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            updated_at: Utc::now(),
        }
    }
}
