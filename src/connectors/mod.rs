//! Venue Connectors
//! Mission: One uniform contract per venue; the connector is the only
//! component that speaks a venue's wire dialect

pub mod cache;
pub mod extended;
pub mod hyperliquid;
pub mod lighter;
pub mod mock;
pub mod rate_limit;
pub mod registry;
pub mod symbol;

pub use cache::CachedConnector;
pub use registry::ConnectorRegistry;
pub use symbol::SymbolMap;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{
    OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, Venue, VenueBinding,
};
use crate::vault::CredentialVault;

/// Decrypted, request-scoped credential bundle. Never logged; which subset
/// is required is venue-specific and checked by `authenticate`.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub private_key: Option<String>,
    pub wallet_address: Option<String>,
    pub vault: Option<i64>,
    pub testnet: bool,
}

impl Credentials {
    /// Decrypt a binding's secrets through the vault.
    pub fn decrypt(binding: &VenueBinding, vault: &CredentialVault) -> Result<Self> {
        Ok(Self {
            api_key: vault.decrypt_opt(binding.encrypted_api_key.as_deref())?,
            api_secret: vault.decrypt_opt(binding.encrypted_api_secret.as_deref())?,
            private_key: vault.decrypt_opt(binding.encrypted_private_key.as_deref())?,
            wallet_address: binding.wallet_address.clone(),
            vault: binding.vault_index,
            testnet: binding.testnet,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_secret", &self.api_secret.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .field("wallet_address", &self.wallet_address)
            .field("vault", &self.vault)
            .field("testnet", &self.testnet)
            .finish()
    }
}

/// Per-connector construction parameters resolved by the registry.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub venue: Venue,
    pub testnet: bool,
    pub rest_url: String,
    pub ws_url: Option<String>,
    pub requests_per_minute: u32,
    pub request_timeout: Duration,
}

/// Venue-agnostic order submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub post_only: bool,
    pub is_isolated: bool,
    /// Per-order leverage intent; venues without per-order leverage apply
    /// it via `set_leverage`. Also feeds the pre-trade risk check.
    pub leverage: Option<f64>,
    pub client_order_id: Option<String>,
}

impl PlaceOrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
            post_only: false,
            is_isolated: false,
            leverage: None,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
            post_only: false,
            is_isolated: false,
            leverage: None,
            client_order_id: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Synchronous acknowledgement returned by `place_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
    pub fee: f64,
}

/// Changes accepted by `modify_order`. `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// An order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub average_price: Option<f64>,
    pub fee: f64,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
}

/// A position as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub margin: f64,
    pub margin_ratio: Option<f64>,
    pub leverage: f64,
    pub is_isolated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_balance: f64,
    pub available_balance: f64,
    pub margin_balance: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub mark_price: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub open_24h: f64,
    pub funding_rate: Option<f64>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub open_interest: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn spread(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.bids.first(), self.asks.first()) {
            (Some(b), Some(a)) => Some((a.price + b.price) / 2.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTrade {
    pub trade_id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: OrderSide,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingInfo {
    pub symbol: String,
    pub funding_rate: f64,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Subscription channels for `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Market data for one canonical symbol.
    Market(String),
    Orders,
    Positions,
}

impl Channel {
    pub fn as_str(&self) -> String {
        match self {
            Channel::Market(symbol) => format!("market:{symbol}"),
            Channel::Orders => "orders".to_string(),
            Channel::Positions => "positions".to_string(),
        }
    }
}

/// Updates emitted on a subscription stream, tagged by channel.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Market(MarketSnapshot),
    Order(VenueOrder),
    Position(VenuePosition),
}

impl StreamUpdate {
    pub fn channel(&self) -> Channel {
        match self {
            StreamUpdate::Market(m) => Channel::Market(m.symbol.clone()),
            StreamUpdate::Order(_) => Channel::Orders,
            StreamUpdate::Position(_) => Channel::Positions,
        }
    }
}

/// Filters for `get_orders`.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

/// The uniform venue contract. One implementation per venue; instances are
/// created by the registry per (venue, binding, testnet) and shared behind
/// `Arc<dyn VenueConnector>`.
#[async_trait]
pub trait VenueConnector: Send + Sync {
    fn venue(&self) -> Venue;

    /// Establish transport. Idempotent; may prefetch a symbol catalog.
    async fn connect(&self) -> Result<()>;

    /// Derive signing material from the bundle; may issue a probe request.
    async fn authenticate(&self, credentials: &Credentials) -> Result<()>;

    /// Release transport. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<()>;

    /// Venues without native modify implement cancel-then-replace and
    /// return the replacement venue order id in the ack.
    async fn modify_order(
        &self,
        symbol: &str,
        venue_order_id: &str,
        changes: &ModifyRequest,
    ) -> Result<OrderAck>;

    async fn get_order(&self, symbol: &str, venue_order_id: &str) -> Result<VenueOrder>;
    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<VenueOrder>>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>>;

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<VenuePosition>>;

    /// Close a position via an opposite reduce-only market order.
    async fn close_position(&self, symbol: &str, quantity: Option<f64>) -> Result<OrderAck>;

    async fn get_account_info(&self) -> Result<AccountSnapshot>;
    async fn get_balance(&self, asset: Option<&str>) -> Result<HashMap<String, f64>>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot>;
    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot>;
    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>>;
    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo>;

    /// Subscribe to updates on a bounded channel. A slow consumer causes
    /// the producer to pause (venue-specific backpressure).
    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>>;
    async fn unsubscribe(&self, channels: &[Channel]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials {
            api_key: Some("k-123".to_string()),
            api_secret: Some("s-456".to_string()),
            private_key: Some("0xdead".to_string()),
            wallet_address: Some("0xabc".to_string()),
            vault: None,
            testnet: true,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("k-123"));
        assert!(!rendered.contains("s-456"));
        assert!(!rendered.contains("0xdead"));
        assert!(rendered.contains("REDACTED"));
        // The wallet address is public material.
        assert!(rendered.contains("0xabc"));
    }

    #[test]
    fn test_book_mid_and_spread() {
        let book = OrderBookSnapshot {
            symbol: "BTC-PERP".to_string(),
            bids: vec![BookLevel {
                price: 49_990.0,
                quantity: 1.0,
            }],
            asks: vec![BookLevel {
                price: 50_010.0,
                quantity: 1.0,
            }],
            timestamp: Utc::now(),
        };
        assert_eq!(book.spread(), Some(20.0));
        assert_eq!(book.mid_price(), Some(50_000.0));
    }

    #[test]
    fn test_channel_tagging() {
        assert_eq!(Channel::Market("BTC-PERP".into()).as_str(), "market:BTC-PERP");
        assert_eq!(Channel::Orders.as_str(), "orders");
    }
}
