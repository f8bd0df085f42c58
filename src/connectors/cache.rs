//! Adapter Response Cache
//! An explicit TTL layer in front of a connector: key = (venue, op, args
//! digest), TTL per operation. Only market-data reads are cached; trading
//! and account state always hit the venue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    AccountSnapshot, Channel, Credentials, FundingInfo, MarketSnapshot, ModifyRequest, OrderAck,
    OrderBookSnapshot, OrderFilter, PlaceOrderRequest, PublicTrade, StreamUpdate, VenueConnector,
    VenueOrder, VenuePosition,
};
use crate::error::Result;
use crate::models::Venue;

/// Per-op TTLs, mirroring how fast each feed actually moves.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub market_data: Duration,
    pub order_book: Duration,
    pub recent_trades: Duration,
    pub funding_rate: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            market_data: Duration::from_secs(5),
            order_book: Duration::from_secs(2),
            recent_trades: Duration::from_secs(2),
            funding_rate: Duration::from_secs(30),
        }
    }
}

struct Entry {
    stored_at: Instant,
    value: serde_json::Value,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
}

/// Wraps any connector and serves cached market-data responses.
pub struct CachedConnector {
    inner: Arc<dyn VenueConnector>,
    ttls: CacheTtls,
    cache: Mutex<CacheInner>,
}

impl CachedConnector {
    pub fn new(inner: Arc<dyn VenueConnector>, ttls: CacheTtls) -> Self {
        Self {
            inner,
            ttls,
            cache: Mutex::new(CacheInner::default()),
        }
    }

    fn key(&self, op: &str, args: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(args.as_bytes());
        let digest = hex::encode(&hasher.finalize()[..8]);
        format!("{}:{}:{}", self.inner.venue(), op, digest)
    }

    fn lookup<T: serde::de::DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let cache = self.cache.lock();
        let entry = cache.entries.get(key)?;
        if entry.stored_at.elapsed() > ttl {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    fn store<T: serde::Serialize>(&self, key: String, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.cache.lock().entries.insert(
                key,
                Entry {
                    stored_at: Instant::now(),
                    value: json,
                },
            );
        }
    }
}

#[async_trait]
impl VenueConnector for CachedConnector {
    fn venue(&self) -> Venue {
        self.inner.venue()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        self.inner.authenticate(credentials).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.cache.lock().entries.clear();
        self.inner.disconnect().await
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        self.inner.place_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<()> {
        self.inner.cancel_order(symbol, venue_order_id).await
    }

    async fn modify_order(
        &self,
        symbol: &str,
        venue_order_id: &str,
        changes: &ModifyRequest,
    ) -> Result<OrderAck> {
        self.inner.modify_order(symbol, venue_order_id, changes).await
    }

    async fn get_order(&self, symbol: &str, venue_order_id: &str) -> Result<VenueOrder> {
        self.inner.get_order(symbol, venue_order_id).await
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<VenueOrder>> {
        self.inner.get_orders(filter).await
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>> {
        self.inner.get_open_orders(symbol).await
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<VenuePosition>> {
        self.inner.get_positions(symbol).await
    }

    async fn close_position(&self, symbol: &str, quantity: Option<f64>) -> Result<OrderAck> {
        self.inner.close_position(symbol, quantity).await
    }

    async fn get_account_info(&self) -> Result<AccountSnapshot> {
        self.inner.get_account_info().await
    }

    async fn get_balance(
        &self,
        asset: Option<&str>,
    ) -> Result<std::collections::HashMap<String, f64>> {
        self.inner.get_balance(asset).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.inner.set_leverage(symbol, leverage).await
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let key = self.key("market_data", symbol);
        if let Some(hit) = self.lookup::<MarketSnapshot>(&key, self.ttls.market_data) {
            return Ok(hit);
        }
        let fresh = self.inner.get_market_data(symbol).await?;
        self.store(key, &fresh);
        Ok(fresh)
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let key = self.key("order_book", &format!("{symbol}:{depth}"));
        if let Some(hit) = self.lookup::<OrderBookSnapshot>(&key, self.ttls.order_book) {
            return Ok(hit);
        }
        let fresh = self.inner.get_order_book(symbol, depth).await?;
        self.store(key, &fresh);
        Ok(fresh)
    }

    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let key = self.key("recent_trades", &format!("{symbol}:{limit}"));
        if let Some(hit) = self.lookup::<Vec<PublicTrade>>(&key, self.ttls.recent_trades) {
            return Ok(hit);
        }
        let fresh = self.inner.get_recent_trades(symbol, limit).await?;
        self.store(key, &fresh);
        Ok(fresh)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo> {
        let key = self.key("funding_rate", symbol);
        if let Some(hit) = self.lookup::<FundingInfo>(&key, self.ttls.funding_rate) {
            return Ok(hit);
        }
        let fresh = self.inner.get_funding_rate(symbol).await?;
        self.store(key, &fresh);
        Ok(fresh)
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>> {
        self.inner.subscribe(channels).await
    }

    async fn unsubscribe(&self, channels: &[Channel]) -> Result<()> {
        self.inner.unsubscribe(channels).await
    }
}
