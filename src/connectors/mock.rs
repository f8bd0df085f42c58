//! Mock Venue Connector
//! Mission: Deterministic in-memory venue for tests and development.
//! Market orders fill at the mark, limit orders rest unless marketable,
//! and the connector keeps its own position book so reconciliation paths
//! can be exercised end to end.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::{
    AccountSnapshot, Channel, ConnectorConfig, Credentials, FundingInfo, MarketSnapshot,
    ModifyRequest, OrderAck, OrderBookSnapshot, BookLevel, OrderFilter, PlaceOrderRequest,
    PublicTrade, StreamUpdate, VenueConnector, VenueOrder, VenuePosition,
};
use crate::connectors::symbol::canonical;
use crate::error::{GatewayError, Result};
use crate::models::{OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, Venue};

const TAKER_FEE_RATE: f64 = 0.0005;
const DEFAULT_BALANCE: f64 = 10_000.0;

struct MockState {
    connected: bool,
    authenticated: bool,
    order_seq: u64,
    orders: HashMap<String, VenueOrder>,
    positions: HashMap<String, VenuePosition>,
    marks: HashMap<String, f64>,
    leverage: HashMap<String, u32>,
    balance: f64,
    realized_pnl: f64,
    place_delay: Option<Duration>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut marks = HashMap::new();
        marks.insert("BTC-PERP".to_string(), 50_500.0);
        marks.insert("ETH-PERP".to_string(), 3_000.5);
        marks.insert("SOL-PERP".to_string(), 100.0);
        Self {
            connected: false,
            authenticated: false,
            order_seq: 0,
            orders: HashMap::new(),
            positions: HashMap::new(),
            marks,
            leverage: HashMap::new(),
            balance: DEFAULT_BALANCE,
            realized_pnl: 0.0,
            place_delay: None,
        }
    }
}

pub struct MockConnector {
    config: ConnectorConfig,
    state: Mutex<MockState>,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl MockConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MockState::default()),
            streams: Mutex::new(Vec::new()),
        }
    }

    // ── Test hooks ─────────────────────────────────────────

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state.lock().marks.insert(canonical(symbol), price);
    }

    pub fn set_balance(&self, balance: f64) {
        self.state.lock().balance = balance;
    }

    /// Delay order placement, for exercising dispatch deadlines.
    pub fn set_place_delay(&self, delay: Duration) {
        self.state.lock().place_delay = Some(delay);
    }

    /// Seed a venue-side position, for reconciliation tests.
    pub fn seed_position(&self, position: VenuePosition) {
        self.state
            .lock()
            .positions
            .insert(position.symbol.clone(), position);
    }

    // ── Internals ──────────────────────────────────────────

    fn mark(&self, symbol: &str) -> f64 {
        let state = self.state.lock();
        *state.marks.get(&canonical(symbol)).unwrap_or(&100.0)
    }

    fn require_auth(&self) -> Result<()> {
        if !self.state.lock().authenticated {
            return Err(GatewayError::AuthenticationFailed(
                "mock venue: not authenticated".to_string(),
            ));
        }
        Ok(())
    }

    fn next_order_id(state: &mut MockState) -> String {
        state.order_seq += 1;
        format!("mock-{}", state.order_seq)
    }

    /// Fold a fill into the venue-side position book; reductions credit
    /// realized PnL to the account balance.
    fn apply_fill(state: &mut MockState, symbol: &str, side: OrderSide, quantity: f64, price: f64) {
        let signed = side.sign() * quantity;
        match state.positions.get_mut(symbol) {
            None => {
                state.positions.insert(
                    symbol.to_string(),
                    VenuePosition {
                        symbol: symbol.to_string(),
                        side: PositionSide::from_delta(signed),
                        quantity: quantity.abs(),
                        entry_price: price,
                        mark_price: price,
                        liquidation_price: None,
                        unrealized_pnl: 0.0,
                        realized_pnl: 0.0,
                        margin: quantity.abs() * price,
                        margin_ratio: None,
                        leverage: 1.0,
                        is_isolated: false,
                    },
                );
            }
            Some(pos) => {
                let held = match pos.side {
                    PositionSide::Long => pos.quantity,
                    PositionSide::Short => -pos.quantity,
                };
                let combined = held + signed;
                if held.signum() == signed.signum() {
                    // Same direction: volume-weighted entry.
                    let total = pos.quantity + quantity;
                    pos.entry_price =
                        (pos.entry_price * pos.quantity + price * quantity) / total;
                    pos.quantity = total;
                } else {
                    let reduced = quantity.min(pos.quantity);
                    let pnl = match pos.side {
                        PositionSide::Long => (price - pos.entry_price) * reduced,
                        PositionSide::Short => (pos.entry_price - price) * reduced,
                    };
                    state.realized_pnl += pnl;
                    state.balance += pnl;
                    if combined.abs() < 1e-12 {
                        state.positions.remove(symbol);
                        return;
                    } else if combined.signum() == held.signum() {
                        pos.quantity = combined.abs();
                    } else {
                        // Crossed through zero: flip with the remainder.
                        pos.side = PositionSide::from_delta(combined);
                        pos.quantity = combined.abs();
                        pos.entry_price = price;
                    }
                }
                pos.mark_price = price;
                pos.margin = pos.quantity * pos.entry_price;
            }
        }
    }
}

#[async_trait]
impl VenueConnector for MockConnector {
    fn venue(&self) -> Venue {
        Venue::Mock
    }

    async fn connect(&self) -> Result<()> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<()> {
        // Simulated handshake latency.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut state = self.state.lock();
        state.connected = true;
        state.authenticated = true;
        info!(venue = %self.config.venue, "authenticated with mock venue");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.authenticated = false;
        }
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        self.require_auth()?;
        let delay = self.state.lock().place_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let symbol = canonical(&request.symbol);
        let mark = self.mark(&symbol);
        let mut state = self.state.lock();

        if request.quantity <= 0.0 {
            return Err(GatewayError::InvalidOrder("quantity must be positive".to_string()));
        }
        if request.kind.requires_price() && request.price.is_none() {
            return Err(GatewayError::InvalidOrder(format!(
                "{} order requires a price",
                request.kind.as_str()
            )));
        }

        let reference_price = request.price.unwrap_or(mark);
        let notional = request.quantity * reference_price;
        if !request.reduce_only && notional > state.balance {
            return Err(GatewayError::insufficient_balance(notional, state.balance));
        }

        if request.reduce_only {
            let reduces = state.positions.get(&symbol).map(|pos| {
                matches!(
                    (pos.side, request.side),
                    (PositionSide::Long, OrderSide::Sell) | (PositionSide::Short, OrderSide::Buy)
                )
            });
            if reduces != Some(true) {
                return Err(GatewayError::InvalidOrder(
                    "reduce-only order would not reduce a position".to_string(),
                ));
            }
        }

        let marketable = match request.kind {
            OrderKind::Market => true,
            OrderKind::Limit => match request.side {
                OrderSide::Buy => reference_price >= mark,
                OrderSide::Sell => reference_price <= mark,
            },
            // Triggered kinds rest until their trigger; the mock never
            // fires triggers synchronously.
            _ => false,
        };

        if request.post_only && marketable {
            return Err(GatewayError::Venue(
                "post-only order would cross the book".to_string(),
            ));
        }

        let order_id = Self::next_order_id(&mut state);
        let (status, filled, avg, fee) = if marketable {
            let fill_price = mark;
            let quantity = if request.reduce_only {
                state
                    .positions
                    .get(&symbol)
                    .map(|p| request.quantity.min(p.quantity))
                    .unwrap_or(request.quantity)
            } else {
                request.quantity
            };
            Self::apply_fill(&mut state, &symbol, request.side, quantity, fill_price);
            let fee = quantity * fill_price * TAKER_FEE_RATE;
            state.balance -= fee;
            (OrderStatus::Filled, quantity, Some(fill_price), fee)
        } else if matches!(request.time_in_force, TimeInForce::Ioc | TimeInForce::Fok) {
            (OrderStatus::Canceled, 0.0, None, 0.0)
        } else {
            (OrderStatus::New, 0.0, None, 0.0)
        };

        state.orders.insert(
            order_id.clone(),
            VenueOrder {
                venue_order_id: order_id.clone(),
                client_order_id: request.client_order_id.clone(),
                symbol: symbol.clone(),
                side: request.side,
                kind: request.kind,
                status,
                quantity: request.quantity,
                filled_quantity: filled,
                price: request.price,
                stop_price: request.stop_price,
                average_price: avg,
                fee,
                time_in_force: request.time_in_force,
                created_at: Utc::now(),
            },
        );

        Ok(OrderAck {
            venue_order_id: order_id,
            status,
            filled_quantity: filled,
            average_price: avg,
            fee,
        })
    }

    async fn cancel_order(&self, _symbol: &str, venue_order_id: &str) -> Result<()> {
        self.require_auth()?;
        let mut state = self.state.lock();
        match state.orders.get_mut(venue_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(GatewayError::OrderNotFound(format!(
                "{venue_order_id} already terminal"
            ))),
            None => Err(GatewayError::OrderNotFound(venue_order_id.to_string())),
        }
    }

    /// The mock venue has no native modify: cancel-then-replace with a
    /// fresh venue order id.
    async fn modify_order(
        &self,
        symbol: &str,
        venue_order_id: &str,
        changes: &ModifyRequest,
    ) -> Result<OrderAck> {
        self.require_auth()?;
        let mut state = self.state.lock();
        let existing = match state.orders.get_mut(venue_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                order.clone()
            }
            Some(_) => {
                return Err(GatewayError::OrderNotFound(format!(
                    "{venue_order_id} already terminal"
                )))
            }
            None => return Err(GatewayError::OrderNotFound(venue_order_id.to_string())),
        };

        let new_id = Self::next_order_id(&mut state);
        let replacement = VenueOrder {
            venue_order_id: new_id.clone(),
            quantity: changes.quantity.unwrap_or(existing.quantity),
            price: changes.price.or(existing.price),
            stop_price: changes.stop_price.or(existing.stop_price),
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            fee: 0.0,
            created_at: Utc::now(),
            symbol: canonical(symbol),
            ..existing
        };
        state.orders.insert(new_id.clone(), replacement);

        Ok(OrderAck {
            venue_order_id: new_id,
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            fee: 0.0,
        })
    }

    async fn get_order(&self, _symbol: &str, venue_order_id: &str) -> Result<VenueOrder> {
        self.require_auth()?;
        self.state
            .lock()
            .orders
            .get(venue_order_id)
            .cloned()
            .ok_or_else(|| GatewayError::OrderNotFound(venue_order_id.to_string()))
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<VenueOrder>> {
        self.require_auth()?;
        let state = self.state.lock();
        let mut orders: Vec<VenueOrder> = state
            .orders
            .values()
            .filter(|o| {
                filter
                    .symbol
                    .as_ref()
                    .map(|s| o.symbol == canonical(s))
                    .unwrap_or(true)
                    && filter.status.map(|s| o.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            orders.truncate(limit);
        }
        Ok(orders)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>> {
        let mut orders = self
            .get_orders(&OrderFilter {
                symbol: symbol.map(|s| s.to_string()),
                status: None,
                limit: None,
            })
            .await?;
        orders.retain(|o| !o.status.is_terminal());
        Ok(orders)
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<VenuePosition>> {
        self.require_auth()?;
        let state = self.state.lock();
        let mut positions: Vec<VenuePosition> = state
            .positions
            .values()
            .filter(|p| symbol.map(|s| p.symbol == canonical(s)).unwrap_or(true))
            .cloned()
            .collect();
        // Refresh marks and unrealized PnL at read time.
        for pos in &mut positions {
            let mark = *state.marks.get(&pos.symbol).unwrap_or(&pos.mark_price);
            pos.mark_price = mark;
            pos.unrealized_pnl = match pos.side {
                PositionSide::Long => (mark - pos.entry_price) * pos.quantity,
                PositionSide::Short => (pos.entry_price - mark) * pos.quantity,
            };
        }
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn close_position(&self, symbol: &str, quantity: Option<f64>) -> Result<OrderAck> {
        let positions = self.get_positions(Some(symbol)).await?;
        let position = positions
            .first()
            .ok_or_else(|| GatewayError::PositionNotFound(symbol.to_string()))?;

        let close_qty = quantity.unwrap_or(position.quantity).min(position.quantity);
        let side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let request = PlaceOrderRequest::market(symbol, side, close_qty).reduce_only();
        self.place_order(&request).await
    }

    async fn get_account_info(&self) -> Result<AccountSnapshot> {
        let positions = self.get_positions(None).await?;
        let state = self.state.lock();
        let margin_used: f64 = positions.iter().map(|p| p.margin).sum();
        let unrealized: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
        Ok(AccountSnapshot {
            total_balance: state.balance + unrealized,
            available_balance: (state.balance - margin_used).max(0.0),
            margin_balance: margin_used,
            unrealized_pnl: unrealized,
        })
    }

    async fn get_balance(&self, asset: Option<&str>) -> Result<HashMap<String, f64>> {
        let info = self.get_account_info().await?;
        let asset = asset.unwrap_or("USDC").to_uppercase();
        let mut balances = HashMap::new();
        balances.insert(asset, info.available_balance);
        Ok(balances)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.require_auth()?;
        self.state
            .lock()
            .leverage
            .insert(canonical(symbol), leverage);
        Ok(())
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let symbol = canonical(symbol);
        let mark = self.mark(&symbol);
        let spread = mark * 0.0001;
        let jitter = rand::thread_rng().gen_range(-2.0 * spread..=2.0 * spread);
        Ok(MarketSnapshot {
            symbol,
            last_price: mark + jitter,
            bid_price: Some(mark - spread),
            ask_price: Some(mark + spread),
            mark_price: mark,
            volume_24h: 5_000_000.0,
            high_24h: mark * 1.02,
            low_24h: mark * 0.98,
            open_24h: mark * 0.995,
            funding_rate: Some(0.0001),
            next_funding_time: None,
            open_interest: Some(25_000_000.0),
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let data = self.get_market_data(symbol).await?;
        let bid = data.bid_price.unwrap_or(data.mark_price);
        let ask = data.ask_price.unwrap_or(data.mark_price);
        let tick = data.mark_price * 0.00001;

        let mut rng = rand::thread_rng();
        let mut bids = Vec::with_capacity(depth);
        let mut asks = Vec::with_capacity(depth);
        for i in 0..depth {
            bids.push(BookLevel {
                price: bid - i as f64 * tick,
                quantity: rng.gen_range(0.1..10.0),
            });
            asks.push(BookLevel {
                price: ask + i as f64 * tick,
                quantity: rng.gen_range(0.1..10.0),
            });
        }
        Ok(OrderBookSnapshot {
            symbol: data.symbol,
            bids,
            asks,
            timestamp: Utc::now(),
        })
    }

    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let data = self.get_market_data(symbol).await?;
        let mut rng = rand::thread_rng();
        let count = limit.min(20);
        let mut trades = Vec::with_capacity(count);
        for i in 0..count {
            trades.push(PublicTrade {
                trade_id: format!("mock-t{i}"),
                price: data.mark_price * rng.gen_range(0.999..1.001),
                quantity: rng.gen_range(0.01..5.0),
                side: if rng.gen_bool(0.5) {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                timestamp: Utc::now(),
            });
        }
        Ok(trades)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo> {
        Ok(FundingInfo {
            symbol: canonical(symbol),
            funding_rate: 0.0001,
            next_funding_time: None,
            timestamp: Utc::now(),
        })
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>> {
        self.require_auth()?;
        let (tx, rx) = mpsc::channel(64);

        for channel in channels {
            let tx = tx.clone();
            match channel {
                Channel::Market(symbol) => {
                    let symbol = symbol.clone();
                    let mark = self.mark(&symbol);
                    let handle = tokio::spawn(async move {
                        let mut price = mark;
                        loop {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            price *= 1.0 + rand::random::<f64>() * 0.0002 - 0.0001;
                            let update = StreamUpdate::Market(MarketSnapshot {
                                symbol: symbol.clone(),
                                last_price: price,
                                bid_price: Some(price * 0.9999),
                                ask_price: Some(price * 1.0001),
                                mark_price: price,
                                volume_24h: 5_000_000.0,
                                high_24h: price * 1.02,
                                low_24h: price * 0.98,
                                open_24h: price,
                                funding_rate: Some(0.0001),
                                next_funding_time: None,
                                open_interest: None,
                                timestamp: Utc::now(),
                            });
                            // Bounded channel: block (pause the feed) when
                            // the consumer lags, stop when it is gone.
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                    });
                    self.streams.lock().push(handle);
                }
                Channel::Orders | Channel::Positions => {
                    // Order and position updates are emitted synchronously
                    // by trading calls in the mock; nothing to stream.
                }
            }
        }

        Ok(rx)
    }

    async fn unsubscribe(&self, _channels: &[Channel]) -> Result<()> {
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> MockConnector {
        MockConnector::new(ConnectorConfig {
            venue: Venue::Mock,
            testnet: true,
            rest_url: "mock://local".to_string(),
            ws_url: None,
            requests_per_minute: 600,
            request_timeout: Duration::from_secs(5),
        })
    }

    async fn authed() -> MockConnector {
        let c = connector();
        c.connect().await.unwrap();
        c.authenticate(&Credentials::default()).await.unwrap();
        c
    }

    #[tokio::test]
    async fn test_trading_requires_authentication() {
        let c = connector();
        let err = c
            .place_order(&PlaceOrderRequest::market("BTC-PERP", OrderSide::Buy, 0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let c = authed().await;
        let ack = c
            .place_order(&PlaceOrderRequest::market("ETH-PERP", OrderSide::Sell, 1.5))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, 1.5);
        assert_eq!(ack.average_price, Some(3_000.5));

        let positions = c.get_positions(None).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].quantity, 1.5);
    }

    #[tokio::test]
    async fn test_limit_order_rests_when_not_marketable() {
        let c = authed().await;
        // Mark is 50_500; a 50_000 buy rests.
        let ack = c
            .place_order(&PlaceOrderRequest::limit(
                "BTC-PERP",
                OrderSide::Buy,
                0.1,
                50_000.0,
            ))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(ack.filled_quantity, 0.0);
        assert_eq!(c.get_open_orders(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let c = authed().await;
        c.set_balance(100.0);
        let err = c
            .place_order(&PlaceOrderRequest::limit(
                "BTC-PERP",
                OrderSide::Buy,
                10.0,
                50_000.0,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance(_)));
    }

    #[tokio::test]
    async fn test_modify_is_cancel_replace() {
        let c = authed().await;
        let ack = c
            .place_order(&PlaceOrderRequest::limit(
                "BTC-PERP",
                OrderSide::Buy,
                0.1,
                50_000.0,
            ))
            .await
            .unwrap();

        let new_ack = c
            .modify_order(
                "BTC-PERP",
                &ack.venue_order_id,
                &ModifyRequest {
                    quantity: Some(0.2),
                    price: Some(49_000.0),
                    stop_price: None,
                },
            )
            .await
            .unwrap();
        assert_ne!(new_ack.venue_order_id, ack.venue_order_id);

        let old = c.get_order("BTC-PERP", &ack.venue_order_id).await.unwrap();
        assert_eq!(old.status, OrderStatus::Canceled);
        let new = c
            .get_order("BTC-PERP", &new_ack.venue_order_id)
            .await
            .unwrap();
        assert_eq!(new.quantity, 0.2);
        assert_eq!(new.price, Some(49_000.0));
        assert_eq!(new.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_reduce_only_requires_opposite_position() {
        let c = authed().await;
        let err = c
            .place_order(
                &PlaceOrderRequest::market("BTC-PERP", OrderSide::Sell, 0.1).reduce_only(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn test_close_position_flattens_and_realizes_pnl() {
        let c = authed().await;
        c.place_order(&PlaceOrderRequest::market("SOL-PERP", OrderSide::Buy, 10.0))
            .await
            .unwrap();
        c.set_mark_price("SOL-PERP", 110.0);

        let ack = c.close_position("SOL-PERP", None).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert!(c.get_positions(None).await.unwrap().is_empty());
        // 10 SOL * $10 profit.
        assert!((c.state.lock().realized_pnl - 100.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_post_only_crossing_is_rejected() {
        let c = authed().await;
        let mut req = PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 60_000.0);
        req.post_only = true;
        let err = c.place_order(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::Venue(_)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order() {
        let c = authed().await;
        assert!(matches!(
            c.cancel_order("BTC-PERP", "nope").await.unwrap_err(),
            GatewayError::OrderNotFound(_)
        ));
    }
}
