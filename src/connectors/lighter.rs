//! Lighter Connector
//! REST dialect under `/api/v1`. Markets are addressed by integer market
//! id; the catalog is fetched at connect time. Authentication derives the
//! account address from the binding's EVM key and signs a session token.

use std::collections::HashMap;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::rate_limit::RequestPacer;
use super::symbol::{canonical, MarketIdMap};
use super::{
    AccountSnapshot, BookLevel, Channel, ConnectorConfig, Credentials, FundingInfo,
    MarketSnapshot, ModifyRequest, OrderAck, OrderBookSnapshot, OrderFilter, PlaceOrderRequest,
    PublicTrade, StreamUpdate, VenueConnector, VenueOrder, VenuePosition,
};
use crate::error::{GatewayError, Result};
use crate::models::{OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, Venue};

const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct LighterConnector {
    config: ConnectorConfig,
    http: reqwest::Client,
    address: RwLock<Option<String>>,
    auth_token: RwLock<Option<String>>,
    markets: MarketIdMap,
    pacer: RequestPacer,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl LighterConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            pacer: RequestPacer::new(config.requests_per_minute),
            config,
            http,
            address: RwLock::new(None),
            auth_token: RwLock::new(None),
            markets: MarketIdMap::new(),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn address_or_err(&self) -> Result<String> {
        self.address.read().clone().ok_or_else(|| {
            GatewayError::AuthenticationFailed("lighter: not authenticated".to_string())
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.pacer.acquire().await;
        let url = format!("{}{}", self.config.rest_url, path);
        let mut request = self.http.get(&url).query(query);
        if let Some(token) = self.auth_token.read().clone() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        handle_response(request.send().await?).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.pacer.acquire().await;
        let url = format!("{}{}", self.config.rest_url, path);
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = self.auth_token.read().clone() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        handle_response(request.send().await?).await
    }

    async fn load_markets(&self) -> Result<()> {
        let response = self.get("/api/v1/orderBooks", &[]).await?;
        let books = response["order_books"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for book in &books {
            if let (Some(symbol), Some(id)) = (book["symbol"].as_str(), book["market_id"].as_u64())
            {
                self.markets.insert(&canonical(symbol), id as u32);
            }
        }
        info!(markets = books.len(), "lighter market catalog loaded");
        Ok(())
    }

    /// Wire encoding of time-in-force.
    fn tif_wire(tif: TimeInForce) -> u8 {
        match tif {
            TimeInForce::Gtc | TimeInForce::Gtt => 0,
            TimeInForce::Ioc => 1,
            TimeInForce::Fok => 2,
            TimeInForce::PostOnly => 3,
        }
    }

    fn order_from_value(&self, entry: &Value) -> VenueOrder {
        let market_id = entry["market_id"].as_u64().unwrap_or_default() as u32;
        let symbol = self
            .markets
            .symbol(market_id)
            .unwrap_or_else(|| format!("MARKET-{market_id}-PERP"));
        let raw_status = entry["status"].as_str().unwrap_or_default();
        let status = map_status(raw_status);

        VenueOrder {
            venue_order_id: id_string(&entry["order_id"]),
            client_order_id: entry["client_order_id"].as_str().map(String::from),
            symbol,
            side: if entry["is_bid"].as_bool().unwrap_or(false) {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            kind: if entry["order_type"].as_str() == Some("market") {
                OrderKind::Market
            } else {
                OrderKind::Limit
            },
            status,
            quantity: parse_f64(&entry["initial_size"]).max(parse_f64(&entry["size"])),
            filled_quantity: parse_f64(&entry["filled_size"]),
            price: {
                let px = parse_f64(&entry["price"]);
                (px > 0.0).then_some(px)
            },
            stop_price: None,
            average_price: {
                let px = parse_f64(&entry["avg_fill_price"]);
                (px > 0.0).then_some(px)
            },
            fee: parse_f64(&entry["fee"]),
            time_in_force: TimeInForce::Gtc,
            created_at: Utc
                .timestamp_millis_opt(entry["created_at"].as_i64().unwrap_or_default())
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl VenueConnector for LighterConnector {
    fn venue(&self) -> Venue {
        Venue::Lighter
    }

    async fn connect(&self) -> Result<()> {
        if self.markets.is_empty() {
            self.load_markets().await?;
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let key = credentials.private_key.as_deref().ok_or_else(|| {
            GatewayError::AuthenticationFailed("lighter requires a private key".to_string())
        })?;
        let key = key.strip_prefix("0x").unwrap_or(key);
        let signer: PrivateKeySigner = key.parse().map_err(|_| {
            GatewayError::AuthenticationFailed("invalid private key".to_string())
        })?;
        let address = format!("{:#x}", signer.address());

        // Session token: address, issue time and signature over both.
        let issued_at = Utc::now().timestamp();
        let message = format!("lighter-auth:{address}:{issued_at}");
        let signature = signer
            .sign_message_sync(message.as_bytes())
            .map_err(|e| GatewayError::AuthenticationFailed(format!("signing failed: {e}")))?;
        let token = format!(
            "{address}:{issued_at}:0x{}",
            hex::encode(signature.as_bytes())
        );

        *self.address.write() = Some(address.clone());
        *self.auth_token.write() = Some(token);

        self.connect().await?;
        // Probe the account; a missing account is still a valid key.
        let probe = self
            .get(
                "/api/v1/account",
                &[("by", "address".to_string()), ("value", address.clone())],
            )
            .await;
        match probe {
            Ok(_) => info!(address = %address, "authenticated with lighter"),
            Err(GatewayError::Venue(msg)) if msg.contains("404") => {
                info!(address = %address, "authenticated with lighter (new account)");
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.address.write() = None;
        *self.auth_token.write() = None;
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        self.address_or_err()?;
        let market_id = self.markets.market_id(&request.symbol)?;

        let body = match request.kind {
            OrderKind::Market => json!({
                "market_id": market_id,
                "order_type": "market",
                "is_bid": request.side == OrderSide::Buy,
                "size": request.quantity,
                "reduce_only": request.reduce_only,
                "slippage_tolerance": 0.02,
            }),
            OrderKind::Limit => json!({
                "market_id": market_id,
                "order_type": "limit",
                "is_bid": request.side == OrderSide::Buy,
                "size": request.quantity,
                "price": request.price,
                "time_in_force": Self::tif_wire(request.time_in_force),
                "post_only": request.post_only,
                "reduce_only": request.reduce_only,
            }),
            OrderKind::Stop | OrderKind::StopLimit => json!({
                "market_id": market_id,
                "order_type": "stop_loss",
                "is_bid": request.side == OrderSide::Buy,
                "size": request.quantity,
                "trigger_price": request.stop_price,
                "limit_price": request.price,
            }),
            OrderKind::TakeProfit | OrderKind::TakeProfitLimit => json!({
                "market_id": market_id,
                "order_type": "take_profit",
                "is_bid": request.side == OrderSide::Buy,
                "size": request.quantity,
                "trigger_price": request.stop_price,
                "limit_price": request.price,
            }),
        };

        let response = self.post("/api/v1/sendTx", body).await.map_err(|e| match e {
            GatewayError::Venue(msg) if msg.to_lowercase().contains("margin") => {
                GatewayError::InsufficientBalance(msg)
            }
            other => other,
        })?;

        let order_id = id_string(&response["order_id"]);
        let order_id = if order_id.is_empty() {
            id_string(&response["tx_hash"])
        } else {
            order_id
        };
        if order_id.is_empty() {
            return Err(GatewayError::Venue("sendTx returned no order id".to_string()));
        }

        Ok(OrderAck {
            venue_order_id: order_id,
            status: map_status(response["status"].as_str().unwrap_or("open")),
            filled_quantity: parse_f64(&response["filled_size"]),
            average_price: {
                let px = parse_f64(&response["avg_fill_price"]);
                (px > 0.0).then_some(px)
            },
            fee: parse_f64(&response["fee"]),
        })
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<()> {
        self.address_or_err()?;
        let market_id = self.markets.market_id(symbol)?;
        let result = self
            .post(
                "/api/v1/cancelOrder",
                json!({"market_id": market_id, "order_id": venue_order_id}),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(GatewayError::Venue(msg))
                if msg.to_lowercase().contains("not found") || msg.contains("404") =>
            {
                Err(GatewayError::OrderNotFound(venue_order_id.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    /// No native modify; cancel-then-replace with the new order id.
    async fn modify_order(
        &self,
        symbol: &str,
        venue_order_id: &str,
        changes: &ModifyRequest,
    ) -> Result<OrderAck> {
        let current = self.get_order(symbol, venue_order_id).await?;
        self.cancel_order(symbol, venue_order_id).await?;

        let request = PlaceOrderRequest {
            symbol: current.symbol.clone(),
            side: current.side,
            kind: current.kind,
            quantity: changes.quantity.unwrap_or(current.quantity),
            price: changes.price.or(current.price),
            stop_price: changes.stop_price.or(current.stop_price),
            time_in_force: current.time_in_force,
            reduce_only: false,
            post_only: false,
            is_isolated: false,
            leverage: None,
            client_order_id: current.client_order_id.clone(),
        };
        self.place_order(&request).await
    }

    async fn get_order(&self, symbol: &str, venue_order_id: &str) -> Result<VenueOrder> {
        let orders = self.get_open_orders(Some(symbol)).await?;
        orders
            .into_iter()
            .find(|o| o.venue_order_id == venue_order_id)
            .ok_or_else(|| GatewayError::OrderNotFound(venue_order_id.to_string()))
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<VenueOrder>> {
        let address = self.address_or_err()?;
        let mut query = vec![("account", address)];
        let market_query;
        if let Some(symbol) = &filter.symbol {
            market_query = self.markets.market_id(symbol)?.to_string();
            query.push(("market_id", market_query));
        }

        let response = self.get("/api/v1/accountOrders", &query).await?;
        let mut orders: Vec<VenueOrder> = response["orders"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|entry| self.order_from_value(entry))
            .collect();

        if let Some(status) = filter.status {
            orders.retain(|o| o.status == status);
        }
        if let Some(limit) = filter.limit {
            orders.truncate(limit);
        }
        Ok(orders)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>> {
        let mut orders = self
            .get_orders(&OrderFilter {
                symbol: symbol.map(String::from),
                status: None,
                limit: None,
            })
            .await?;
        orders.retain(|o| !o.status.is_terminal());
        Ok(orders)
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<VenuePosition>> {
        let address = self.address_or_err()?;
        let response = self
            .get(
                "/api/v1/account",
                &[("by", "address".to_string()), ("value", address)],
            )
            .await?;

        let mut positions = Vec::new();
        for entry in response["positions"].as_array().cloned().unwrap_or_default() {
            let size = parse_f64(&entry["position"]);
            if size.abs() < 1e-12 {
                continue;
            }
            let market_id = entry["market_id"].as_u64().unwrap_or_default() as u32;
            let market_symbol = self
                .markets
                .symbol(market_id)
                .unwrap_or_else(|| format!("MARKET-{market_id}-PERP"));
            if let Some(want) = symbol {
                if market_symbol != canonical(want) {
                    continue;
                }
            }
            positions.push(VenuePosition {
                symbol: market_symbol,
                side: PositionSide::from_delta(size),
                quantity: size.abs(),
                entry_price: parse_f64(&entry["avg_entry_price"]),
                mark_price: parse_f64(&entry["mark_price"]),
                liquidation_price: {
                    let px = parse_f64(&entry["liquidation_price"]);
                    (px > 0.0).then_some(px)
                },
                unrealized_pnl: parse_f64(&entry["unrealized_pnl"]),
                realized_pnl: parse_f64(&entry["realized_pnl"]),
                margin: parse_f64(&entry["allocated_margin"]),
                margin_ratio: None,
                leverage: parse_f64(&entry["leverage"]).max(1.0),
                is_isolated: entry["margin_mode"].as_str() == Some("isolated"),
            });
        }
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
        self.place_order(&PlaceOrderRequest::market(symbol, side, close_qty).reduce_only())
            .await
    }

    async fn get_account_info(&self) -> Result<AccountSnapshot> {
        let address = self.address_or_err()?;
        let response = self
            .get(
                "/api/v1/account",
                &[("by", "address".to_string()), ("value", address)],
            )
            .await?;

        let unrealized: f64 = response["positions"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|p| parse_f64(&p["unrealized_pnl"]))
            .sum();

        Ok(AccountSnapshot {
            total_balance: parse_f64(&response["collateral"]),
            available_balance: parse_f64(&response["available_balance"]),
            margin_balance: parse_f64(&response["total_allocated_margin"]),
            unrealized_pnl: unrealized,
        })
    }

    async fn get_balance(&self, asset: Option<&str>) -> Result<HashMap<String, f64>> {
        let info = self.get_account_info().await?;
        let mut balances = HashMap::new();
        balances.insert(
            asset.unwrap_or("USDC").to_uppercase(),
            info.available_balance,
        );
        Ok(balances)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let market_id = self.markets.market_id(symbol)?;
        self.post(
            "/api/v1/updateLeverage",
            json!({"market_id": market_id, "leverage": leverage}),
        )
        .await?;
        Ok(())
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let market_id = self.markets.market_id(symbol)?;
        let response = self
            .get(
                "/api/v1/orderBookDetails",
                &[("market_id", market_id.to_string())],
            )
            .await?;
        let details = &response["order_book_details"];

        Ok(MarketSnapshot {
            symbol: canonical(symbol),
            last_price: parse_f64(&details["last_trade_price"]),
            bid_price: {
                let px = parse_f64(&details["best_bid"]);
                (px > 0.0).then_some(px)
            },
            ask_price: {
                let px = parse_f64(&details["best_ask"]);
                (px > 0.0).then_some(px)
            },
            mark_price: parse_f64(&details["mark_price"]),
            volume_24h: parse_f64(&details["daily_quote_token_volume"]),
            high_24h: parse_f64(&details["daily_high"]),
            low_24h: parse_f64(&details["daily_low"]),
            open_24h: parse_f64(&details["daily_open"]),
            funding_rate: Some(parse_f64(&details["funding_rate"])),
            next_funding_time: None,
            open_interest: Some(parse_f64(&details["open_interest"])),
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let market_id = self.markets.market_id(symbol)?;
        let response = self
            .get(
                "/api/v1/orderBookOrders",
                &[
                    ("market_id", market_id.to_string()),
                    ("limit", depth.to_string()),
                ],
            )
            .await?;

        let parse_side = |key: &str| -> Vec<BookLevel> {
            response[key]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .take(depth)
                .map(|level| BookLevel {
                    price: parse_f64(&level["price"]),
                    quantity: parse_f64(&level["size"]),
                })
                .collect()
        };

        Ok(OrderBookSnapshot {
            symbol: canonical(symbol),
            bids: parse_side("bids"),
            asks: parse_side("asks"),
            timestamp: Utc::now(),
        })
    }

    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let market_id = self.markets.market_id(symbol)?;
        let response = self
            .get(
                "/api/v1/recentTrades",
                &[
                    ("market_id", market_id.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        Ok(response["trades"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .take(limit)
            .map(|trade| PublicTrade {
                trade_id: id_string(&trade["trade_id"]),
                price: parse_f64(&trade["price"]),
                quantity: parse_f64(&trade["size"]),
                side: if trade["is_maker_ask"].as_bool().unwrap_or(false) {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                timestamp: Utc
                    .timestamp_millis_opt(trade["timestamp"].as_i64().unwrap_or_default())
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo> {
        let data = self.get_market_data(symbol).await?;
        Ok(FundingInfo {
            symbol: data.symbol,
            funding_rate: data.funding_rate.unwrap_or(0.0),
            next_funding_time: None,
            timestamp: data.timestamp,
        })
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>> {
        let address = self.address_or_err()?;
        let (tx, rx) = mpsc::channel(128);

        // Polling transport, same shape as the REST surface.
        for channel in channels {
            if !matches!(channel, Channel::Positions) {
                warn!(channel = %channel.as_str(), "lighter stream supports positions only");
                continue;
            }
            let tx = tx.clone();
            let http = self.http.clone();
            let base = self.config.rest_url.clone();
            let address = address.clone();

            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                    let url = format!("{base}/api/v1/account");
                    let response = http
                        .get(&url)
                        .query(&[("by", "address"), ("value", address.as_str())])
                        .send()
                        .await;
                    let Ok(response) = response else { continue };
                    let Ok(payload) = response.json::<Value>().await else {
                        continue;
                    };
                    for entry in payload["positions"].as_array().cloned().unwrap_or_default() {
                        let size = parse_f64(&entry["position"]);
                        if size.abs() < 1e-12 {
                            continue;
                        }
                        let update = StreamUpdate::Position(VenuePosition {
                            symbol: canonical(
                                entry["symbol"].as_str().unwrap_or("UNKNOWN"),
                            ),
                            side: PositionSide::from_delta(size),
                            quantity: size.abs(),
                            entry_price: parse_f64(&entry["avg_entry_price"]),
                            mark_price: parse_f64(&entry["mark_price"]),
                            liquidation_price: None,
                            unrealized_pnl: parse_f64(&entry["unrealized_pnl"]),
                            realized_pnl: parse_f64(&entry["realized_pnl"]),
                            margin: parse_f64(&entry["allocated_margin"]),
                            margin_ratio: None,
                            leverage: 1.0,
                            is_isolated: false,
                        });
                        if tx.send(update).await.is_err() {
                            return;
                        }
                    }
                }
            });
            self.streams.lock().push(handle);
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

async fn handle_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(GatewayError::RateLimited {
            retry_after_secs: 1,
        });
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(GatewayError::Venue(format!("HTTP {status}: {text}")));
    }
    Ok(response.json().await?)
}

fn map_status(raw: &str) -> OrderStatus {
    match OrderStatus::from_str(raw) {
        Some(status) => status,
        None => match raw.to_lowercase().as_str() {
            "in-progress" | "pending" => OrderStatus::New,
            other => {
                warn!(status = other, "unknown lighter order status, assuming NEW");
                OrderStatus::New
            }
        },
    }
}

fn parse_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}
