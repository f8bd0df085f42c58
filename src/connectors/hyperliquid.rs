//! Hyperliquid Connector
//! REST dialect: read-only queries POST to `/info`, signed actions POST to
//! `/exchange`. Actions are signed with the binding's EVM key (EIP-712,
//! `HyperliquidTransaction { action, nonce }`). Canonical `BASE-PERP`
//! symbols map to bare coin names and integer asset indices from `meta`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::{Eip712Domain, SolStruct};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::rate_limit::RequestPacer;
use super::symbol::{base_asset, canonical, MarketIdMap, SymbolMap};
use super::{
    AccountSnapshot, BookLevel, Channel, ConnectorConfig, Credentials, FundingInfo,
    MarketSnapshot, ModifyRequest, OrderAck, OrderBookSnapshot, OrderFilter, PlaceOrderRequest,
    PublicTrade, StreamUpdate, VenueConnector, VenueOrder, VenuePosition,
};
use crate::error::{GatewayError, Result};
use crate::models::{OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, Venue};

const MARKET_SLIPPAGE: f64 = 0.005;
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(2);

alloy::sol! {
    struct HyperliquidTransaction {
        string action;
        uint64 nonce;
    }
}

pub struct HyperliquidConnector {
    config: ConnectorConfig,
    http: reqwest::Client,
    signer: RwLock<Option<PrivateKeySigner>>,
    address: RwLock<Option<String>>,
    vault_address: RwLock<Option<String>>,
    assets: Arc<MarketIdMap>,
    symbols: Arc<SymbolMap>,
    pacer: RequestPacer,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl HyperliquidConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            pacer: RequestPacer::new(config.requests_per_minute),
            config,
            http,
            signer: RwLock::new(None),
            address: RwLock::new(None),
            vault_address: RwLock::new(None),
            assets: Arc::new(MarketIdMap::new()),
            symbols: Arc::new(SymbolMap::new()),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn user_address(&self) -> Result<String> {
        self.address.read().clone().ok_or_else(|| {
            GatewayError::AuthenticationFailed("hyperliquid: not authenticated".to_string())
        })
    }

    async fn info(&self, body: Value) -> Result<Value> {
        self.pacer.acquire().await;
        post_json(&self.http, &format!("{}/info", self.config.rest_url), &body).await
    }

    async fn exchange(&self, action: Value) -> Result<Value> {
        self.pacer.acquire().await;
        let nonce = Utc::now().timestamp_millis() as u64;
        let signature = self.sign_action(&action, nonce)?;

        let mut body = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
        });
        if let Some(vault) = self.vault_address.read().clone() {
            body["vaultAddress"] = Value::String(vault);
        }

        post_json(
            &self.http,
            &format!("{}/exchange", self.config.rest_url),
            &body,
        )
        .await
    }

    fn sign_action(&self, action: &Value, nonce: u64) -> Result<String> {
        let guard = self.signer.read();
        let signer = guard.as_ref().ok_or_else(|| {
            GatewayError::AuthenticationFailed("hyperliquid: not authenticated".to_string())
        })?;

        let payload = HyperliquidTransaction {
            action: serde_json::to_string(action)?,
            nonce,
        };
        let chain_id: u64 = if self.config.testnet { 421_614 } else { 42_161 };
        let domain = Eip712Domain {
            name: Some("HyperliquidSignTransaction".into()),
            version: Some("1".into()),
            chain_id: Some(U256::from(chain_id)),
            verifying_contract: None,
            salt: None,
        };
        let hash = payload.eip712_signing_hash(&domain);
        let signature = signer
            .sign_hash_sync(&hash)
            .map_err(|e| GatewayError::Internal(format!("action signing failed: {e}")))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }

    async fn load_meta(&self) -> Result<()> {
        let meta = self.info(json!({"type": "meta"})).await?;
        let universe = meta["universe"]
            .as_array()
            .ok_or_else(|| GatewayError::Venue("meta response missing universe".to_string()))?;

        for (index, asset) in universe.iter().enumerate() {
            if let Some(coin) = asset["name"].as_str() {
                let symbol = canonical(coin);
                self.assets.insert(&symbol, index as u32);
                self.symbols.insert(&symbol, coin);
            }
        }
        info!(assets = universe.len(), "hyperliquid symbol catalog loaded");
        Ok(())
    }

    fn tif_wire(tif: TimeInForce) -> &'static str {
        match tif {
            TimeInForce::Ioc | TimeInForce::Fok => "Ioc",
            TimeInForce::PostOnly => "Alo",
            // GTT has no native flavor here; the executor expires it.
            TimeInForce::Gtc | TimeInForce::Gtt => "Gtc",
        }
    }

    /// Build the wire order object for one request.
    async fn build_wire_order(&self, request: &PlaceOrderRequest) -> Result<Value> {
        let symbol = canonical(&request.symbol);
        let asset = self.assets.market_id(&symbol)?;
        let is_buy = request.side == OrderSide::Buy;

        let order_type = match request.kind {
            OrderKind::Limit => json!({"limit": {"tif": Self::tif_wire(request.time_in_force)}}),
            OrderKind::Market => json!({"limit": {"tif": "Ioc"}}),
            OrderKind::Stop | OrderKind::StopLimit => json!({
                "trigger": {
                    "isMarket": request.kind == OrderKind::Stop,
                    "triggerPx": format_price(request.stop_price.unwrap_or_default()),
                    "tpsl": "sl",
                }
            }),
            OrderKind::TakeProfit | OrderKind::TakeProfitLimit => json!({
                "trigger": {
                    "isMarket": request.kind == OrderKind::TakeProfit,
                    "triggerPx": format_price(request.stop_price.unwrap_or_default()),
                    "tpsl": "tp",
                }
            }),
        };

        // Market orders go out as aggressive IOC limits around the mid.
        let price = match (request.kind, request.price) {
            (_, Some(price)) => price,
            (OrderKind::Market, None) => {
                let mid = self.mid_price(&symbol).await?;
                if is_buy {
                    mid * (1.0 + MARKET_SLIPPAGE)
                } else {
                    mid * (1.0 - MARKET_SLIPPAGE)
                }
            }
            _ => 0.0,
        };

        Ok(json!({
            "a": asset,
            "b": is_buy,
            "p": format_price(price),
            "s": format_size(request.quantity),
            "r": request.reduce_only,
            "t": order_type,
        }))
    }

    async fn mid_price(&self, symbol: &str) -> Result<f64> {
        let mids = self.info(json!({"type": "allMids"})).await?;
        let coin = base_asset(symbol);
        mids[coin.as_str()]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GatewayError::Venue(format!("no mid price for '{symbol}'")))
    }

    fn parse_place_response(&self, response: &Value) -> Result<OrderAck> {
        if response["status"].as_str() != Some("ok") {
            let error = response["response"]["error"]
                .as_str()
                .unwrap_or("unknown exchange error");
            return Err(classify_exchange_error(error));
        }

        let statuses = response["response"]["data"]["statuses"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let first = statuses.first().cloned().unwrap_or(Value::Null);

        if let Some(resting) = first.get("resting") {
            return Ok(OrderAck {
                venue_order_id: oid_string(&resting["oid"]),
                status: OrderStatus::New,
                filled_quantity: 0.0,
                average_price: None,
                fee: 0.0,
            });
        }
        if let Some(filled) = first.get("filled") {
            let qty = parse_f64(&filled["totalSz"]);
            let avg = parse_f64(&filled["avgPx"]);
            return Ok(OrderAck {
                venue_order_id: oid_string(&filled["oid"]),
                status: OrderStatus::Filled,
                filled_quantity: qty,
                average_price: (avg > 0.0).then_some(avg),
                fee: 0.0,
            });
        }
        if let Some(error) = first.get("error").and_then(Value::as_str) {
            return Err(classify_exchange_error(error));
        }

        warn!(?first, "hyperliquid ack had no recognizable status, assuming NEW");
        Ok(OrderAck {
            venue_order_id: format!("hl-{}", Utc::now().timestamp_millis()),
            status: OrderStatus::New,
            filled_quantity: 0.0,
            average_price: None,
            fee: 0.0,
        })
    }
}

#[async_trait]
impl VenueConnector for HyperliquidConnector {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
    }

    async fn connect(&self) -> Result<()> {
        if self.assets.is_empty() {
            self.load_meta().await?;
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let key = credentials.private_key.as_deref().ok_or_else(|| {
            GatewayError::AuthenticationFailed(
                "hyperliquid requires a private key".to_string(),
            )
        })?;
        let key = key.strip_prefix("0x").unwrap_or(key);
        let signer: PrivateKeySigner = key.parse().map_err(|_| {
            GatewayError::AuthenticationFailed("invalid private key".to_string())
        })?;

        let address = format!("{:#x}", signer.address());
        *self.signer.write() = Some(signer);
        *self.address.write() = Some(address.clone());
        *self.vault_address.write() = credentials
            .vault
            .map(|v| v.to_string())
            .or_else(|| credentials.wallet_address.clone());

        self.connect().await?;
        // Probe: a bad key surfaces here rather than on first dispatch.
        self.info(json!({"type": "clearinghouseState", "user": address.clone()}))
            .await?;
        info!(address = %address, "authenticated with hyperliquid");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.signer.write() = None;
        *self.address.write() = None;
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        let wire = self.build_wire_order(request).await?;
        let response = self
            .exchange(json!({"type": "order", "orders": [wire], "grouping": "na"}))
            .await?;
        self.parse_place_response(&response)
    }

    async fn cancel_order(&self, symbol: &str, venue_order_id: &str) -> Result<()> {
        let asset = self.assets.market_id(symbol)?;
        let oid: u64 = venue_order_id.parse().map_err(|_| {
            GatewayError::OrderNotFound(format!("malformed order id '{venue_order_id}'"))
        })?;

        let response = self
            .exchange(json!({"type": "cancel", "cancels": [{"a": asset, "o": oid}]}))
            .await?;

        if response["status"].as_str() == Some("ok") {
            let status = &response["response"]["data"]["statuses"][0];
            if let Some(error) = status.get("error").and_then(Value::as_str) {
                if error.to_lowercase().contains("not found")
                    || error.to_lowercase().contains("unknown")
                {
                    return Err(GatewayError::OrderNotFound(venue_order_id.to_string()));
                }
                return Err(GatewayError::Venue(error.to_string()));
            }
            return Ok(());
        }
        let error = response["response"]["error"].as_str().unwrap_or("cancel failed");
        if error.to_lowercase().contains("not found") {
            return Err(GatewayError::OrderNotFound(venue_order_id.to_string()));
        }
        Err(GatewayError::Venue(error.to_string()))
    }

    /// Hyperliquid has no in-place modify: cancel, then place the changed
    /// order, returning the replacement oid.
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
        let user = self.user_address()?;
        let response = self
            .info(json!({"type": "openOrders", "user": user}))
            .await?;

        let mut orders = Vec::new();
        for entry in response.as_array().cloned().unwrap_or_default() {
            let coin = entry["coin"].as_str().unwrap_or_default();
            let symbol = self.symbols.canonical_for(coin);
            if let Some(want) = &filter.symbol {
                if symbol != canonical(want) {
                    continue;
                }
            }

            let orig_size = parse_f64(&entry["origSz"]);
            let remaining = parse_f64(&entry["sz"]);
            let quantity = if orig_size > 0.0 { orig_size } else { remaining };
            let filled = (quantity - remaining).max(0.0);
            let status = if filled > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::New
            };
            if let Some(want) = filter.status {
                if status != want {
                    continue;
                }
            }

            orders.push(VenueOrder {
                venue_order_id: oid_string(&entry["oid"]),
                client_order_id: entry["cloid"].as_str().map(String::from),
                symbol,
                side: if entry["side"].as_str() == Some("B") {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                kind: OrderKind::Limit,
                status,
                quantity,
                filled_quantity: filled,
                price: Some(parse_f64(&entry["limitPx"])),
                stop_price: None,
                average_price: None,
                fee: 0.0,
                time_in_force: TimeInForce::Gtc,
                created_at: ms_to_datetime(entry["timestamp"].as_i64().unwrap_or_default()),
            });
        }

        if let Some(limit) = filter.limit {
            orders.truncate(limit);
        }
        Ok(orders)
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<VenueOrder>> {
        self.get_orders(&OrderFilter {
            symbol: symbol.map(String::from),
            status: None,
            limit: None,
        })
        .await
    }

    async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<VenuePosition>> {
        let user = self.user_address()?;
        let response = self
            .info(json!({"type": "clearinghouseState", "user": user}))
            .await?;
        let positions = parse_clearinghouse_positions(&response, &self.symbols);
        Ok(match symbol {
            Some(s) => {
                let want = canonical(s);
                positions.into_iter().filter(|p| p.symbol == want).collect()
            }
            None => positions,
        })
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
        let user = self.user_address()?;
        let response = self
            .info(json!({"type": "clearinghouseState", "user": user}))
            .await?;

        let summary = &response["marginSummary"];
        let total = parse_f64(&summary["accountValue"]);
        let margin_used = parse_f64(&summary["totalMarginUsed"]);
        let withdrawable = parse_f64(&response["withdrawable"]);
        let unrealized: f64 = parse_clearinghouse_positions(&response, &self.symbols)
            .iter()
            .map(|p| p.unrealized_pnl)
            .sum();

        Ok(AccountSnapshot {
            total_balance: total,
            available_balance: withdrawable,
            margin_balance: margin_used,
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
        let asset = self.assets.market_id(symbol)?;
        let response = self
            .exchange(json!({
                "type": "updateLeverage",
                "asset": asset,
                "isCross": true,
                "leverage": leverage,
            }))
            .await?;
        if response["status"].as_str() == Some("ok") {
            Ok(())
        } else {
            let error = response["response"]["error"]
                .as_str()
                .unwrap_or("updateLeverage failed");
            Err(GatewayError::Venue(error.to_string()))
        }
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let symbol = canonical(symbol);
        let coin = base_asset(&symbol);
        let response = self.info(json!({"type": "metaAndAssetCtxs"})).await?;

        let universe = response[0]["universe"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let ctxs = response[1].as_array().cloned().unwrap_or_default();

        let index = universe
            .iter()
            .position(|asset| asset["name"].as_str() == Some(coin.as_str()))
            .ok_or_else(|| GatewayError::ValidationFailed(format!("unknown symbol '{symbol}'")))?;
        let ctx = ctxs.get(index).cloned().unwrap_or(Value::Null);

        let mark = parse_f64(&ctx["markPx"]);
        let mid = parse_f64(&ctx["midPx"]);
        let prev_day = parse_f64(&ctx["prevDayPx"]);
        Ok(MarketSnapshot {
            symbol,
            last_price: if mid > 0.0 { mid } else { mark },
            bid_price: None,
            ask_price: None,
            mark_price: mark,
            volume_24h: parse_f64(&ctx["dayNtlVlm"]),
            high_24h: 0.0,
            low_24h: 0.0,
            open_24h: prev_day,
            funding_rate: Some(parse_f64(&ctx["funding"])),
            next_funding_time: None,
            open_interest: Some(parse_f64(&ctx["openInterest"])),
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let coin = base_asset(symbol);
        let response = self.info(json!({"type": "l2Book", "coin": coin})).await?;

        let levels = response["levels"].as_array().cloned().unwrap_or_default();
        let parse_side = |side: Option<&Value>| -> Vec<BookLevel> {
            side.and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .take(depth)
                        .map(|level| BookLevel {
                            price: parse_f64(&level["px"]),
                            quantity: parse_f64(&level["sz"]),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBookSnapshot {
            symbol: canonical(symbol),
            bids: parse_side(levels.first()),
            asks: parse_side(levels.get(1)),
            timestamp: Utc::now(),
        })
    }

    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let coin = base_asset(symbol);
        let response = self
            .info(json!({"type": "recentTrades", "coin": coin}))
            .await?;

        Ok(response
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(limit)
            .map(|trade| PublicTrade {
                trade_id: oid_string(&trade["tid"]),
                price: parse_f64(&trade["px"]),
                quantity: parse_f64(&trade["sz"]),
                side: if trade["side"].as_str() == Some("B") {
                    OrderSide::Buy
                } else {
                    OrderSide::Sell
                },
                timestamp: ms_to_datetime(trade["time"].as_i64().unwrap_or_default()),
            })
            .collect())
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingInfo> {
        let data = self.get_market_data(symbol).await?;
        Ok(FundingInfo {
            symbol: data.symbol,
            funding_rate: data.funding_rate.unwrap_or(0.0),
            next_funding_time: data.next_funding_time,
            timestamp: data.timestamp,
        })
    }

    /// Streaming is served by polling the REST surface; the WS dialect is
    /// not part of this connector. A bounded channel applies backpressure.
    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>> {
        let user = self.user_address()?;
        let (tx, rx) = mpsc::channel(128);

        for channel in channels {
            let tx = tx.clone();
            let http = self.http.clone();
            let base = self.config.rest_url.clone();
            let symbols = Arc::clone(&self.symbols);
            let channel = channel.clone();
            let user = user.clone();

            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                    let update = match &channel {
                        Channel::Positions => {
                            let body = json!({"type": "clearinghouseState", "user": user});
                            match post_json(&http, &format!("{base}/info"), &body).await {
                                Ok(state) => parse_clearinghouse_positions(&state, &symbols)
                                    .into_iter()
                                    .map(StreamUpdate::Position)
                                    .collect::<Vec<_>>(),
                                Err(_) => Vec::new(),
                            }
                        }
                        Channel::Market(symbol) => {
                            let coin = base_asset(symbol);
                            let body = json!({"type": "allMids"});
                            match post_json(&http, &format!("{base}/info"), &body).await {
                                Ok(mids) => {
                                    let mid = mids[coin.as_str()]
                                        .as_str()
                                        .and_then(|s| s.parse::<f64>().ok())
                                        .unwrap_or(0.0);
                                    if mid > 0.0 {
                                        vec![StreamUpdate::Market(MarketSnapshot {
                                            symbol: symbol.clone(),
                                            last_price: mid,
                                            bid_price: None,
                                            ask_price: None,
                                            mark_price: mid,
                                            volume_24h: 0.0,
                                            high_24h: 0.0,
                                            low_24h: 0.0,
                                            open_24h: 0.0,
                                            funding_rate: None,
                                            next_funding_time: None,
                                            open_interest: None,
                                            timestamp: Utc::now(),
                                        })]
                                    } else {
                                        Vec::new()
                                    }
                                }
                                Err(_) => Vec::new(),
                            }
                        }
                        Channel::Orders => Vec::new(),
                    };

                    for item in update {
                        if tx.send(item).await.is_err() {
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

async fn post_json(http: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let response = http.post(url).json(body).send().await?;
    let status = response.status();

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        return Err(GatewayError::RateLimited {
            retry_after_secs: retry_after,
        });
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(GatewayError::Venue(format!("HTTP {status}: {text}")));
    }
    Ok(response.json().await?)
}

fn classify_exchange_error(error: &str) -> GatewayError {
    let lower = error.to_lowercase();
    if lower.contains("margin") || lower.contains("insufficient") {
        GatewayError::InsufficientBalance(error.to_string())
    } else if lower.contains("invalid") || lower.contains("tick") || lower.contains("size") {
        GatewayError::InvalidOrder(error.to_string())
    } else {
        GatewayError::Venue(error.to_string())
    }
}

fn parse_clearinghouse_positions(state: &Value, symbols: &SymbolMap) -> Vec<VenuePosition> {
    let mut positions = Vec::new();
    for entry in state["assetPositions"].as_array().cloned().unwrap_or_default() {
        let info = &entry["position"];
        let size = parse_f64(&info["szi"]);
        if size.abs() < 1e-12 {
            continue;
        }
        let coin = info["coin"].as_str().unwrap_or_default();
        let leverage = info["leverage"]["value"].as_f64().unwrap_or(1.0);
        positions.push(VenuePosition {
            symbol: symbols.canonical_for(coin),
            side: PositionSide::from_delta(size),
            quantity: size.abs(),
            entry_price: parse_f64(&info["entryPx"]),
            mark_price: parse_f64(&info["markPx"]),
            liquidation_price: {
                let px = parse_f64(&info["liquidationPx"]);
                (px > 0.0).then_some(px)
            },
            unrealized_pnl: parse_f64(&info["unrealizedPnl"]),
            realized_pnl: parse_f64(&info["realizedPnl"]),
            margin: parse_f64(&info["marginUsed"]),
            margin_ratio: None,
            leverage,
            is_isolated: info["leverage"]["type"].as_str() == Some("isolated"),
        });
    }
    positions
}

/// Venue numbers arrive as strings or raw JSON numbers.
fn parse_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn oid_string(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Prices are quoted to 5 significant figures.
fn format_price(price: f64) -> String {
    if price == 0.0 {
        return "0".to_string();
    }
    let magnitude = price.abs().log10().floor() as i32;
    let decimals = (4 - magnitude).max(0) as usize;
    format!("{price:.decimals$}")
}

fn format_size(size: f64) -> String {
    let formatted = format!("{size:.6}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_formatting_five_sig_figs() {
        assert_eq!(format_price(50_000.0), "50000");
        assert_eq!(format_price(3_000.5), "3000.5");
        assert_eq!(format_price(0.123456), "0.1235");
        assert_eq!(format_price(0.0), "0");
    }

    #[test]
    fn test_size_formatting_trims_zeroes() {
        assert_eq!(format_size(1.5), "1.5");
        assert_eq!(format_size(0.100000), "0.1");
        assert_eq!(format_size(10.0), "10");
    }

    #[test]
    fn test_clearinghouse_positions_parse_and_skip_flat() {
        let symbols = SymbolMap::new();
        symbols.insert("BTC-PERP", "BTC");
        let state = json!({
            "assetPositions": [
                {"position": {"coin": "BTC", "szi": "-0.5", "entryPx": "50000",
                              "markPx": "49000", "unrealizedPnl": "500",
                              "marginUsed": "2500", "liquidationPx": "60000",
                              "leverage": {"type": "cross", "value": 10}}},
                {"position": {"coin": "ETH", "szi": "0"}},
            ]
        });
        let positions = parse_clearinghouse_positions(&state, &symbols);
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.symbol, "BTC-PERP");
        assert_eq!(p.side, PositionSide::Short);
        assert_eq!(p.quantity, 0.5);
        assert_eq!(p.liquidation_price, Some(60_000.0));
        assert_eq!(p.leverage, 10.0);
    }

    #[test]
    fn test_exchange_error_classification() {
        assert!(matches!(
            classify_exchange_error("Insufficient margin to place order"),
            GatewayError::InsufficientBalance(_)
        ));
        assert!(matches!(
            classify_exchange_error("Invalid tick size"),
            GatewayError::InvalidOrder(_)
        ));
        assert!(matches!(
            classify_exchange_error("venue exploded"),
            GatewayError::Venue(_)
        ));
    }

    #[test]
    fn test_tif_wire_mapping() {
        assert_eq!(HyperliquidConnector::tif_wire(TimeInForce::Gtc), "Gtc");
        assert_eq!(HyperliquidConnector::tif_wire(TimeInForce::Ioc), "Ioc");
        assert_eq!(HyperliquidConnector::tif_wire(TimeInForce::PostOnly), "Alo");
    }
}
