//! Extended Connector
//! REST dialect under `/api/v1`. Requests authenticate with an API key
//! header; mutating requests additionally carry an HMAC-SHA256 signature
//! over `timestamp + method + path + body` with the API secret. Markets
//! use `BASE-USD` native names; statuses arrive lowercase.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::rate_limit::RequestPacer;
use super::symbol::{canonical, SymbolMap};
use super::{
    AccountSnapshot, BookLevel, Channel, ConnectorConfig, Credentials, FundingInfo,
    MarketSnapshot, ModifyRequest, OrderAck, OrderBookSnapshot, OrderFilter, PlaceOrderRequest,
    PublicTrade, StreamUpdate, VenueConnector, VenueOrder, VenuePosition,
};
use crate::error::{GatewayError, Result};
use crate::models::{OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, Venue};

type HmacSha256 = Hmac<Sha256>;

const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Default)]
struct ExtendedAuth {
    api_key: String,
    api_secret: String,
    vault: Option<i64>,
}

pub struct ExtendedConnector {
    config: ConnectorConfig,
    http: reqwest::Client,
    auth: RwLock<Option<ExtendedAuth>>,
    symbols: SymbolMap,
    pacer: RequestPacer,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl ExtendedConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            pacer: RequestPacer::new(config.requests_per_minute),
            config,
            http,
            auth: RwLock::new(None),
            symbols: SymbolMap::new(),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn auth_or_err(&self) -> Result<ExtendedAuth> {
        self.auth.read().clone().ok_or_else(|| {
            GatewayError::AuthenticationFailed("extended: not authenticated".to_string())
        })
    }

    fn sign(auth: &ExtendedAuth, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(auth.api_secret.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("HMAC key error: {e}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> Result<Value> {
        self.pacer.acquire().await;
        let url = format!("{}{}", self.config.rest_url, path);
        let body_text = body
            .as_ref()
            .map(|b| serde_json::to_string(b))
            .transpose()?
            .unwrap_or_default();

        let mut request = self.http.request(method.clone(), &url);
        if authenticated {
            let auth = self.auth_or_err()?;
            let timestamp = Utc::now().timestamp_millis();
            let signature = Self::sign(&auth, method.as_str(), path, &body_text, timestamp)?;
            request = request
                .header("X-Api-Key", &auth.api_key)
                .header("X-Signature", signature)
                .header("X-Timestamp", timestamp.to_string());
            if let Some(vault) = auth.vault {
                request = request.header("X-Vault", vault.to_string());
            }
        }
        if body.is_some() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_text);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited {
                retry_after_secs: 1,
            });
        }
        if status.as_u16() == 404 {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::OrderNotFound(text));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::AuthenticationFailed(
                "extended rejected the API key".to_string(),
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let lower = text.to_lowercase();
            if lower.contains("margin") || lower.contains("balance") {
                return Err(GatewayError::InsufficientBalance(text));
            }
            if lower.contains("invalid") {
                return Err(GatewayError::InvalidOrder(text));
            }
            return Err(GatewayError::Venue(format!("HTTP {status}: {text}")));
        }
        Ok(response.json().await?)
    }

    async fn load_markets(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/api/v1/info/markets", None, false)
            .await?;
        let markets = response["data"].as_array().cloned().unwrap_or_default();
        for market in &markets {
            if let Some(name) = market["name"].as_str() {
                self.symbols.insert(&canonical(name), name);
            }
        }
        info!(markets = markets.len(), "extended market catalog loaded");
        Ok(())
    }

    fn order_from_value(&self, entry: &Value) -> VenueOrder {
        let native = entry["market"].as_str().unwrap_or_default();
        VenueOrder {
            venue_order_id: id_string(&entry["id"]),
            client_order_id: entry["externalId"].as_str().map(String::from),
            symbol: self.symbols.canonical_for(native),
            side: OrderSide::from_str(entry["side"].as_str().unwrap_or_default())
                .unwrap_or(OrderSide::Buy),
            kind: match entry["type"].as_str().unwrap_or_default().to_lowercase().as_str() {
                "market" => OrderKind::Market,
                "conditional" | "stop" => OrderKind::Stop,
                "tpsl" => OrderKind::TakeProfit,
                _ => OrderKind::Limit,
            },
            status: map_status(entry["status"].as_str().unwrap_or_default()),
            quantity: parse_f64(&entry["qty"]),
            filled_quantity: parse_f64(&entry["filledQty"]),
            price: {
                let px = parse_f64(&entry["price"]);
                (px > 0.0).then_some(px)
            },
            stop_price: {
                let px = parse_f64(&entry["triggerPrice"]);
                (px > 0.0).then_some(px)
            },
            average_price: {
                let px = parse_f64(&entry["averagePrice"]);
                (px > 0.0).then_some(px)
            },
            fee: parse_f64(&entry["payedFee"]),
            time_in_force: TimeInForce::from_str(
                entry["timeInForce"].as_str().unwrap_or("GTC"),
            )
            .unwrap_or(TimeInForce::Gtc),
            created_at: entry["createdTime"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl VenueConnector for ExtendedConnector {
    fn venue(&self) -> Venue {
        Venue::Extended
    }

    async fn connect(&self) -> Result<()> {
        if self.symbols.is_empty() {
            self.load_markets().await?;
        }
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<()> {
        let api_key = credentials.api_key.clone().ok_or_else(|| {
            GatewayError::AuthenticationFailed("extended requires an api key".to_string())
        })?;
        let api_secret = credentials.api_secret.clone().ok_or_else(|| {
            GatewayError::AuthenticationFailed("extended requires an api secret".to_string())
        })?;

        *self.auth.write() = Some(ExtendedAuth {
            api_key,
            api_secret,
            vault: credentials.vault,
        });

        self.connect().await?;
        // Probe with an authenticated read.
        self.request(reqwest::Method::GET, "/api/v1/user/balance", None, true)
            .await?;
        info!("authenticated with extended");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.auth.write() = None;
        for handle in self.streams.lock().drain(..) {
            handle.abort();
        }
        Ok(())
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        let market = self.symbols.native(&request.symbol)?;
        let kind = match request.kind {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::Stop | OrderKind::StopLimit => "CONDITIONAL",
            OrderKind::TakeProfit | OrderKind::TakeProfitLimit => "TPSL",
        };

        let mut body = json!({
            "market": market,
            "side": request.side.as_str(),
            "type": kind,
            "qty": request.quantity.to_string(),
            "timeInForce": request.time_in_force.as_str(),
            "reduceOnly": request.reduce_only,
            "postOnly": request.post_only,
        });
        if let Some(price) = request.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(stop) = request.stop_price {
            body["triggerPrice"] = json!(stop.to_string());
        }
        if let Some(client_id) = &request.client_order_id {
            body["externalId"] = json!(client_id);
        }

        let response = self
            .request(reqwest::Method::POST, "/api/v1/user/order", Some(body), true)
            .await?;
        let data = &response["data"];

        Ok(OrderAck {
            venue_order_id: id_string(&data["id"]),
            status: map_status(data["status"].as_str().unwrap_or("open")),
            filled_quantity: parse_f64(&data["filledQty"]),
            average_price: {
                let px = parse_f64(&data["averagePrice"]);
                (px > 0.0).then_some(px)
            },
            fee: parse_f64(&data["payedFee"]),
        })
    }

    async fn cancel_order(&self, _symbol: &str, venue_order_id: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/api/v1/user/order/{venue_order_id}"),
            None,
            true,
        )
        .await
        .map_err(|e| match e {
            GatewayError::OrderNotFound(_) => {
                GatewayError::OrderNotFound(venue_order_id.to_string())
            }
            other => other,
        })?;
        Ok(())
    }

    /// Extended supports in-place modification; the venue order id is
    /// preserved in the ack.
    async fn modify_order(
        &self,
        _symbol: &str,
        venue_order_id: &str,
        changes: &ModifyRequest,
    ) -> Result<OrderAck> {
        let mut body = json!({});
        if let Some(qty) = changes.quantity {
            body["qty"] = json!(qty.to_string());
        }
        if let Some(price) = changes.price {
            body["price"] = json!(price.to_string());
        }
        if let Some(stop) = changes.stop_price {
            body["triggerPrice"] = json!(stop.to_string());
        }

        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("/api/v1/user/order/{venue_order_id}"),
                Some(body),
                true,
            )
            .await?;
        let data = &response["data"];

        let ack_id = id_string(&data["id"]);
        Ok(OrderAck {
            venue_order_id: if ack_id.is_empty() {
                venue_order_id.to_string()
            } else {
                ack_id
            },
            status: map_status(data["status"].as_str().unwrap_or("open")),
            filled_quantity: parse_f64(&data["filledQty"]),
            average_price: None,
            fee: 0.0,
        })
    }

    async fn get_order(&self, _symbol: &str, venue_order_id: &str) -> Result<VenueOrder> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/user/order/{venue_order_id}"),
                None,
                true,
            )
            .await
            .map_err(|e| match e {
                GatewayError::OrderNotFound(_) => {
                    GatewayError::OrderNotFound(venue_order_id.to_string())
                }
                other => other,
            })?;
        Ok(self.order_from_value(&response["data"]))
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<VenueOrder>> {
        let path = match &filter.symbol {
            Some(symbol) => format!(
                "/api/v1/user/orders?market={}",
                self.symbols.native(symbol)?
            ),
            None => "/api/v1/user/orders".to_string(),
        };
        let response = self.request(reqwest::Method::GET, &path, None, true).await?;

        let mut orders: Vec<VenueOrder> = response["data"]
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
        let response = self
            .request(reqwest::Method::GET, "/api/v1/user/positions", None, true)
            .await?;

        let mut positions = Vec::new();
        for entry in response["data"].as_array().cloned().unwrap_or_default() {
            let quantity = parse_f64(&entry["size"]);
            if quantity.abs() < 1e-12 {
                continue;
            }
            let native = entry["market"].as_str().unwrap_or_default();
            let mapped = self.symbols.canonical_for(native);
            if let Some(want) = symbol {
                if mapped != canonical(want) {
                    continue;
                }
            }
            positions.push(VenuePosition {
                symbol: mapped,
                side: PositionSide::from_str(entry["side"].as_str().unwrap_or_default())
                    .unwrap_or(PositionSide::from_delta(quantity)),
                quantity: quantity.abs(),
                entry_price: parse_f64(&entry["openPrice"]),
                mark_price: parse_f64(&entry["markPrice"]),
                liquidation_price: {
                    let px = parse_f64(&entry["liquidationPrice"]);
                    (px > 0.0).then_some(px)
                },
                unrealized_pnl: parse_f64(&entry["unrealisedPnl"]),
                realized_pnl: parse_f64(&entry["realisedPnl"]),
                margin: parse_f64(&entry["margin"]),
                margin_ratio: None,
                leverage: parse_f64(&entry["leverage"]).max(1.0),
                is_isolated: entry["marginMode"].as_str() == Some("ISOLATED"),
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
        let response = self
            .request(reqwest::Method::GET, "/api/v1/user/balance", None, true)
            .await?;
        let data = &response["data"];
        Ok(AccountSnapshot {
            total_balance: parse_f64(&data["equity"]),
            available_balance: parse_f64(&data["availableForTrade"]),
            margin_balance: parse_f64(&data["initialMargin"]),
            unrealized_pnl: parse_f64(&data["unrealisedPnl"]),
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
        let market = self.symbols.native(symbol)?;
        self.request(
            reqwest::Method::PATCH,
            "/api/v1/user/leverage",
            Some(json!({"market": market, "leverage": leverage.to_string()})),
            true,
        )
        .await?;
        Ok(())
    }

    async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let market = self.symbols.native(symbol)?;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/info/markets/{market}/stats"),
                None,
                false,
            )
            .await?;
        let data = &response["data"];

        Ok(MarketSnapshot {
            symbol: canonical(symbol),
            last_price: parse_f64(&data["lastPrice"]),
            bid_price: {
                let px = parse_f64(&data["bidPrice"]);
                (px > 0.0).then_some(px)
            },
            ask_price: {
                let px = parse_f64(&data["askPrice"]);
                (px > 0.0).then_some(px)
            },
            mark_price: parse_f64(&data["markPrice"]),
            volume_24h: parse_f64(&data["dailyVolume"]),
            high_24h: parse_f64(&data["dailyHigh"]),
            low_24h: parse_f64(&data["dailyLow"]),
            open_24h: parse_f64(&data["dailyOpen"]),
            funding_rate: Some(parse_f64(&data["fundingRate"])),
            next_funding_time: data["nextFundingRate"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            open_interest: Some(parse_f64(&data["openInterest"])),
            timestamp: Utc::now(),
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let market = self.symbols.native(symbol)?;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/info/markets/{market}/orderbook"),
                None,
                false,
            )
            .await?;
        let data = &response["data"];

        let parse_side = |key: &str| -> Vec<BookLevel> {
            data[key]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .take(depth)
                .map(|level| BookLevel {
                    price: parse_f64(&level["price"]),
                    quantity: parse_f64(&level["qty"]),
                })
                .collect()
        };

        Ok(OrderBookSnapshot {
            symbol: canonical(symbol),
            bids: parse_side("bid"),
            asks: parse_side("ask"),
            timestamp: Utc::now(),
        })
    }

    async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<PublicTrade>> {
        let market = self.symbols.native(symbol)?;
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/info/markets/{market}/trades"),
                None,
                false,
            )
            .await?;

        Ok(response["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .take(limit)
            .map(|trade| PublicTrade {
                trade_id: id_string(&trade["id"]),
                price: parse_f64(&trade["price"]),
                quantity: parse_f64(&trade["qty"]),
                side: OrderSide::from_str(trade["side"].as_str().unwrap_or_default())
                    .unwrap_or(OrderSide::Buy),
                timestamp: trade["time"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
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

    async fn subscribe(&self, channels: &[Channel]) -> Result<mpsc::Receiver<StreamUpdate>> {
        self.auth_or_err()?;
        let (tx, rx) = mpsc::channel(128);

        for channel in channels {
            let Channel::Market(symbol) = channel else {
                warn!(channel = %channel.as_str(), "extended stream supports market data only");
                continue;
            };
            let market = self.symbols.native(symbol)?;
            let tx = tx.clone();
            let http = self.http.clone();
            let base = self.config.rest_url.clone();
            let symbol = symbol.clone();

            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                    let url = format!("{base}/api/v1/info/markets/{market}/stats");
                    let Ok(response) = http.get(&url).send().await else {
                        continue;
                    };
                    let Ok(payload) = response.json::<Value>().await else {
                        continue;
                    };
                    let data = &payload["data"];
                    let mark = parse_f64(&data["markPrice"]);
                    if mark <= 0.0 {
                        continue;
                    }
                    let update = StreamUpdate::Market(MarketSnapshot {
                        symbol: symbol.clone(),
                        last_price: parse_f64(&data["lastPrice"]),
                        bid_price: None,
                        ask_price: None,
                        mark_price: mark,
                        volume_24h: parse_f64(&data["dailyVolume"]),
                        high_24h: 0.0,
                        low_24h: 0.0,
                        open_24h: 0.0,
                        funding_rate: Some(parse_f64(&data["fundingRate"])),
                        next_funding_time: None,
                        open_interest: None,
                        timestamp: Utc::now(),
                    });
                    if tx.send(update).await.is_err() {
                        return;
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

fn map_status(raw: &str) -> OrderStatus {
    match OrderStatus::from_str(raw) {
        Some(status) => status,
        None => match raw.to_lowercase().as_str() {
            "untriggered" | "placed" => OrderStatus::New,
            "partiallyfilled" | "partially_filled" => OrderStatus::PartiallyFilled,
            other => {
                warn!(status = other, "unknown extended order status, assuming NEW");
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
