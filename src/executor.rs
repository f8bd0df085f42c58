//! Order Executor
//! Mission: validate, risk-check, persist, dispatch and reconcile orders,
//! holding a per-(binding, venue-order-id) lock around every row mutation

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectors::symbol::canonical as symbol_canonical;
use crate::connectors::{
    ConnectorRegistry, Credentials, ModifyRequest, OrderAck, OrderFilter, PlaceOrderRequest,
};
use crate::error::{GatewayError, Result};
use crate::models::{
    Order, OrderKind, OrderSide, OrderStatus, PositionSide, TimeInForce, VenueBinding,
};
use crate::notify::{NotificationBus, NotificationKind, NotificationPriority};
use crate::risk::RiskEngine;
use crate::store::{NewOrder, NewTrade, Store};
use crate::tracker::{PositionTracker, PositionUpdate};
use crate::util::{order_lock_key, LockMap};
use crate::vault::CredentialVault;

/// Outcome of a placement, returned to the caller alongside the durable
/// order row id.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: i64,
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
    pub fee: f64,
}

impl OrderResult {
    fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            venue_order_id: order.venue_order_id.clone(),
            status: order.status,
            filled_quantity: order.filled_quantity,
            average_price: order.average_fill_price,
            fee: order.fee,
        }
    }
}

pub struct OrderExecutor {
    store: Store,
    registry: Arc<ConnectorRegistry>,
    vault: Arc<CredentialVault>,
    risk: Arc<RiskEngine>,
    tracker: Arc<PositionTracker>,
    notifier: Arc<NotificationBus>,
    dispatch_timeout: Duration,
    order_expiry_seconds: i64,
    max_orders_per_account: usize,
    order_locks: LockMap,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        registry: Arc<ConnectorRegistry>,
        vault: Arc<CredentialVault>,
        risk: Arc<RiskEngine>,
        tracker: Arc<PositionTracker>,
        notifier: Arc<NotificationBus>,
        dispatch_timeout: Duration,
        order_expiry_seconds: i64,
        max_orders_per_account: usize,
    ) -> Self {
        Self {
            store,
            registry,
            vault,
            risk,
            tracker,
            notifier,
            dispatch_timeout,
            order_expiry_seconds,
            max_orders_per_account,
            order_locks: LockMap::new(),
        }
    }

    /// Place one order. See the module docs for the full pipeline; risk
    /// violations still produce a REJECTED audit row.
    pub async fn place_order(
        &self,
        account_id: i64,
        binding_id: i64,
        request: PlaceOrderRequest,
    ) -> Result<OrderResult> {
        self.place_internal(account_id, binding_id, request, true)
            .await
    }

    async fn place_internal(
        &self,
        account_id: i64,
        binding_id: i64,
        mut request: PlaceOrderRequest,
        enforce_risk: bool,
    ) -> Result<OrderResult> {
        let binding = self.load_binding(account_id, binding_id).await?;
        request.symbol = symbol_canonical(&request.symbol);

        let active = self.store.count_active_orders(account_id).await?;
        if active as usize >= self.max_orders_per_account {
            return Err(GatewayError::ValidationFailed(format!(
                "account has {active} active orders (limit {})",
                self.max_orders_per_account
            )));
        }

        self.validate_request(&request, &binding)?;

        if enforce_risk {
            let violations = self
                .risk
                .check(
                    account_id,
                    &request.symbol,
                    request.side,
                    request.quantity,
                    request.price.unwrap_or(0.0),
                    request.leverage.unwrap_or(1.0),
                )
                .await?;
            if !violations.is_empty() {
                let messages: Vec<String> =
                    violations.iter().map(|v| v.message.clone()).collect();
                // Audit row: the intent is recorded even though nothing
                // was dispatched.
                self.store
                    .insert_order(&self.new_order_row(
                        account_id,
                        binding_id,
                        &request,
                        OrderStatus::Rejected,
                        Some(messages.join("; ")),
                    ))
                    .await?;
                self.notifier.publish(
                    account_id,
                    NotificationKind::OrderRejected,
                    NotificationPriority::High,
                    "Order Rejected",
                    &format!("Risk limits blocked {} {}", request.side.as_str(), request.symbol),
                    json!({"violations": messages}),
                );
                return Err(GatewayError::RiskLimitExceeded {
                    violations: messages,
                });
            }
        }

        // Idempotency id so reconciliation can adopt the venue's view of
        // an order whose dispatch deadline expired.
        if request.client_order_id.is_none() {
            request.client_order_id = Some(Uuid::new_v4().to_string());
        }

        let credentials = Credentials::decrypt(&binding, &self.vault)?;
        let connector = self.registry.connector_for(&binding, &credentials).await?;

        let order = self
            .store
            .insert_order(&self.new_order_row(
                account_id,
                binding_id,
                &request,
                OrderStatus::Pending,
                None,
            ))
            .await?;

        let dispatched = timeout(self.dispatch_timeout, connector.place_order(&request)).await;
        let ack = match dispatched {
            Err(_) => {
                // Leave the row PENDING; the reconciler resolves the true
                // status from the venue.
                warn!(
                    order_id = order.id,
                    symbol = %request.symbol,
                    "dispatch deadline expired, order left PENDING for reconciliation"
                );
                return Err(GatewayError::Timeout {
                    op: "place_order",
                    secs: self.dispatch_timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                self.store.mark_order_rejected(order.id, &e.to_string()).await?;
                self.notifier.publish(
                    account_id,
                    NotificationKind::OrderRejected,
                    NotificationPriority::High,
                    "Order Rejected",
                    &format!("{} {} rejected: {e}", request.side.as_str(), request.symbol),
                    json!({"order_id": order.id}),
                );
                return Err(e);
            }
            Ok(Ok(ack)) => ack,
        };

        let lock = self
            .order_locks
            .entry(&order_lock_key(binding_id, &ack.venue_order_id));
        let _guard = lock.lock().await;

        let updated = self
            .store
            .apply_order_ack(
                order.id,
                Some(&ack.venue_order_id),
                ack.status,
                ack.filled_quantity,
                ack.average_price,
                ack.fee,
            )
            .await?;

        if ack.filled_quantity > 0.0 {
            self.fold_fill(&binding, &updated, &ack).await?;
        }
        self.notify_placement(&updated);

        info!(
            order_id = updated.id,
            venue_order_id = %ack.venue_order_id,
            status = updated.status.as_str(),
            filled = updated.filled_quantity,
            "order dispatched"
        );
        Ok(OrderResult::from_order(&updated))
    }

    /// Cancel by venue order id. Refuses terminal orders.
    pub async fn cancel_order(
        &self,
        account_id: i64,
        binding_id: i64,
        venue_order_id: &str,
    ) -> Result<OrderResult> {
        let binding = self.load_binding(account_id, binding_id).await?;
        let order = self
            .store
            .get_order_by_venue_id(binding_id, venue_order_id)
            .await?
            .ok_or_else(|| GatewayError::OrderNotFound(venue_order_id.to_string()))?;
        if order.is_terminal() {
            return Err(GatewayError::ValidationFailed(format!(
                "order {} is {} and cannot be canceled",
                venue_order_id,
                order.status.as_str()
            )));
        }

        let lock = self
            .order_locks
            .entry(&order_lock_key(binding_id, venue_order_id));
        let _guard = lock.lock().await;

        let credentials = Credentials::decrypt(&binding, &self.vault)?;
        let connector = self.registry.connector_for(&binding, &credentials).await?;
        timeout(
            self.dispatch_timeout,
            connector.cancel_order(&order.symbol, venue_order_id),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            op: "cancel_order",
            secs: self.dispatch_timeout.as_secs(),
        })??;

        let updated = self.store.mark_order_canceled(order.id).await?;
        self.notifier.publish(
            account_id,
            NotificationKind::OrderCancelled,
            NotificationPriority::Low,
            "Order Cancelled",
            &format!("Your order for {} has been cancelled", order.symbol),
            json!({"venue_order_id": venue_order_id}),
        );
        Ok(OrderResult::from_order(&updated))
    }

    /// Modify a resting order. Cancel-replace venues hand back a new venue
    /// order id; either way the same order row is updated in place.
    pub async fn modify_order(
        &self,
        account_id: i64,
        binding_id: i64,
        venue_order_id: &str,
        changes: ModifyRequest,
    ) -> Result<OrderResult> {
        let binding = self.load_binding(account_id, binding_id).await?;
        let order = self
            .store
            .get_order_by_venue_id(binding_id, venue_order_id)
            .await?
            .ok_or_else(|| GatewayError::OrderNotFound(venue_order_id.to_string()))?;
        if !matches!(
            order.status,
            OrderStatus::New | OrderStatus::PartiallyFilled
        ) {
            return Err(GatewayError::ValidationFailed(format!(
                "order {} is {} and not modifiable",
                venue_order_id,
                order.status.as_str()
            )));
        }

        let lock = self
            .order_locks
            .entry(&order_lock_key(binding_id, venue_order_id));
        let _guard = lock.lock().await;

        let credentials = Credentials::decrypt(&binding, &self.vault)?;
        let connector = self.registry.connector_for(&binding, &credentials).await?;
        let ack = timeout(
            self.dispatch_timeout,
            connector.modify_order(&order.symbol, venue_order_id, &changes),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            op: "modify_order",
            secs: self.dispatch_timeout.as_secs(),
        })??;

        let updated = self
            .store
            .apply_order_modify(
                order.id,
                &ack.venue_order_id,
                changes.quantity,
                changes.price,
                changes.stop_price,
            )
            .await?;

        info!(
            order_id = order.id,
            old_venue_id = venue_order_id,
            new_venue_id = %ack.venue_order_id,
            "order modified"
        );
        Ok(OrderResult::from_order(&updated))
    }

    /// Batch placement: per-order independence, each entry carries its
    /// own outcome.
    pub async fn place_batch(
        &self,
        account_id: i64,
        binding_id: i64,
        requests: Vec<PlaceOrderRequest>,
    ) -> Vec<Result<OrderResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.place_order(account_id, binding_id, request).await);
        }
        results
    }

    /// Cancel every non-terminal order, optionally filtered by binding
    /// and symbol. Returns the number of orders canceled.
    pub async fn cancel_all(
        &self,
        account_id: i64,
        binding_id: Option<i64>,
        symbol: Option<&str>,
    ) -> Result<usize> {
        let active = self
            .store
            .active_orders(account_id, binding_id, symbol)
            .await?;

        let mut canceled = 0;
        for order in active {
            match &order.venue_order_id {
                Some(venue_id) => {
                    match self
                        .cancel_order(account_id, order.binding_id, venue_id)
                        .await
                    {
                        Ok(_) => canceled += 1,
                        Err(e) => {
                            warn!(order_id = order.id, error = %e, "cancel-all entry failed")
                        }
                    }
                }
                None => {
                    // Never dispatched (or dispatch timed out); local
                    // cancel only.
                    if self.store.mark_order_canceled(order.id).await.is_ok() {
                        canceled += 1;
                    }
                }
            }
        }
        Ok(canceled)
    }

    /// Pull the venue's order list for a binding and overwrite local
    /// state. The venue is authoritative for status, filled quantity and
    /// average price.
    pub async fn sync_orders(&self, binding_id: i64) -> Result<usize> {
        let binding = self
            .store
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| {
                GatewayError::ValidationFailed(format!("no binding {binding_id}"))
            })?;
        if !binding.is_active {
            return Ok(0);
        }

        let credentials = Credentials::decrypt(&binding, &self.vault)?;
        let connector = self.registry.connector_for(&binding, &credentials).await?;
        let venue_orders = connector.get_orders(&OrderFilter::default()).await?;

        let mut synced = 0;
        for remote in venue_orders {
            let lock = self
                .order_locks
                .entry(&order_lock_key(binding_id, &remote.venue_order_id));
            let _guard = lock.lock().await;

            let local = match self
                .store
                .get_order_by_venue_id(binding_id, &remote.venue_order_id)
                .await?
            {
                Some(order) => Some(order),
                None => match &remote.client_order_id {
                    Some(client_id) => {
                        self.store
                            .get_order_by_client_id(binding_id, client_id)
                            .await?
                    }
                    None => None,
                },
            };

            match local {
                Some(order) if order.is_terminal() => {}
                Some(order) => {
                    self.store
                        .apply_order_ack(
                            order.id,
                            Some(&remote.venue_order_id),
                            remote.status,
                            remote.filled_quantity,
                            remote.average_price,
                            0.0,
                        )
                        .await?;
                }
                None => {
                    let created = self
                        .store
                        .insert_order(&NewOrder {
                            account_id: binding.account_id,
                            binding_id,
                            client_order_id: remote.client_order_id.clone(),
                            symbol: remote.symbol.clone(),
                            side: remote.side,
                            kind: remote.kind,
                            status: OrderStatus::Pending,
                            time_in_force: remote.time_in_force,
                            quantity: remote.quantity,
                            price: remote.price,
                            stop_price: remote.stop_price,
                            reduce_only: false,
                            post_only: false,
                            is_isolated: false,
                            expires_at: None,
                            error_message: None,
                        })
                        .await?;
                    self.store
                        .apply_order_ack(
                            created.id,
                            Some(&remote.venue_order_id),
                            remote.status,
                            remote.filled_quantity,
                            remote.average_price,
                            remote.fee,
                        )
                        .await?;
                }
            }
            synced += 1;
        }
        Ok(synced)
    }

    /// Close an open position with an opposite reduce-only market order.
    /// Bypasses the pre-trade risk check: flattening reduces risk.
    pub async fn flatten_position(
        &self,
        account_id: i64,
        binding_id: i64,
        symbol: &str,
    ) -> Result<OrderResult> {
        let position = self
            .store
            .get_open_position(binding_id, &symbol_canonical(symbol))
            .await?
            .ok_or_else(|| GatewayError::PositionNotFound(symbol.to_string()))?;

        let side = match position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        };
        let request =
            PlaceOrderRequest::market(&position.symbol, side, position.quantity).reduce_only();
        self.place_internal(account_id, binding_id, request, false)
            .await
    }

    /// Expire GTT orders older than the configured expiry window.
    pub async fn expire_stale_orders(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.order_expiry_seconds);
        let stale = self.store.stale_gtt_orders(cutoff).await?;

        let mut expired = 0;
        for order in stale {
            if let (Some(venue_id), Ok(binding)) = (
                order.venue_order_id.as_deref(),
                self.load_binding(order.account_id, order.binding_id).await,
            ) {
                // Best effort venue-side cancel before expiring locally.
                if let Ok(credentials) = Credentials::decrypt(&binding, &self.vault) {
                    if let Ok(connector) =
                        self.registry.connector_for(&binding, &credentials).await
                    {
                        let _ = connector.cancel_order(&order.symbol, venue_id).await;
                    }
                }
            }
            self.store.mark_order_expired(order.id).await?;
            expired += 1;
        }
        if expired > 0 {
            info!(expired, "stale GTT orders expired");
        }
        Ok(expired)
    }

    pub async fn get_orders(
        &self,
        account_id: i64,
        binding_id: Option<i64>,
        status: Option<OrderStatus>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        self.store
            .list_orders(account_id, binding_id, status, symbol, limit)
            .await
    }

    pub async fn active_orders(&self, account_id: i64) -> Result<Vec<Order>> {
        self.store.active_orders(account_id, None, None).await
    }

    // ── Internals ──────────────────────────────────────────

    async fn load_binding(&self, account_id: i64, binding_id: i64) -> Result<VenueBinding> {
        let binding = self
            .store
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| {
                GatewayError::ValidationFailed(format!("no binding {binding_id}"))
            })?;
        if binding.account_id != account_id {
            return Err(GatewayError::ValidationFailed(format!(
                "binding {binding_id} does not belong to account {account_id}"
            )));
        }
        if !binding.is_active {
            return Err(GatewayError::ValidationFailed(format!(
                "binding {binding_id} is inactive"
            )));
        }
        Ok(binding)
    }

    fn validate_request(
        &self,
        request: &PlaceOrderRequest,
        binding: &VenueBinding,
    ) -> Result<()> {
        if request.quantity <= 0.0 {
            return Err(GatewayError::ValidationFailed(
                "quantity must be positive".to_string(),
            ));
        }
        if request.kind.requires_price() && request.price.is_none() {
            return Err(GatewayError::ValidationFailed(format!(
                "{} orders require a price",
                request.kind.as_str()
            )));
        }
        if request.kind.requires_stop_price() && request.stop_price.is_none() {
            return Err(GatewayError::ValidationFailed(format!(
                "{} orders require a stop price",
                request.kind.as_str()
            )));
        }

        // Required balance is estimated from the request price. A market
        // order without one can only be checked post-fill.
        match request.price {
            Some(price) => {
                let required = request.quantity * price;
                if !request.reduce_only && required > binding.available_balance {
                    return Err(GatewayError::insufficient_balance(
                        required,
                        binding.available_balance,
                    ));
                }
            }
            None if request.kind == OrderKind::Market => {
                warn!(
                    symbol = %request.symbol,
                    "market order without price hint, skipping balance pre-check"
                );
            }
            None => {}
        }
        Ok(())
    }

    fn new_order_row(
        &self,
        account_id: i64,
        binding_id: i64,
        request: &PlaceOrderRequest,
        status: OrderStatus,
        error_message: Option<String>,
    ) -> NewOrder {
        let expires_at = (request.time_in_force == TimeInForce::Gtt)
            .then(|| Utc::now() + chrono::Duration::seconds(self.order_expiry_seconds));
        NewOrder {
            account_id,
            binding_id,
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            status,
            time_in_force: request.time_in_force,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            reduce_only: request.reduce_only,
            post_only: request.post_only,
            is_isolated: request.is_isolated,
            expires_at,
            error_message,
        }
    }

    /// Record the trade and fold the fill into the position book,
    /// computing the realized PnL of any reducing portion.
    async fn fold_fill(
        &self,
        binding: &VenueBinding,
        order: &Order,
        ack: &OrderAck,
    ) -> Result<()> {
        let fill_price = ack.average_price.unwrap_or(order.price.unwrap_or(0.0));
        // BUY reduces SHORT, SELL reduces LONG; a reducing fill realizes
        // PnL against the stored entry price.
        let realized = match self
            .store
            .get_open_position(binding.id, &order.symbol)
            .await?
        {
            Some(position) => {
                let reducing = matches!(
                    (position.side, order.side),
                    (PositionSide::Long, OrderSide::Sell) | (PositionSide::Short, OrderSide::Buy)
                );
                if reducing {
                    let reduced = ack.filled_quantity.min(position.quantity);
                    match position.side {
                        PositionSide::Long => (fill_price - position.entry_price) * reduced,
                        PositionSide::Short => (position.entry_price - fill_price) * reduced,
                    }
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        self.store
            .insert_trade(&NewTrade {
                order_id: order.id,
                venue_trade_id: None,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: ack.filled_quantity,
                price: fill_price,
                fee: ack.fee,
                fee_asset: order.fee_asset.clone(),
                is_maker: false,
                realized_pnl: (realized != 0.0).then_some(realized),
                executed_at: Utc::now(),
            })
            .await?;

        self.tracker
            .apply_update(
                binding,
                &PositionUpdate {
                    symbol: order.symbol.clone(),
                    size_delta: order.side.sign() * ack.filled_quantity,
                    realized_pnl: realized,
                    fee: ack.fee,
                    mark_price: (fill_price > 0.0).then_some(fill_price),
                    liquidation_price: None,
                },
            )
            .await?;
        Ok(())
    }

    fn notify_placement(&self, order: &Order) {
        let (kind, priority, title) = match order.status {
            OrderStatus::Filled => (
                NotificationKind::OrderFilled,
                NotificationPriority::Medium,
                "Order Filled",
            ),
            OrderStatus::PartiallyFilled => (
                NotificationKind::OrderPartiallyFilled,
                NotificationPriority::Medium,
                "Order Partially Filled",
            ),
            OrderStatus::Canceled => (
                NotificationKind::OrderCancelled,
                NotificationPriority::Low,
                "Order Cancelled",
            ),
            OrderStatus::Rejected => (
                NotificationKind::OrderRejected,
                NotificationPriority::High,
                "Order Rejected",
            ),
            _ => (
                NotificationKind::OrderPlaced,
                NotificationPriority::Medium,
                "Order Placed",
            ),
        };
        self.notifier.publish(
            order.account_id,
            kind,
            priority,
            title,
            &format!(
                "{} {} {} @ {}",
                order.side.as_str(),
                order.quantity,
                order.symbol,
                order
                    .average_fill_price
                    .or(order.price)
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "market".to_string())
            ),
            json!({
                "order_id": order.id,
                "venue_order_id": order.venue_order_id,
                "status": order.status,
                "filled_quantity": order.filled_quantity,
            }),
        );
    }
}
