//! Order & Trade Persistence
//! Status updates are monotonic: terminal rows refuse further mutation and
//! a lower-ranked status never overwrites a higher-ranked one.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use super::{parse_ts, parse_ts_opt, ts, Store};
use crate::error::{GatewayError, Result};
use crate::models::{Order, OrderKind, OrderSide, OrderStatus, TimeInForce, Trade};

/// Fields required to persist a fresh order row.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: i64,
    pub binding_id: i64,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub is_isolated: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Fields required to persist an individual fill.
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub order_id: i64,
    pub venue_trade_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub fee_asset: Option<String>,
    pub is_maker: bool,
    pub realized_pnl: Option<f64>,
    pub executed_at: DateTime<Utc>,
}

const ORDER_COLS: &str = "id, account_id, binding_id, venue_order_id, client_order_id, symbol, \
     side, kind, status, time_in_force, quantity, filled_quantity, price, stop_price, \
     average_fill_price, reduce_only, post_only, is_isolated, fee, fee_asset, placed_at, \
     filled_at, canceled_at, expires_at, error_message, retry_count, created_at, updated_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let side: String = row.get(6)?;
    let kind: String = row.get(7)?;
    let status: String = row.get(8)?;
    let tif: String = row.get(9)?;
    Ok(Order {
        id: row.get(0)?,
        account_id: row.get(1)?,
        binding_id: row.get(2)?,
        venue_order_id: row.get(3)?,
        client_order_id: row.get(4)?,
        symbol: row.get(5)?,
        side: OrderSide::from_str(&side).unwrap_or(OrderSide::Buy),
        kind: OrderKind::from_str(&kind).unwrap_or(OrderKind::Limit),
        status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Pending),
        time_in_force: TimeInForce::from_str(&tif).unwrap_or(TimeInForce::Gtc),
        quantity: row.get(10)?,
        filled_quantity: row.get(11)?,
        price: row.get(12)?,
        stop_price: row.get(13)?,
        average_fill_price: row.get(14)?,
        reduce_only: row.get::<_, i64>(15)? == 1,
        post_only: row.get::<_, i64>(16)? == 1,
        is_isolated: row.get::<_, i64>(17)? == 1,
        fee: row.get(18)?,
        fee_asset: row.get(19)?,
        placed_at: parse_ts_opt(row.get(20)?),
        filled_at: parse_ts_opt(row.get(21)?),
        canceled_at: parse_ts_opt(row.get(22)?),
        expires_at: parse_ts_opt(row.get(23)?),
        error_message: row.get(24)?,
        retry_count: row.get(25)?,
        created_at: parse_ts(&row.get::<_, String>(26)?),
        updated_at: parse_ts(&row.get::<_, String>(27)?),
    })
}

fn trade_from_row(row: &Row<'_>) -> rusqlite::Result<Trade> {
    let side: String = row.get(4)?;
    Ok(Trade {
        id: row.get(0)?,
        order_id: row.get(1)?,
        venue_trade_id: row.get(2)?,
        symbol: row.get(3)?,
        side: OrderSide::from_str(&side).unwrap_or(OrderSide::Buy),
        quantity: row.get(5)?,
        price: row.get(6)?,
        fee: row.get(7)?,
        fee_asset: row.get(8)?,
        is_maker: row.get::<_, i64>(9)? == 1,
        realized_pnl: row.get(10)?,
        executed_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

impl Store {
    pub async fn insert_order(&self, new: &NewOrder) -> Result<Order> {
        let conn = self.lock().await;
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO orders (account_id, binding_id, client_order_id, symbol, side, kind,
                status, time_in_force, quantity, price, stop_price, reduce_only, post_only,
                is_isolated, expires_at, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
            params![
                new.account_id,
                new.binding_id,
                new.client_order_id,
                new.symbol,
                new.side.as_str(),
                new.kind.as_str(),
                new.status.as_str(),
                new.time_in_force.as_str(),
                new.quantity,
                new.price,
                new.stop_price,
                new.reduce_only as i64,
                new.post_only as i64,
                new.is_isolated as i64,
                new.expires_at.map(ts),
                new.error_message,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::ValidationFailed(
                    "client order id already used (idempotency conflict)".to_string(),
                )
            }
            other => GatewayError::Storage(other),
        })?;

        let id = conn.last_insert_rowid();
        let order = conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )?;
        Ok(order)
    }

    pub async fn get_order(&self, id: i64) -> Result<Option<Order>> {
        let conn = self.lock().await;
        let order = conn
            .query_row(
                &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
                params![id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    pub async fn get_order_by_venue_id(
        &self,
        binding_id: i64,
        venue_order_id: &str,
    ) -> Result<Option<Order>> {
        let conn = self.lock().await;
        let order = conn
            .query_row(
                &format!(
                    "SELECT {ORDER_COLS} FROM orders
                     WHERE binding_id = ?1 AND venue_order_id = ?2"
                ),
                params![binding_id, venue_order_id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Lookup by the client-supplied idempotency id. Lets reconciliation
    /// adopt a venue order id onto a row whose dispatch timed out.
    pub async fn get_order_by_client_id(
        &self,
        binding_id: i64,
        client_order_id: &str,
    ) -> Result<Option<Order>> {
        let conn = self.lock().await;
        let order = conn
            .query_row(
                &format!(
                    "SELECT {ORDER_COLS} FROM orders
                     WHERE binding_id = ?1 AND client_order_id = ?2"
                ),
                params![binding_id, client_order_id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Apply a dispatch ack (or reconciled venue state) to an order row.
    /// The venue's view is authoritative for status, filled quantity and
    /// average price, within the monotonicity rules.
    pub async fn apply_order_ack(
        &self,
        id: i64,
        venue_order_id: Option<&str>,
        status: OrderStatus,
        filled_quantity: f64,
        average_fill_price: Option<f64>,
        fee: f64,
    ) -> Result<Order> {
        let conn = self.lock().await;
        let current = conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )?;

        if current.status.is_terminal() {
            return Err(GatewayError::ValidationFailed(format!(
                "order {} is {} and immutable",
                id,
                current.status.as_str()
            )));
        }

        let status = if status.rank() < current.status.rank() {
            warn!(
                order_id = id,
                have = current.status.as_str(),
                got = status.as_str(),
                "ignoring status regression from venue"
            );
            current.status
        } else {
            status
        };

        // Fills only ever grow, and never past the order quantity.
        let filled = filled_quantity
            .max(current.filled_quantity)
            .min(current.quantity);
        let now = Utc::now();
        let filled_at = if status == OrderStatus::Filled {
            Some(ts(now))
        } else {
            None
        };

        conn.execute(
            "UPDATE orders
             SET venue_order_id = COALESCE(?2, venue_order_id),
                 status = ?3,
                 filled_quantity = ?4,
                 average_fill_price = COALESCE(?5, average_fill_price),
                 fee = fee + ?6,
                 placed_at = COALESCE(placed_at, ?7),
                 filled_at = COALESCE(?8, filled_at),
                 updated_at = ?7
             WHERE id = ?1",
            params![
                id,
                venue_order_id,
                status.as_str(),
                filled,
                average_fill_price,
                fee,
                ts(now),
                filled_at,
            ],
        )?;

        let order = conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )?;
        Ok(order)
    }

    pub async fn mark_order_rejected(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE orders SET status = ?2, error_message = ?3, updated_at = ?4
             WHERE id = ?1 AND status NOT IN ('FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')",
            params![id, OrderStatus::Rejected.as_str(), error, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn mark_order_canceled(&self, id: i64) -> Result<Order> {
        let conn = self.lock().await;
        let now = ts(Utc::now());
        let changed = conn.execute(
            "UPDATE orders SET status = ?2, canceled_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')",
            params![id, OrderStatus::Canceled.as_str(), now],
        )?;
        if changed == 0 {
            return Err(GatewayError::ValidationFailed(format!(
                "order {id} is terminal and cannot be canceled"
            )));
        }
        let order = conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )?;
        Ok(order)
    }

    pub async fn mark_order_expired(&self, id: i64) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE orders SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status NOT IN ('FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')",
            params![id, OrderStatus::Expired.as_str(), ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Cancel-replace modify: the row keeps its identity, the venue id and
    /// changed fields are swapped in place.
    pub async fn apply_order_modify(
        &self,
        id: i64,
        new_venue_order_id: &str,
        quantity: Option<f64>,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<Order> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE orders
             SET venue_order_id = ?2,
                 quantity = COALESCE(?3, quantity),
                 price = COALESCE(?4, price),
                 stop_price = COALESCE(?5, stop_price),
                 updated_at = ?6
             WHERE id = ?1 AND status IN ('NEW', 'PARTIALLY_FILLED')",
            params![id, new_venue_order_id, quantity, price, stop_price, ts(Utc::now())],
        )?;
        if changed == 0 {
            return Err(GatewayError::ValidationFailed(format!(
                "order {id} is not modifiable"
            )));
        }
        let order = conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
            params![id],
            order_from_row,
        )?;
        Ok(order)
    }

    pub async fn list_orders(
        &self,
        account_id: i64,
        binding_id: Option<i64>,
        status: Option<OrderStatus>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let conn = self.lock().await;
        let mut sql = format!("SELECT {ORDER_COLS} FROM orders WHERE account_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(account_id)];

        if let Some(b) = binding_id {
            args.push(Box::new(b));
            sql.push_str(&format!(" AND binding_id = ?{}", args.len()));
        }
        if let Some(s) = status {
            args.push(Box::new(s.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(sym) = symbol {
            args.push(Box::new(sym.to_string()));
            sql.push_str(&format!(" AND symbol = ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", args.len()));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], order_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Orders still in flight: PENDING, NEW or PARTIALLY_FILLED.
    pub async fn active_orders(
        &self,
        account_id: i64,
        binding_id: Option<i64>,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>> {
        let conn = self.lock().await;
        let mut sql = format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE account_id = ?1 AND status IN ('PENDING', 'NEW', 'PARTIALLY_FILLED')"
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(account_id)];
        if let Some(b) = binding_id {
            args.push(Box::new(b));
            sql.push_str(&format!(" AND binding_id = ?{}", args.len()));
        }
        if let Some(sym) = symbol {
            args.push(Box::new(sym.to_string()));
            sql.push_str(&format!(" AND symbol = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&refs[..], order_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn count_orders_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE account_id = ?1 AND created_at >= ?2",
            params![account_id, ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn count_active_orders(&self, account_id: i64) -> Result<i64> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders
             WHERE account_id = ?1 AND status IN ('PENDING', 'NEW', 'PARTIALLY_FILLED')",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// GTT orders past their expiry cutoff that are still non-terminal.
    pub async fn stale_gtt_orders(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders
             WHERE time_in_force = 'GTT'
               AND status IN ('PENDING', 'NEW', 'PARTIALLY_FILLED')
               AND created_at < ?1"
        ))?;
        let rows = stmt.query_map(params![ts(cutoff)], order_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn insert_trade(&self, new: &NewTrade) -> Result<Trade> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO trades (order_id, venue_trade_id, symbol, side, quantity, price,
                fee, fee_asset, is_maker, realized_pnl, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                new.order_id,
                new.venue_trade_id,
                new.symbol,
                new.side.as_str(),
                new.quantity,
                new.price,
                new.fee,
                new.fee_asset,
                new.is_maker as i64,
                new.realized_pnl,
                ts(new.executed_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let trade = conn.query_row(
            "SELECT id, order_id, venue_trade_id, symbol, side, quantity, price, fee,
                    fee_asset, is_maker, realized_pnl, executed_at
             FROM trades WHERE id = ?1",
            params![id],
            trade_from_row,
        )?;
        Ok(trade)
    }

    pub async fn trades_for_order(&self, order_id: i64) -> Result<Vec<Trade>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, order_id, venue_trade_id, symbol, side, quantity, price, fee,
                    fee_asset, is_maker, realized_pnl, executed_at
             FROM trades WHERE order_id = ?1 ORDER BY executed_at",
        )?;
        let rows = stmt.query_map(params![order_id], trade_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Realized PnL from fills since `since` (daily-loss accounting).
    pub async fn realized_pnl_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<f64> {
        let conn = self.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(t.realized_pnl), 0.0)
             FROM trades t JOIN orders o ON o.id = t.order_id
             WHERE o.account_id = ?1 AND t.executed_at >= ?2 AND t.realized_pnl IS NOT NULL",
            params![account_id, ts(since)],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::accounts::NewBinding;
    use crate::models::Venue;

    async fn seed(store: &Store) -> (i64, i64) {
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
        (account.id, binding.id)
    }

    fn limit_buy(account_id: i64, binding_id: i64) -> NewOrder {
        NewOrder {
            account_id,
            binding_id,
            client_order_id: None,
            symbol: "BTC-PERP".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            status: OrderStatus::Pending,
            time_in_force: TimeInForce::Gtc,
            quantity: 0.1,
            price: Some(50_000.0),
            stop_price: None,
            reduce_only: false,
            post_only: false,
            is_isolated: false,
            expires_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_ack_updates_row_and_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let order = store
            .insert_order(&limit_buy(account_id, binding_id))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);

        let order = store
            .apply_order_ack(order.id, Some("V1"), OrderStatus::New, 0.0, None, 0.0)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.venue_order_id.as_deref(), Some("V1"));
        assert!(order.placed_at.is_some());

        // A regressed status from the venue is ignored.
        let order = store
            .apply_order_ack(order.id, None, OrderStatus::Pending, 0.05, Some(50_000.0), 0.1)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.filled_quantity, 0.05);

        let order = store
            .apply_order_ack(order.id, None, OrderStatus::Filled, 0.1, Some(50_000.0), 0.1)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.filled_at.is_some());

        // Terminal rows are immutable.
        let err = store
            .apply_order_ack(order.id, None, OrderStatus::Canceled, 0.1, None, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_filled_quantity_clamped_to_order_quantity() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let order = store
            .insert_order(&limit_buy(account_id, binding_id))
            .await
            .unwrap();
        let order = store
            .apply_order_ack(order.id, Some("V1"), OrderStatus::Filled, 0.5, None, 0.0)
            .await
            .unwrap();
        assert_eq!(order.filled_quantity, order.quantity);
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_fails() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let order = store
            .insert_order(&limit_buy(account_id, binding_id))
            .await
            .unwrap();
        store
            .apply_order_ack(order.id, Some("V1"), OrderStatus::Filled, 0.1, None, 0.0)
            .await
            .unwrap();
        assert!(store.mark_order_canceled(order.id).await.is_err());
    }

    #[tokio::test]
    async fn test_modify_swaps_venue_id_in_place() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let order = store
            .insert_order(&limit_buy(account_id, binding_id))
            .await
            .unwrap();
        store
            .apply_order_ack(order.id, Some("V1"), OrderStatus::New, 0.0, None, 0.0)
            .await
            .unwrap();

        let modified = store
            .apply_order_modify(order.id, "V2", Some(0.2), Some(51_000.0), None)
            .await
            .unwrap();
        assert_eq!(modified.id, order.id);
        assert_eq!(modified.venue_order_id.as_deref(), Some("V2"));
        assert_eq!(modified.quantity, 0.2);
        assert_eq!(modified.price, Some(51_000.0));
        assert_eq!(modified.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_trade_sum_and_realized_pnl_query() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let order = store
            .insert_order(&limit_buy(account_id, binding_id))
            .await
            .unwrap();

        store
            .insert_trade(&NewTrade {
                order_id: order.id,
                venue_trade_id: Some("T1".to_string()),
                symbol: "BTC-PERP".to_string(),
                side: OrderSide::Buy,
                quantity: 0.05,
                price: 50_000.0,
                fee: 0.5,
                fee_asset: Some("USDC".to_string()),
                is_maker: false,
                realized_pnl: Some(-25.0),
                executed_at: Utc::now(),
            })
            .await
            .unwrap();

        let trades = store.trades_for_order(order.id).await.unwrap();
        assert_eq!(trades.len(), 1);
        let pnl = store
            .realized_pnl_since(account_id, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(pnl, -25.0);
    }

    #[tokio::test]
    async fn test_order_filters_and_rate_count() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        for _ in 0..3 {
            store
                .insert_order(&limit_buy(account_id, binding_id))
                .await
                .unwrap();
        }
        let all = store
            .list_orders(account_id, None, None, None, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let pending = store
            .list_orders(account_id, Some(binding_id), Some(OrderStatus::Pending), Some("BTC-PERP"), 100)
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);

        let recent = store
            .count_orders_since(account_id, Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(recent, 3);
    }
}
