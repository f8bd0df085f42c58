//! Position & History Persistence

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, parse_ts_opt, ts, Store};
use crate::error::Result;
use crate::models::{Position, PositionHistory, PositionSide, PositionStatus};

const POSITION_COLS: &str = "id, account_id, binding_id, symbol, side, status, quantity, \
     initial_quantity, entry_price, mark_price, liquidation_price, exit_price, unrealized_pnl, \
     realized_pnl, margin, margin_ratio, leverage, is_isolated, stop_loss_price, \
     take_profit_price, stop_loss_order_id, take_profit_order_id, opened_at, closed_at, updated_at";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    let side: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Position {
        id: row.get(0)?,
        account_id: row.get(1)?,
        binding_id: row.get(2)?,
        symbol: row.get(3)?,
        side: PositionSide::from_str(&side).unwrap_or(PositionSide::Long),
        status: PositionStatus::from_str(&status).unwrap_or(PositionStatus::Open),
        quantity: row.get(6)?,
        initial_quantity: row.get(7)?,
        entry_price: row.get(8)?,
        mark_price: row.get(9)?,
        liquidation_price: row.get(10)?,
        exit_price: row.get(11)?,
        unrealized_pnl: row.get(12)?,
        realized_pnl: row.get(13)?,
        margin: row.get(14)?,
        margin_ratio: row.get(15)?,
        leverage: row.get(16)?,
        is_isolated: row.get::<_, i64>(17)? == 1,
        stop_loss_price: row.get(18)?,
        take_profit_price: row.get(19)?,
        stop_loss_order_id: row.get(20)?,
        take_profit_order_id: row.get(21)?,
        opened_at: parse_ts(&row.get::<_, String>(22)?),
        closed_at: parse_ts_opt(row.get(23)?),
        updated_at: parse_ts(&row.get::<_, String>(24)?),
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<PositionHistory> {
    Ok(PositionHistory {
        id: row.get(0)?,
        position_id: row.get(1)?,
        quantity: row.get(2)?,
        mark_price: row.get(3)?,
        unrealized_pnl: row.get(4)?,
        realized_pnl: row.get(5)?,
        margin: row.get(6)?,
        bid_price: row.get(7)?,
        ask_price: row.get(8)?,
        funding_rate: row.get(9)?,
        size_delta: row.get(10)?,
        recorded_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

impl Store {
    pub async fn insert_position(&self, position: &Position) -> Result<Position> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO positions (account_id, binding_id, symbol, side, status, quantity,
                initial_quantity, entry_price, mark_price, liquidation_price, exit_price,
                unrealized_pnl, realized_pnl, margin, margin_ratio, leverage, is_isolated,
                stop_loss_price, take_profit_price, stop_loss_order_id, take_profit_order_id,
                opened_at, closed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                position.account_id,
                position.binding_id,
                position.symbol,
                position.side.as_str(),
                position.status.as_str(),
                position.quantity,
                position.initial_quantity,
                position.entry_price,
                position.mark_price,
                position.liquidation_price,
                position.exit_price,
                position.unrealized_pnl,
                position.realized_pnl,
                position.margin,
                position.margin_ratio,
                position.leverage,
                position.is_isolated as i64,
                position.stop_loss_price,
                position.take_profit_price,
                position.stop_loss_order_id,
                position.take_profit_order_id,
                ts(position.opened_at),
                position.closed_at.map(ts),
                ts(position.updated_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let row = conn.query_row(
            &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
            params![id],
            position_from_row,
        )?;
        Ok(row)
    }

    /// Full-row update, used by the tracker after a locked mutation.
    pub async fn update_position(&self, position: &Position) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE positions
             SET side = ?2, status = ?3, quantity = ?4, entry_price = ?5, mark_price = ?6,
                 liquidation_price = ?7, exit_price = ?8, unrealized_pnl = ?9,
                 realized_pnl = ?10, margin = ?11, margin_ratio = ?12, leverage = ?13,
                 is_isolated = ?14, stop_loss_price = ?15, take_profit_price = ?16,
                 stop_loss_order_id = ?17, take_profit_order_id = ?18, closed_at = ?19,
                 updated_at = ?20
             WHERE id = ?1",
            params![
                position.id,
                position.side.as_str(),
                position.status.as_str(),
                position.quantity,
                position.entry_price,
                position.mark_price,
                position.liquidation_price,
                position.exit_price,
                position.unrealized_pnl,
                position.realized_pnl,
                position.margin,
                position.margin_ratio,
                position.leverage,
                position.is_isolated as i64,
                position.stop_loss_price,
                position.take_profit_price,
                position.stop_loss_order_id,
                position.take_profit_order_id,
                position.closed_at.map(ts),
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let conn = self.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {POSITION_COLS} FROM positions WHERE id = ?1"),
                params![id],
                position_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// The at-most-one OPEN position for (binding, symbol).
    pub async fn get_open_position(
        &self,
        binding_id: i64,
        symbol: &str,
    ) -> Result<Option<Position>> {
        let conn = self.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {POSITION_COLS} FROM positions
                     WHERE binding_id = ?1 AND symbol = ?2 AND status = 'OPEN'"
                ),
                params![binding_id, symbol],
                position_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn open_positions_for_account(&self, account_id: i64) -> Result<Vec<Position>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE account_id = ?1 AND status = 'OPEN' ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![account_id], position_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn open_positions_for_binding(&self, binding_id: i64) -> Result<Vec<Position>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE binding_id = ?1 AND status = 'OPEN' ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![binding_id], position_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// All positions opened in the metrics window, any status.
    pub async fn positions_since(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {POSITION_COLS} FROM positions
             WHERE account_id = ?1 AND opened_at >= ?2 ORDER BY opened_at"
        ))?;
        let rows = stmt.query_map(params![account_id, ts(since)], position_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn insert_position_history(&self, entry: &PositionHistory) -> Result<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO position_history (position_id, quantity, mark_price, unrealized_pnl,
                realized_pnl, margin, bid_price, ask_price, funding_rate, size_delta, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.position_id,
                entry.quantity,
                entry.mark_price,
                entry.unrealized_pnl,
                entry.realized_pnl,
                entry.margin,
                entry.bid_price,
                entry.ask_price,
                entry.funding_rate,
                entry.size_delta,
                ts(entry.recorded_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn position_history(&self, position_id: i64) -> Result<Vec<PositionHistory>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, position_id, quantity, mark_price, unrealized_pnl, realized_pnl,
                    margin, bid_price, ask_price, funding_rate, size_delta, recorded_at
             FROM position_history WHERE position_id = ?1 ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(params![position_id], history_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// (realized + unrealized) per history snapshot for an account, time
    /// ordered. Feeds the drawdown computation.
    pub async fn pnl_series_for_account(
        &self,
        account_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT h.recorded_at, h.realized_pnl + h.unrealized_pnl
             FROM position_history h
             JOIN positions p ON p.id = h.position_id
             WHERE p.account_id = ?1 AND h.recorded_at >= ?2
             ORDER BY h.recorded_at, h.id",
        )?;
        let rows = stmt.query_map(params![account_id, ts(since)], |row| {
            Ok((parse_ts(&row.get::<_, String>(0)?), row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;
    use crate::store::accounts::NewBinding;

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

    fn open_long(account_id: i64, binding_id: i64) -> Position {
        let now = Utc::now();
        Position {
            id: 0,
            account_id,
            binding_id,
            symbol: "BTC-PERP".to_string(),
            side: PositionSide::Long,
            status: PositionStatus::Open,
            quantity: 0.5,
            initial_quantity: 0.5,
            entry_price: 50_000.0,
            mark_price: 50_000.0,
            liquidation_price: None,
            exit_price: None,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin: 2_500.0,
            margin_ratio: None,
            leverage: 10.0,
            is_isolated: false,
            stop_loss_price: None,
            take_profit_price: None,
            stop_loss_order_id: None,
            take_profit_order_id: None,
            opened_at: now,
            closed_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_open_position_lookup_is_unique_per_symbol() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let pos = store
            .insert_position(&open_long(account_id, binding_id))
            .await
            .unwrap();

        let found = store
            .get_open_position(binding_id, "BTC-PERP")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, pos.id);
        assert!(store
            .get_open_position(binding_id, "ETH-PERP")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_and_close_position() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let mut pos = store
            .insert_position(&open_long(account_id, binding_id))
            .await
            .unwrap();

        pos.quantity = 0.0;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now());
        pos.realized_pnl = 120.0;
        store.update_position(&pos).await.unwrap();

        assert!(store
            .get_open_position(binding_id, "BTC-PERP")
            .await
            .unwrap()
            .is_none());
        let reloaded = store.get_position(pos.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, PositionStatus::Closed);
        assert!(reloaded.closed_at.is_some());
        assert_eq!(reloaded.realized_pnl, 120.0);
    }

    #[tokio::test]
    async fn test_history_series_is_time_ordered() {
        let store = Store::open_in_memory().unwrap();
        let (account_id, binding_id) = seed(&store).await;
        let pos = store
            .insert_position(&open_long(account_id, binding_id))
            .await
            .unwrap();

        let base = Utc::now() - chrono::Duration::minutes(10);
        for (i, pnl) in [50.0, 120.0, -30.0].iter().enumerate() {
            store
                .insert_position_history(&PositionHistory {
                    id: 0,
                    position_id: pos.id,
                    quantity: 0.5,
                    mark_price: 50_000.0,
                    unrealized_pnl: *pnl,
                    realized_pnl: 0.0,
                    margin: 2_500.0,
                    bid_price: None,
                    ask_price: None,
                    funding_rate: None,
                    size_delta: 0.0,
                    recorded_at: base + chrono::Duration::minutes(i as i64),
                })
                .await
                .unwrap();
        }

        let series = store
            .pnl_series_for_account(account_id, base - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].1, 50.0);
        assert_eq!(series[2].1, -30.0);
        assert!(series[0].0 < series[2].0);
    }
}
