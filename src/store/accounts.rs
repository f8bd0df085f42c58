//! Account & Binding Persistence

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, ts, Store};
use crate::error::{GatewayError, Result};
use crate::models::{Account, Venue, VenueBinding};

/// Fields required to create a venue binding. Secrets arrive already
/// encrypted by the vault.
#[derive(Debug, Clone)]
pub struct NewBinding {
    pub account_id: i64,
    pub venue: Venue,
    pub name: String,
    pub testnet: bool,
    pub encrypted_api_key: Option<String>,
    pub encrypted_api_secret: Option<String>,
    pub encrypted_private_key: Option<String>,
    pub wallet_address: Option<String>,
    pub vault_index: Option<i64>,
    pub requests_per_minute: u32,
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        is_active: row.get::<_, i64>(3)? == 1,
        password_hash: row.get(4)?,
        max_position_size_usd: row.get(5)?,
        max_leverage: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?),
        updated_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<VenueBinding> {
    let venue_str: String = row.get(2)?;
    Ok(VenueBinding {
        id: row.get(0)?,
        account_id: row.get(1)?,
        venue: Venue::from_str(&venue_str).unwrap_or(Venue::Mock),
        name: row.get(3)?,
        testnet: row.get::<_, i64>(4)? == 1,
        is_active: row.get::<_, i64>(5)? == 1,
        encrypted_api_key: row.get(6)?,
        encrypted_api_secret: row.get(7)?,
        encrypted_private_key: row.get(8)?,
        wallet_address: row.get(9)?,
        vault_index: row.get(10)?,
        total_balance: row.get(11)?,
        available_balance: row.get(12)?,
        margin_balance: row.get(13)?,
        unrealized_pnl: row.get(14)?,
        requests_per_minute: row.get::<_, i64>(15)? as u32,
        created_at: parse_ts(&row.get::<_, String>(16)?),
        updated_at: parse_ts(&row.get::<_, String>(17)?),
    })
}

const ACCOUNT_COLS: &str =
    "id, name, email, is_active, password_hash, max_position_size_usd, max_leverage, created_at, updated_at";
const BINDING_COLS: &str = "id, account_id, venue, name, testnet, is_active, encrypted_api_key, \
     encrypted_api_secret, encrypted_private_key, wallet_address, vault_index, total_balance, \
     available_balance, margin_balance, unrealized_pnl, requests_per_minute, created_at, updated_at";

impl Store {
    pub async fn insert_account(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
        max_position_size_usd: f64,
        max_leverage: f64,
    ) -> Result<Account> {
        let conn = self.lock().await;
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO accounts (name, email, is_active, password_hash, max_position_size_usd, max_leverage, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?6)",
            params![name, email, password_hash, max_position_size_usd, max_leverage, now],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::ValidationFailed(format!("email '{email}' is already registered"))
            }
            other => GatewayError::Storage(other),
        })?;

        let id = conn.last_insert_rowid();
        let account = conn.query_row(
            &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
            params![id],
            account_from_row,
        )?;
        Ok(account)
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.lock().await;
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
                params![id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.lock().await;
        let account = conn
            .query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE email = ?1"),
                params![email],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    pub async fn set_account_risk_defaults(
        &self,
        id: i64,
        max_position_size_usd: f64,
        max_leverage: f64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE accounts SET max_position_size_usd = ?2, max_leverage = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, max_position_size_usd, max_leverage, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn insert_binding(&self, new: &NewBinding) -> Result<VenueBinding> {
        let conn = self.lock().await;
        let now = ts(Utc::now());

        conn.execute(
            "INSERT INTO venue_bindings (account_id, venue, name, testnet, is_active,
                encrypted_api_key, encrypted_api_secret, encrypted_private_key,
                wallet_address, vault_index, requests_per_minute, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                new.account_id,
                new.venue.as_str(),
                new.name,
                new.testnet as i64,
                new.encrypted_api_key,
                new.encrypted_api_secret,
                new.encrypted_private_key,
                new.wallet_address,
                new.vault_index,
                new.requests_per_minute as i64,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                GatewayError::ValidationFailed(format!(
                    "binding '{}' already exists for {} on this account",
                    new.name, new.venue
                ))
            }
            other => GatewayError::Storage(other),
        })?;

        let id = conn.last_insert_rowid();
        let binding = conn.query_row(
            &format!("SELECT {BINDING_COLS} FROM venue_bindings WHERE id = ?1"),
            params![id],
            binding_from_row,
        )?;
        Ok(binding)
    }

    pub async fn get_binding(&self, id: i64) -> Result<Option<VenueBinding>> {
        let conn = self.lock().await;
        let binding = conn
            .query_row(
                &format!("SELECT {BINDING_COLS} FROM venue_bindings WHERE id = ?1"),
                params![id],
                binding_from_row,
            )
            .optional()?;
        Ok(binding)
    }

    pub async fn find_binding(
        &self,
        account_id: i64,
        venue: Venue,
        name: &str,
    ) -> Result<Option<VenueBinding>> {
        let conn = self.lock().await;
        let binding = conn
            .query_row(
                &format!(
                    "SELECT {BINDING_COLS} FROM venue_bindings
                     WHERE account_id = ?1 AND venue = ?2 AND name = ?3"
                ),
                params![account_id, venue.as_str(), name],
                binding_from_row,
            )
            .optional()?;
        Ok(binding)
    }

    pub async fn list_bindings(
        &self,
        account_id: i64,
        venue: Option<Venue>,
        active_only: bool,
    ) -> Result<Vec<VenueBinding>> {
        let conn = self.lock().await;
        let mut sql = format!("SELECT {BINDING_COLS} FROM venue_bindings WHERE account_id = ?1");
        if venue.is_some() {
            sql.push_str(" AND venue = ?2");
        }
        if active_only {
            sql.push_str(" AND is_active = 1");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn.prepare(&sql)?;
        let rows = match venue {
            Some(v) => stmt.query_map(params![account_id, v.as_str()], binding_from_row)?,
            None => stmt.query_map(params![account_id], binding_from_row)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every active binding across all accounts, for reconciler sweeps.
    pub async fn list_active_bindings(&self) -> Result<Vec<VenueBinding>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BINDING_COLS} FROM venue_bindings WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], binding_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Soft delete. The binding's orders and positions remain for audit.
    pub async fn deactivate_binding(&self, id: i64) -> Result<bool> {
        let conn = self.lock().await;
        let changed = conn.execute(
            "UPDATE venue_bindings SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![id, ts(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub async fn update_binding_balances(
        &self,
        id: i64,
        total: f64,
        available: f64,
        margin: f64,
        unrealized_pnl: f64,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE venue_bindings
             SET total_balance = ?2, available_balance = ?3, margin_balance = ?4,
                 unrealized_pnl = ?5, updated_at = ?6
             WHERE id = ?1",
            params![id, total, available, margin, unrealized_pnl, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Sum of cached available balances across a user's active bindings.
    pub async fn available_balance_for_account(&self, account_id: i64) -> Result<f64> {
        let conn = self.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(available_balance), 0.0) FROM venue_bindings
             WHERE account_id = ?1 AND is_active = 1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub async fn total_balance_for_account(&self, account_id: i64) -> Result<f64> {
        let conn = self.lock().await;
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(total_balance), 0.0) FROM venue_bindings
             WHERE account_id = ?1 AND is_active = 1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_account_create_and_fetch() {
        let store = Store::open_in_memory().unwrap();
        let account = store
            .insert_account("alice", "alice@example.com", "hash", 100_000.0, 10.0)
            .await
            .unwrap();
        assert!(account.id > 0);
        assert!(account.is_active);

        let by_email = store
            .get_account_by_email("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, account.id);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_account("a", "dup@example.com", "h", 1.0, 1.0)
            .await
            .unwrap();
        let err = store
            .insert_account("b", "dup@example.com", "h", 1.0, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_binding_unique_per_account_venue_name() {
        let store = Store::open_in_memory().unwrap();
        let account = store
            .insert_account("a", "a@example.com", "h", 1.0, 1.0)
            .await
            .unwrap();

        let new = NewBinding {
            account_id: account.id,
            venue: Venue::Mock,
            name: "main".to_string(),
            testnet: true,
            encrypted_api_key: None,
            encrypted_api_secret: None,
            encrypted_private_key: Some("ct".to_string()),
            wallet_address: None,
            vault_index: None,
            requests_per_minute: 60,
        };
        store.insert_binding(&new).await.unwrap();
        let err = store.insert_binding(&new).await.unwrap_err();
        assert!(matches!(err, GatewayError::ValidationFailed(_)));

        // Same name on another venue is fine.
        let mut other = new.clone();
        other.venue = Venue::Hyperliquid;
        store.insert_binding(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_delete_and_balance_aggregation() {
        let store = Store::open_in_memory().unwrap();
        let account = store
            .insert_account("a", "a@example.com", "h", 1.0, 1.0)
            .await
            .unwrap();
        let b1 = store
            .insert_binding(&NewBinding {
                account_id: account.id,
                venue: Venue::Mock,
                name: "one".to_string(),
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
        store
            .update_binding_balances(b1.id, 10_000.0, 8_000.0, 2_000.0, 0.0)
            .await
            .unwrap();

        assert_eq!(
            store.available_balance_for_account(account.id).await.unwrap(),
            8_000.0
        );

        store.deactivate_binding(b1.id).await.unwrap();
        assert_eq!(
            store.available_balance_for_account(account.id).await.unwrap(),
            0.0
        );
        let active = store.list_bindings(account.id, None, true).await.unwrap();
        assert!(active.is_empty());
        let all = store.list_bindings(account.id, None, false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);
    }
}
