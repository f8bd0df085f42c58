//! Account Manager
//! Mission: Accounts and venue bindings, with secrets encrypted through
//! the vault and credentials validated against the venue before storage

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::auth;
use crate::connectors::{ConnectorRegistry, Credentials};
use crate::error::{GatewayError, Result};
use crate::models::{Account, Venue, VenueBinding};
use crate::store::{NewBinding, Store};
use crate::vault::CredentialVault;

/// Plaintext secrets as submitted by the client. Short-lived; encrypted
/// before they ever reach the store.
#[derive(Clone, Default)]
pub struct BindingSecrets {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub private_key: Option<String>,
    pub wallet_address: Option<String>,
    pub vault_index: Option<i64>,
}

impl std::fmt::Debug for BindingSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingSecrets")
            .field("wallet_address", &self.wallet_address)
            .field("vault_index", &self.vault_index)
            .finish_non_exhaustive()
    }
}

pub struct AccountManager {
    store: Store,
    vault: Arc<CredentialVault>,
    registry: Arc<ConnectorRegistry>,
    default_max_position_usd: f64,
    default_max_leverage: f64,
}

impl AccountManager {
    pub fn new(
        store: Store,
        vault: Arc<CredentialVault>,
        registry: Arc<ConnectorRegistry>,
        default_max_position_usd: f64,
        default_max_leverage: f64,
    ) -> Self {
        Self {
            store,
            vault,
            registry,
            default_max_position_usd,
            default_max_leverage,
        }
    }

    /// Register a new account. Email is unique; the password is stored as
    /// a bcrypt hash only.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<Account> {
        if password.len() < 8 {
            return Err(GatewayError::ValidationFailed(
                "password must be at least 8 characters".to_string(),
            ));
        }
        let password_hash = auth::hash_password(password)?;
        let account = self
            .store
            .insert_account(
                name,
                email,
                &password_hash,
                self.default_max_position_usd,
                self.default_max_leverage,
            )
            .await?;
        info!(account_id = account.id, email = %email, "account registered");
        Ok(account)
    }

    /// Verify email + password, returning the account.
    pub async fn login(&self, email: &str, password: &str) -> Result<Account> {
        let account = self
            .store
            .get_account_by_email(email)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| {
                GatewayError::AuthenticationFailed("unknown email or password".to_string())
            })?;
        if !auth::verify_password(password, &account.password_hash) {
            return Err(GatewayError::AuthenticationFailed(
                "unknown email or password".to_string(),
            ));
        }
        Ok(account)
    }

    /// Add a venue binding. Credentials are validated against the venue
    /// (authenticate + account probe) before being encrypted and stored;
    /// the probe also seeds the cached balances.
    pub async fn add_binding(
        &self,
        account_id: i64,
        venue: Venue,
        name: &str,
        secrets: BindingSecrets,
        testnet: bool,
        requests_per_minute: u32,
    ) -> Result<VenueBinding> {
        if self
            .store
            .find_binding(account_id, venue, name)
            .await?
            .is_some()
        {
            return Err(GatewayError::ValidationFailed(format!(
                "binding '{name}' already exists for {venue}"
            )));
        }

        let credentials = Credentials {
            api_key: secrets.api_key.clone(),
            api_secret: secrets.api_secret.clone(),
            private_key: secrets.private_key.clone(),
            wallet_address: secrets.wallet_address.clone(),
            vault: secrets.vault_index,
            testnet,
        };
        let snapshot = self.validate_credentials(venue, &credentials, testnet, requests_per_minute).await?;

        let new = NewBinding {
            account_id,
            venue,
            name: name.to_string(),
            testnet,
            encrypted_api_key: self.vault.encrypt_opt(secrets.api_key.as_deref())?,
            encrypted_api_secret: self.vault.encrypt_opt(secrets.api_secret.as_deref())?,
            encrypted_private_key: self.vault.encrypt_opt(secrets.private_key.as_deref())?,
            wallet_address: secrets.wallet_address,
            vault_index: secrets.vault_index,
            requests_per_minute,
        };
        let binding = self.store.insert_binding(&new).await?;
        self.store
            .update_binding_balances(
                binding.id,
                snapshot.0,
                snapshot.1,
                snapshot.2,
                snapshot.3,
            )
            .await?;

        info!(
            binding_id = binding.id,
            account_id,
            venue = %venue,
            testnet,
            "venue binding added"
        );
        self.store
            .get_binding(binding.id)
            .await?
            .ok_or_else(|| GatewayError::Internal("binding vanished after insert".to_string()))
    }

    /// Probe a venue with candidate credentials. Returns (total, available,
    /// margin, unrealized) on success.
    pub async fn validate_credentials(
        &self,
        venue: Venue,
        credentials: &Credentials,
        testnet: bool,
        requests_per_minute: u32,
    ) -> Result<(f64, f64, f64, f64)> {
        let connector = self.registry.create(venue, testnet, requests_per_minute)?;
        connector.connect().await?;
        connector.authenticate(credentials).await.map_err(|e| {
            GatewayError::AuthenticationFailed(format!("credential validation failed: {e}"))
        })?;
        let info = connector.get_account_info().await?;
        let _ = connector.disconnect().await;
        Ok((
            info.total_balance,
            info.available_balance,
            info.margin_balance,
            info.unrealized_pnl,
        ))
    }

    pub async fn get_binding(&self, binding_id: i64) -> Result<VenueBinding> {
        self.store
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| GatewayError::ValidationFailed(format!("no binding {binding_id}")))
    }

    pub async fn list_bindings(
        &self,
        account_id: i64,
        venue: Option<Venue>,
        active_only: bool,
    ) -> Result<Vec<VenueBinding>> {
        self.store.list_bindings(account_id, venue, active_only).await
    }

    /// Soft delete; the connector instance is evicted so no further
    /// dispatch can reach the venue with stale credentials.
    pub async fn deactivate_binding(&self, account_id: i64, binding_id: i64) -> Result<()> {
        let binding = self.get_binding(binding_id).await?;
        if binding.account_id != account_id {
            return Err(GatewayError::ValidationFailed(format!(
                "binding {binding_id} does not belong to account {account_id}"
            )));
        }
        self.store.deactivate_binding(binding_id).await?;
        self.registry.evict(binding_id).await;
        info!(binding_id, account_id, "binding deactivated");
        Ok(())
    }

    /// Decrypt a binding's secrets into a request-scoped bundle.
    pub fn credentials(&self, binding: &VenueBinding) -> Result<Credentials> {
        Credentials::decrypt(binding, &self.vault)
    }

    /// Refresh a binding's cached balances from the venue.
    pub async fn refresh_balances(&self, binding_id: i64) -> Result<()> {
        let binding = self.get_binding(binding_id).await?;
        if !binding.is_active {
            return Ok(());
        }
        let credentials = self.credentials(&binding)?;
        let connector = self.registry.connector_for(&binding, &credentials).await?;
        match connector.get_account_info().await {
            Ok(info) => {
                self.store
                    .update_binding_balances(
                        binding_id,
                        info.total_balance,
                        info.available_balance,
                        info.margin_balance,
                        info.unrealized_pnl,
                    )
                    .await?;
            }
            Err(e) => {
                warn!(binding_id, error = %e, "balance refresh failed, keeping cache");
            }
        }
        Ok(())
    }

    /// Cached balances aggregated per venue and in total.
    pub async fn total_balance(&self, account_id: i64) -> Result<(HashMap<Venue, f64>, f64)> {
        let bindings = self.list_bindings(account_id, None, true).await?;
        let mut by_venue: HashMap<Venue, f64> = HashMap::new();
        let mut total = 0.0;
        for binding in bindings {
            *by_venue.entry(binding.venue).or_insert(0.0) += binding.total_balance;
            total += binding.total_balance;
        }
        Ok((by_venue, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueConfig;
    use std::time::Duration;

    fn manager() -> AccountManager {
        let store = Store::open_in_memory().unwrap();
        let vault = Arc::new(CredentialVault::new(b"0123456789abcdef0123456789abcdef"));
        let registry = Arc::new(ConnectorRegistry::new(
            test_venue_config(),
            Duration::from_secs(5),
        ));
        AccountManager::new(store, vault, registry, 100_000.0, 10.0)
    }

    fn test_venue_config() -> VenueConfig {
        VenueConfig::default()
    }


    #[tokio::test]
    async fn test_register_and_login() {
        let manager = manager();
        let account = manager
            .register("alice", "alice@example.com", "correct-horse")
            .await
            .unwrap();
        assert!(account.is_active);

        let logged_in = manager
            .login("alice@example.com", "correct-horse")
            .await
            .unwrap();
        assert_eq!(logged_in.id, account.id);

        assert!(matches!(
            manager.login("alice@example.com", "wrong").await,
            Err(GatewayError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            manager.login("nobody@example.com", "x").await,
            Err(GatewayError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_short_password_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.register("a", "a@example.com", "short").await,
            Err(GatewayError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_add_binding_encrypts_secrets_and_seeds_balance() {
        let manager = manager();
        let account = manager
            .register("alice", "alice@example.com", "correct-horse")
            .await
            .unwrap();

        let binding = manager
            .add_binding(
                account.id,
                Venue::Mock,
                "main",
                BindingSecrets {
                    private_key: Some("0xsecret".to_string()),
                    ..Default::default()
                },
                true,
                60,
            )
            .await
            .unwrap();

        // Stored ciphertext, not the plaintext.
        let stored = binding.encrypted_private_key.clone().unwrap();
        assert_ne!(stored, "0xsecret");
        // Mock venue seeds a 10k balance.
        assert!(binding.total_balance > 0.0);

        // Round-trips through the vault.
        let creds = manager.credentials(&binding).unwrap();
        assert_eq!(creds.private_key.as_deref(), Some("0xsecret"));

        // Duplicate name on the same venue is rejected.
        assert!(matches!(
            manager
                .add_binding(
                    account.id,
                    Venue::Mock,
                    "main",
                    BindingSecrets::default(),
                    true,
                    60,
                )
                .await,
            Err(GatewayError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivated_binding_ownership_checked() {
        let manager = manager();
        let alice = manager
            .register("alice", "alice@example.com", "correct-horse")
            .await
            .unwrap();
        let bob = manager
            .register("bob", "bob@example.com", "correct-horse")
            .await
            .unwrap();
        let binding = manager
            .add_binding(
                alice.id,
                Venue::Mock,
                "main",
                BindingSecrets::default(),
                true,
                60,
            )
            .await
            .unwrap();

        assert!(manager
            .deactivate_binding(bob.id, binding.id)
            .await
            .is_err());
        manager.deactivate_binding(alice.id, binding.id).await.unwrap();
        let reloaded = manager.get_binding(binding.id).await.unwrap();
        assert!(!reloaded.is_active);
    }

    #[tokio::test]
    async fn test_total_balance_aggregation() {
        let manager = manager();
        let account = manager
            .register("alice", "alice@example.com", "correct-horse")
            .await
            .unwrap();
        manager
            .add_binding(account.id, Venue::Mock, "one", BindingSecrets::default(), true, 60)
            .await
            .unwrap();
        manager
            .add_binding(account.id, Venue::Mock, "two", BindingSecrets::default(), true, 60)
            .await
            .unwrap();

        let (by_venue, total) = manager.total_balance(account.id).await.unwrap();
        assert_eq!(by_venue.len(), 1);
        assert!(total >= 20_000.0 - 1.0);
    }
}
