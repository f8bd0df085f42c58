//! Connector Registry
//! Venue tag → constructor, populated at startup. Instances are built per
//! (venue, binding, testnet), wrapped in the market-data cache layer, and
//! reused across calls for the same binding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::cache::{CacheTtls, CachedConnector};
use super::extended::ExtendedConnector;
use super::hyperliquid::HyperliquidConnector;
use super::lighter::LighterConnector;
use super::mock::MockConnector;
use super::{ConnectorConfig, Credentials, VenueConnector};
use crate::config::VenueConfig;
use crate::error::{GatewayError, Result};
use crate::models::{Venue, VenueBinding};

type Constructor = fn(ConnectorConfig) -> Arc<dyn VenueConnector>;

pub struct ConnectorRegistry {
    venues: VenueConfig,
    request_timeout: Duration,
    constructors: HashMap<Venue, Constructor>,
    /// Authenticated connectors keyed by binding id.
    live: RwLock<HashMap<i64, Arc<dyn VenueConnector>>>,
}

impl ConnectorRegistry {
    /// Build the registry with every available venue registered.
    pub fn new(venues: VenueConfig, request_timeout: Duration) -> Self {
        let mut registry = Self {
            venues,
            request_timeout,
            constructors: HashMap::new(),
            live: RwLock::new(HashMap::new()),
        };
        registry.register(Venue::Hyperliquid, |config| {
            Arc::new(HyperliquidConnector::new(config))
        });
        registry.register(Venue::Lighter, |config| {
            Arc::new(LighterConnector::new(config))
        });
        registry.register(Venue::Extended, |config| {
            Arc::new(ExtendedConnector::new(config))
        });
        registry.register(Venue::Mock, |config| Arc::new(MockConnector::new(config)));
        // edgex and vest are recognized tags without connectors yet;
        // lookups report UnsupportedVenue.
        info!(venues = registry.constructors.len(), "connector registry built");
        registry
    }

    pub fn register(&mut self, venue: Venue, constructor: Constructor) {
        self.constructors.insert(venue, constructor);
    }

    pub fn available_venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.constructors.keys().copied().collect();
        venues.sort_by_key(|v| v.as_str());
        venues
    }

    pub fn is_available(&self, venue: Venue) -> bool {
        self.constructors.contains_key(&venue)
    }

    /// Construct a bare (unauthenticated, uncached) connector instance.
    pub fn create(&self, venue: Venue, testnet: bool, requests_per_minute: u32) -> Result<Arc<dyn VenueConnector>> {
        let constructor = self
            .constructors
            .get(&venue)
            .ok_or_else(|| GatewayError::UnsupportedVenue(venue.as_str().to_string()))?;

        let endpoints = self.venues.endpoints(venue, Some(testnet));
        let config = ConnectorConfig {
            venue,
            testnet: endpoints.testnet,
            rest_url: endpoints.rest_url,
            ws_url: endpoints.ws_url,
            requests_per_minute,
            request_timeout: self.request_timeout,
        };
        Ok(constructor(config))
    }

    /// Connected + authenticated connector for a binding, behind the
    /// response cache. Instances are memoized per binding id; a racing
    /// second construction is harmless and the first insert wins.
    pub async fn connector_for(
        &self,
        binding: &VenueBinding,
        credentials: &Credentials,
    ) -> Result<Arc<dyn VenueConnector>> {
        if let Some(existing) = self.live.read().get(&binding.id) {
            return Ok(Arc::clone(existing));
        }

        let inner = self.create(binding.venue, binding.testnet, binding.requests_per_minute)?;
        let connector: Arc<dyn VenueConnector> =
            Arc::new(CachedConnector::new(inner, CacheTtls::default()));
        connector.connect().await?;
        connector.authenticate(credentials).await?;

        let mut live = self.live.write();
        let entry = live
            .entry(binding.id)
            .or_insert_with(|| Arc::clone(&connector));
        debug!(binding_id = binding.id, venue = %binding.venue, "connector ready");
        Ok(Arc::clone(entry))
    }

    /// Install a pre-built connector for a binding, bypassing the
    /// construct/connect/authenticate path. Used by tests and by callers
    /// that wire their own instances.
    pub fn install(&self, binding_id: i64, connector: Arc<dyn VenueConnector>) {
        self.live.write().insert(binding_id, connector);
    }

    /// Drop a memoized connector (binding deactivated or re-keyed).
    pub async fn evict(&self, binding_id: i64) {
        let connector = self.live.write().remove(&binding_id);
        if let Some(connector) = connector {
            let _ = connector.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Venue;

    fn venue_config() -> VenueConfig {
        VenueConfig::default()
    }


    #[test]
    fn test_all_implemented_venues_registered() {
        let registry = ConnectorRegistry::new(venue_config(), Duration::from_secs(5));
        assert!(registry.is_available(Venue::Mock));
        assert!(registry.is_available(Venue::Hyperliquid));
        assert!(registry.is_available(Venue::Lighter));
        assert!(registry.is_available(Venue::Extended));
        assert!(!registry.is_available(Venue::Edgex));
        assert!(!registry.is_available(Venue::Vest));
    }

    #[test]
    fn test_unregistered_venue_is_reported() {
        let registry = ConnectorRegistry::new(venue_config(), Duration::from_secs(5));
        match registry.create(Venue::Vest, false, 60) {
            Err(GatewayError::UnsupportedVenue(name)) => assert_eq!(name, "vest"),
            Err(e) => panic!("expected UnsupportedVenue, got Err({e:?})"),
            Ok(_) => panic!("expected UnsupportedVenue, got Ok"),
        }
    }

    #[tokio::test]
    async fn test_connector_memoized_per_binding() {
        use chrono::Utc;
        let registry = ConnectorRegistry::new(venue_config(), Duration::from_secs(5));
        let binding = VenueBinding {
            id: 1,
            account_id: 1,
            venue: Venue::Mock,
            name: "main".to_string(),
            testnet: true,
            is_active: true,
            encrypted_api_key: None,
            encrypted_api_secret: None,
            encrypted_private_key: None,
            wallet_address: None,
            vault_index: None,
            total_balance: 0.0,
            available_balance: 0.0,
            margin_balance: 0.0,
            unrealized_pnl: 0.0,
            requests_per_minute: 600,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let creds = Credentials::default();
        let a = registry.connector_for(&binding, &creds).await.unwrap();
        let b = registry.connector_for(&binding, &creds).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.evict(binding.id).await;
        let c = registry.connector_for(&binding, &creds).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
