//! Market Data Service
//! Mission: Aggregate quotes, books and funding across venues through the
//! cached connector layer; no credentials required for public reads

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::connectors::cache::{CacheTtls, CachedConnector};
use crate::connectors::symbol::canonical;
use crate::connectors::{
    ConnectorRegistry, FundingInfo, MarketSnapshot, OrderBookSnapshot, VenueConnector,
};
use crate::error::{GatewayError, Result};
use crate::models::Venue;

/// Cross-venue view of one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMarket {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Highest bid across venues.
    pub best_bid: Option<(Venue, f64)>,
    /// Lowest ask across venues.
    pub best_ask: Option<(Venue, f64)>,
    pub avg_price: f64,
    pub total_volume_24h: f64,
    pub avg_funding_rate: f64,
    pub total_open_interest: f64,
    pub venues: HashMap<Venue, MarketSnapshot>,
}

/// Public market-data reads, one unauthenticated connector per venue.
/// Responses come through the registry's TTL cache layer.
pub struct MarketDataService {
    registry: Arc<ConnectorRegistry>,
    connectors: RwLock<HashMap<Venue, Arc<dyn VenueConnector>>>,
}

impl MarketDataService {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            registry,
            connectors: RwLock::new(HashMap::new()),
        }
    }

    async fn connector(&self, venue: Venue) -> Result<Arc<dyn VenueConnector>> {
        if let Some(existing) = self.connectors.read().get(&venue) {
            return Ok(Arc::clone(existing));
        }
        let inner = self.registry.create(venue, false, 120)?;
        let connector: Arc<dyn VenueConnector> =
            Arc::new(CachedConnector::new(inner, CacheTtls::default()));
        connector.connect().await?;
        let mut connectors = self.connectors.write();
        let entry = connectors
            .entry(venue)
            .or_insert_with(|| Arc::clone(&connector));
        Ok(Arc::clone(entry))
    }

    pub async fn market_data(&self, venue: Venue, symbol: &str) -> Result<MarketSnapshot> {
        let connector = self.connector(venue).await?;
        connector.get_market_data(symbol).await
    }

    pub async fn order_book(
        &self,
        venue: Venue,
        symbol: &str,
        depth: usize,
    ) -> Result<OrderBookSnapshot> {
        let connector = self.connector(venue).await?;
        connector.get_order_book(symbol, depth).await
    }

    pub async fn funding_rate(&self, venue: Venue, symbol: &str) -> Result<FundingInfo> {
        let connector = self.connector(venue).await?;
        connector.get_funding_rate(symbol).await
    }

    /// One symbol across several venues. Venues that fail to answer are
    /// skipped with a warning; the aggregate fails only when every venue
    /// does.
    pub async fn aggregate(&self, symbol: &str, venues: &[Venue]) -> Result<AggregatedMarket> {
        let symbol = canonical(symbol);
        let mut per_venue = HashMap::new();

        for &venue in venues {
            match self.market_data(venue, &symbol).await {
                Ok(snapshot) => {
                    per_venue.insert(venue, snapshot);
                }
                Err(e) => {
                    warn!(venue = %venue, symbol = %symbol, error = %e, "venue skipped in aggregate");
                }
            }
        }
        if per_venue.is_empty() {
            return Err(GatewayError::Venue(format!(
                "no venue returned market data for {symbol}"
            )));
        }

        let mut best_bid: Option<(Venue, f64)> = None;
        let mut best_ask: Option<(Venue, f64)> = None;
        let mut price_sum = 0.0;
        let mut total_volume = 0.0;
        let mut funding_sum = 0.0;
        let mut funding_count = 0usize;
        let mut total_oi = 0.0;

        for (&venue, snapshot) in &per_venue {
            if let Some(bid) = snapshot.bid_price {
                if best_bid.map(|(_, px)| bid > px).unwrap_or(true) {
                    best_bid = Some((venue, bid));
                }
            }
            if let Some(ask) = snapshot.ask_price {
                if best_ask.map(|(_, px)| ask < px).unwrap_or(true) {
                    best_ask = Some((venue, ask));
                }
            }
            price_sum += snapshot.last_price;
            total_volume += snapshot.volume_24h;
            if let Some(rate) = snapshot.funding_rate {
                funding_sum += rate;
                funding_count += 1;
            }
            total_oi += snapshot.open_interest.unwrap_or(0.0);
        }

        Ok(AggregatedMarket {
            symbol,
            timestamp: Utc::now(),
            best_bid,
            best_ask,
            avg_price: price_sum / per_venue.len() as f64,
            total_volume_24h: total_volume,
            avg_funding_rate: if funding_count > 0 {
                funding_sum / funding_count as f64
            } else {
                0.0
            },
            total_open_interest: total_oi,
            venues: per_venue,
        })
    }

    /// Funding rates per venue, best (most negative for longs) first.
    pub async fn funding_comparison(
        &self,
        symbol: &str,
        venues: &[Venue],
    ) -> Result<Vec<(Venue, f64)>> {
        let mut rates = Vec::new();
        for &venue in venues {
            match self.funding_rate(venue, symbol).await {
                Ok(info) => rates.push((venue, info.funding_rate)),
                Err(e) => {
                    warn!(venue = %venue, error = %e, "funding comparison skipped venue");
                }
            }
        }
        rates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VenueConfig;
    use std::time::Duration;

    fn service() -> MarketDataService {
        let registry = Arc::new(ConnectorRegistry::new(
            VenueConfig::default(),
            Duration::from_secs(5),
        ));
        MarketDataService::new(registry)
    }

    #[tokio::test]
    async fn test_market_data_through_mock_venue() {
        let service = service();
        let data = service.market_data(Venue::Mock, "BTC-PERP").await.unwrap();
        assert_eq!(data.symbol, "BTC-PERP");
        assert_eq!(data.mark_price, 50_500.0);
        assert!(data.bid_price.unwrap() < data.ask_price.unwrap());
    }

    #[tokio::test]
    async fn test_aggregate_single_venue() {
        let service = service();
        let aggregate = service
            .aggregate("eth-perp", &[Venue::Mock])
            .await
            .unwrap();
        assert_eq!(aggregate.symbol, "ETH-PERP");
        assert_eq!(aggregate.venues.len(), 1);
        let (venue, _) = aggregate.best_bid.unwrap();
        assert_eq!(venue, Venue::Mock);
        assert!(aggregate.avg_price > 0.0);
        assert!(aggregate.total_volume_24h > 0.0);
    }

    #[tokio::test]
    async fn test_aggregate_skips_unsupported_venues() {
        let service = service();
        // vest has no connector; the mock still answers.
        let aggregate = service
            .aggregate("BTC-PERP", &[Venue::Vest, Venue::Mock])
            .await
            .unwrap();
        assert_eq!(aggregate.venues.len(), 1);

        // Nothing answers at all → error.
        let err = service.aggregate("BTC-PERP", &[Venue::Vest]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_funding_comparison_sorted() {
        let service = service();
        let rates = service
            .funding_comparison("BTC-PERP", &[Venue::Mock])
            .await
            .unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].0, Venue::Mock);
    }

    #[tokio::test]
    async fn test_connector_memoized_per_venue() {
        let service = service();
        service.market_data(Venue::Mock, "BTC-PERP").await.unwrap();
        service.market_data(Venue::Mock, "ETH-PERP").await.unwrap();
        assert_eq!(service.connectors.read().len(), 1);
    }
}
