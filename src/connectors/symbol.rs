//! Symbol Normalization
//! The gateway speaks `BASE-PERP`; each venue keeps a bidirectional map to
//! its native identifier (string name or integer market id).

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{GatewayError, Result};

/// Canonicalize arbitrary user input into `BASE-PERP` form.
pub fn canonical(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    if upper.ends_with("-PERP") {
        upper
    } else if let Some(base) = upper.strip_suffix("-USD") {
        format!("{base}-PERP")
    } else if let Some(base) = upper.strip_suffix("/USD") {
        format!("{base}-PERP")
    } else {
        format!("{upper}-PERP")
    }
}

/// Strip the canonical suffix down to the bare base asset ("BTC").
pub fn base_asset(symbol: &str) -> String {
    canonical(symbol)
        .strip_suffix("-PERP")
        .unwrap_or(symbol)
        .to_string()
}

/// Bidirectional map between canonical symbols and venue-native names.
/// Built once at connect time from the venue's catalog; reads are lock-free
/// in the common case via a short `RwLock` snapshot.
#[derive(Default)]
pub struct SymbolMap {
    inner: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    to_native: HashMap<String, String>,
    to_canonical: HashMap<String, String>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, canonical_symbol: &str, native: &str) {
        let mut maps = self.inner.write();
        maps.to_native
            .insert(canonical_symbol.to_uppercase(), native.to_string());
        maps.to_canonical
            .insert(native.to_string(), canonical_symbol.to_uppercase());
    }

    pub fn len(&self) -> usize {
        self.inner.read().to_native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().to_native.is_empty()
    }

    /// Canonical → native. Fails for symbols absent from the catalog.
    pub fn native(&self, symbol: &str) -> Result<String> {
        let key = canonical(symbol);
        self.inner
            .read()
            .to_native
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                GatewayError::ValidationFailed(format!("unknown symbol '{symbol}'"))
            })
    }

    /// Native → canonical. Unknown native names map through `canonical`
    /// so reconciliation never drops venue rows on the floor.
    pub fn canonical_for(&self, native: &str) -> String {
        self.inner
            .read()
            .to_canonical
            .get(native)
            .cloned()
            .unwrap_or_else(|| canonical(native))
    }
}

/// Integer-keyed variant for venues addressing markets by id.
#[derive(Default)]
pub struct MarketIdMap {
    inner: RwLock<IdMaps>,
}

#[derive(Default)]
struct IdMaps {
    to_id: HashMap<String, u32>,
    to_symbol: HashMap<u32, String>,
}

impl MarketIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, canonical_symbol: &str, market_id: u32) {
        let mut maps = self.inner.write();
        maps.to_id.insert(canonical_symbol.to_uppercase(), market_id);
        maps.to_symbol
            .insert(market_id, canonical_symbol.to_uppercase());
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().to_id.is_empty()
    }

    pub fn market_id(&self, symbol: &str) -> Result<u32> {
        let key = canonical(symbol);
        self.inner.read().to_id.get(&key).copied().ok_or_else(|| {
            GatewayError::ValidationFailed(format!("unknown symbol '{symbol}'"))
        })
    }

    pub fn symbol(&self, market_id: u32) -> Option<String> {
        self.inner.read().to_symbol.get(&market_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_forms() {
        assert_eq!(canonical("btc-perp"), "BTC-PERP");
        assert_eq!(canonical("BTC"), "BTC-PERP");
        assert_eq!(canonical("eth-usd"), "ETH-PERP");
        assert_eq!(canonical("sol/usd"), "SOL-PERP");
        assert_eq!(base_asset("BTC-PERP"), "BTC");
    }

    #[test]
    fn test_round_trip_through_map() {
        let map = SymbolMap::new();
        map.insert("BTC-PERP", "BTC");
        map.insert("ETH-PERP", "ETH-USD");

        assert_eq!(map.native("btc-perp").unwrap(), "BTC");
        assert_eq!(map.canonical_for("ETH-USD"), "ETH-PERP");
        assert!(map.native("DOGE-PERP").is_err());
        // Unknown native names still normalize.
        assert_eq!(map.canonical_for("XRP"), "XRP-PERP");
    }

    #[test]
    fn test_market_id_map() {
        let map = MarketIdMap::new();
        map.insert("BTC-PERP", 1);
        map.insert("ETH-PERP", 2);
        assert_eq!(map.market_id("BTC-PERP").unwrap(), 1);
        assert_eq!(map.symbol(2).as_deref(), Some("ETH-PERP"));
        assert!(map.market_id("SOL-PERP").is_err());
    }
}
