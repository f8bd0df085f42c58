//! Application Configuration
//! Mission: Environment-driven settings with safe defaults; the 32-byte
//! master key is validated at startup and rejection is fatal

use anyhow::{bail, Result};
use std::env;
use std::time::Duration;

use crate::models::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Staging,
    Production,
    Testing,
}

impl AppEnv {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Some(AppEnv::Development),
            "staging" => Some(AppEnv::Staging),
            "production" | "prod" => Some(AppEnv::Production),
            "testing" | "test" => Some(AppEnv::Testing),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, AppEnv::Production)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub secret_key: String,
    pub jwt_algorithm: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
    /// Exactly 32 bytes; feeds the credential vault.
    pub encryption_key: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_size_usd: f64,
    pub max_leverage: f64,
    pub margin_call_ratio: f64,
    pub liquidation_ratio: f64,
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct OrderMgmtConfig {
    pub max_orders_per_account: usize,
    pub order_expiry_seconds: i64,
    pub dispatch_timeout_secs: u64,
}

/// REST + WS endpoints for one venue.
#[derive(Debug, Clone)]
pub struct VenueEndpoints {
    pub rest_url: String,
    pub ws_url: Option<String>,
    pub testnet: bool,
}

/// Stock endpoint set; `Config::from_env` overrides per key.
impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            hyperliquid_mainnet_url: "https://api.hyperliquid.xyz".to_string(),
            hyperliquid_testnet_url: "https://api.hyperliquid-testnet.xyz".to_string(),
            hyperliquid_use_testnet: true,
            lighter_mainnet_url: "https://mainnet.zklighter.elliot.ai".to_string(),
            lighter_use_testnet: false,
            extended_mainnet_url: "https://api.starknet.extended.exchange".to_string(),
            extended_testnet_url: "https://api.starknet.sepolia.extended.exchange".to_string(),
            extended_use_testnet: true,
            edgex_base_url: "https://pro.edgex.exchange".to_string(),
            edgex_ws_url: "wss://quote.edgex.exchange".to_string(),
            vest_production_url: "https://server-prod.hz.vestmarkets.com/v2".to_string(),
            vest_development_url: "https://server-dev.hz.vestmarkets.com/v2".to_string(),
            vest_ws_production_url: "wss://ws-prod.hz.vestmarkets.com/ws-api?version=1.0"
                .to_string(),
            vest_ws_development_url: "wss://ws-dev.hz.vestmarkets.com/ws-api?version=1.0"
                .to_string(),
            vest_use_testnet: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub hyperliquid_mainnet_url: String,
    pub hyperliquid_testnet_url: String,
    pub hyperliquid_use_testnet: bool,
    pub lighter_mainnet_url: String,
    pub lighter_use_testnet: bool,
    pub extended_mainnet_url: String,
    pub extended_testnet_url: String,
    pub extended_use_testnet: bool,
    pub edgex_base_url: String,
    pub edgex_ws_url: String,
    pub vest_production_url: String,
    pub vest_development_url: String,
    pub vest_ws_production_url: String,
    pub vest_ws_development_url: String,
    pub vest_use_testnet: bool,
}

impl VenueConfig {
    /// Resolve endpoints for a venue. `testnet_override` comes from the
    /// binding and wins over the global toggle.
    pub fn endpoints(&self, venue: Venue, testnet_override: Option<bool>) -> VenueEndpoints {
        match venue {
            Venue::Hyperliquid => {
                let testnet = testnet_override.unwrap_or(self.hyperliquid_use_testnet);
                let rest = if testnet {
                    self.hyperliquid_testnet_url.clone()
                } else {
                    self.hyperliquid_mainnet_url.clone()
                };
                let ws = format!("{}/ws", rest.replace("https://", "wss://"));
                VenueEndpoints {
                    rest_url: rest,
                    ws_url: Some(ws),
                    testnet,
                }
            }
            Venue::Lighter => VenueEndpoints {
                rest_url: self.lighter_mainnet_url.clone(),
                ws_url: None,
                testnet: testnet_override.unwrap_or(self.lighter_use_testnet),
            },
            Venue::Extended => {
                let testnet = testnet_override.unwrap_or(self.extended_use_testnet);
                VenueEndpoints {
                    rest_url: if testnet {
                        self.extended_testnet_url.clone()
                    } else {
                        self.extended_mainnet_url.clone()
                    },
                    ws_url: None,
                    testnet,
                }
            }
            Venue::Edgex => VenueEndpoints {
                rest_url: self.edgex_base_url.clone(),
                ws_url: Some(self.edgex_ws_url.clone()),
                testnet: testnet_override.unwrap_or(false),
            },
            Venue::Vest => {
                let testnet = testnet_override.unwrap_or(self.vest_use_testnet);
                let (rest, ws) = if testnet {
                    (
                        self.vest_development_url.clone(),
                        self.vest_ws_development_url.clone(),
                    )
                } else {
                    (
                        self.vest_production_url.clone(),
                        self.vest_ws_production_url.clone(),
                    )
                };
                VenueEndpoints {
                    rest_url: rest,
                    ws_url: Some(ws),
                    testnet,
                }
            }
            Venue::Mock => VenueEndpoints {
                rest_url: "mock://local".to_string(),
                ws_url: None,
                testnet: testnet_override.unwrap_or(true),
            },
        }
    }
}

/// Application configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: AppEnv,
    pub database: DatabaseConfig,
    pub security: SecurityConfig,
    pub risk: RiskConfig,
    pub order_mgmt: OrderMgmtConfig,
    pub venues: VenueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let env_tag = env_or("APP_ENV", "development");
        let Some(app_env) = AppEnv::from_str(&env_tag) else {
            bail!("APP_ENV must be one of development, staging, production, testing (got '{env_tag}')");
        };

        let encryption_key_raw = env_or("ENCRYPTION_KEY", "");
        if encryption_key_raw.len() != 32 {
            bail!(
                "ENCRYPTION_KEY must be exactly 32 bytes, got {}; refusing to start",
                encryption_key_raw.len()
            );
        }
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(encryption_key_raw.as_bytes());

        let venue_defaults = VenueConfig::default();

        Ok(Self {
            env: app_env,
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "./perpgate.db"),
                pool_size: parse_or("DATABASE_POOL_SIZE", 20),
                max_overflow: parse_or("DATABASE_MAX_OVERFLOW", 40),
                pool_timeout_secs: parse_or("DATABASE_POOL_TIMEOUT", 30),
            },
            security: SecurityConfig {
                secret_key: env_or("SECRET_KEY", "change-this-in-production"),
                jwt_algorithm: env_or("JWT_ALGORITHM", "HS256"),
                access_token_expire_minutes: parse_or("ACCESS_TOKEN_EXPIRE_MINUTES", 30),
                refresh_token_expire_days: parse_or("REFRESH_TOKEN_EXPIRE_DAYS", 30),
                encryption_key,
            },
            risk: RiskConfig {
                max_position_size_usd: parse_or("RISK_MAX_POSITION_SIZE_USD", 100_000.0),
                max_leverage: parse_or("RISK_MAX_LEVERAGE", 10.0),
                margin_call_ratio: parse_or("RISK_MARGIN_CALL_RATIO", 0.8),
                liquidation_ratio: parse_or("RISK_LIQUIDATION_RATIO", 0.95),
                monitor_interval_secs: parse_or("RISK_MONITOR_INTERVAL_SECS", 30),
            },
            order_mgmt: OrderMgmtConfig {
                max_orders_per_account: parse_or("MAX_ORDERS_PER_ACCOUNT", 100),
                order_expiry_seconds: parse_or("ORDER_EXPIRY_SECONDS", 86_400),
                dispatch_timeout_secs: parse_or("ORDER_DISPATCH_TIMEOUT_SECS", 30),
            },
            venues: VenueConfig {
                hyperliquid_mainnet_url: env_or(
                    "HYPERLIQUID_MAINNET_URL",
                    &venue_defaults.hyperliquid_mainnet_url,
                ),
                hyperliquid_testnet_url: env_or(
                    "HYPERLIQUID_TESTNET_URL",
                    &venue_defaults.hyperliquid_testnet_url,
                ),
                hyperliquid_use_testnet: parse_or("HYPERLIQUID_USE_TESTNET", true),
                lighter_mainnet_url: env_or(
                    "LIGHTER_MAINNET_URL",
                    &venue_defaults.lighter_mainnet_url,
                ),
                lighter_use_testnet: parse_or("LIGHTER_USE_TESTNET", false),
                extended_mainnet_url: env_or(
                    "EXTENDED_MAINNET_URL",
                    &venue_defaults.extended_mainnet_url,
                ),
                extended_testnet_url: env_or(
                    "EXTENDED_TESTNET_URL",
                    &venue_defaults.extended_testnet_url,
                ),
                extended_use_testnet: parse_or("EXTENDED_USE_TESTNET", true),
                edgex_base_url: env_or("EDGEX_BASE_URL", &venue_defaults.edgex_base_url),
                edgex_ws_url: env_or("EDGEX_WS_URL", &venue_defaults.edgex_ws_url),
                vest_production_url: env_or(
                    "VEST_PRODUCTION_URL",
                    &venue_defaults.vest_production_url,
                ),
                vest_development_url: env_or(
                    "VEST_DEVELOPMENT_URL",
                    &venue_defaults.vest_development_url,
                ),
                vest_ws_production_url: env_or(
                    "VEST_WS_PRODUCTION_URL",
                    &venue_defaults.vest_ws_production_url,
                ),
                vest_ws_development_url: env_or(
                    "VEST_WS_DEVELOPMENT_URL",
                    &venue_defaults.vest_ws_development_url,
                ),
                vest_use_testnet: parse_or("VEST_USE_TESTNET", true),
            },
        })
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.order_mgmt.dispatch_timeout_secs)
    }

    pub fn is_production(&self) -> bool {
        self.env.is_production()
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: both cases mutate the same process-wide env var and
    // must not interleave with each other under the parallel test runner.
    #[test]
    fn test_encryption_key_validation_and_defaults() {
        std::env::set_var("ENCRYPTION_KEY", "too-short");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("32 bytes"));

        std::env::set_var("ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef");
        let config = Config::from_env().unwrap();
        assert_eq!(config.risk.max_leverage, 10.0);
        assert_eq!(config.order_mgmt.max_orders_per_account, 100);
        assert_eq!(config.database.pool_size, 20);

        let hl = config.venues.endpoints(Venue::Hyperliquid, Some(false));
        assert_eq!(hl.rest_url, "https://api.hyperliquid.xyz");
        assert!(!hl.testnet);
        let hl_test = config.venues.endpoints(Venue::Hyperliquid, Some(true));
        assert!(hl_test.rest_url.contains("testnet"));
        std::env::remove_var("ENCRYPTION_KEY");
    }
}
