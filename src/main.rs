//! PerpGate - Multi-Venue Perp Trading Gateway
//! Mission: One control plane for orders, positions and risk across
//! heterogeneous perp DEXes

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perpgate_backend::accounts::AccountManager;
use perpgate_backend::config::Config;
use perpgate_backend::connectors::{ConnectorRegistry, Credentials};
use perpgate_backend::executor::OrderExecutor;
use perpgate_backend::notify::NotificationBus;
use perpgate_backend::risk::{RiskEngine, RiskLimits};
use perpgate_backend::store::Store;
use perpgate_backend::tracker::PositionTracker;
use perpgate_backend::vault::CredentialVault;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("configuration error")?;
    info!(env = ?config.env, "perpgate starting");

    let store = Store::open(&config.database).context("failed to open store")?;
    let vault = Arc::new(CredentialVault::new(&config.security.encryption_key));
    let registry = Arc::new(ConnectorRegistry::new(
        config.venues.clone(),
        config.dispatch_timeout(),
    ));
    let notifier = Arc::new(NotificationBus::default());
    let tracker = Arc::new(PositionTracker::new(store.clone(), Arc::clone(&notifier)));
    let risk = Arc::new(RiskEngine::new(
        store.clone(),
        Arc::clone(&notifier),
        RiskLimits {
            max_position_size_usd: config.risk.max_position_size_usd,
            max_leverage: config.risk.max_leverage,
            ..Default::default()
        },
        config.risk.monitor_interval_secs,
        config.risk.margin_call_ratio,
    ));
    let executor = Arc::new(OrderExecutor::new(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&vault),
        Arc::clone(&risk),
        Arc::clone(&tracker),
        Arc::clone(&notifier),
        config.dispatch_timeout(),
        config.order_mgmt.order_expiry_seconds,
        config.order_mgmt.max_orders_per_account,
    ));
    risk.bind_executor(&executor);

    let accounts = Arc::new(AccountManager::new(
        store.clone(),
        Arc::clone(&vault),
        Arc::clone(&registry),
        config.risk.max_position_size_usd,
        config.risk.max_leverage,
    ));

    info!(
        venues = ?registry.available_venues(),
        "gateway core initialized"
    );

    // Start risk monitoring for every account with an active binding.
    let bindings = store.list_active_bindings().await?;
    let mut monitored = std::collections::HashSet::new();
    for binding in &bindings {
        if monitored.insert(binding.account_id) {
            risk.monitor(binding.account_id);
        }
    }

    // Background reconciler: venue state is authoritative for orders and
    // positions; cached balances refresh alongside.
    let reconciler = tokio::spawn(reconcile_loop(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&vault),
        Arc::clone(&executor),
        Arc::clone(&tracker),
        Arc::clone(&accounts),
    ));

    info!("perpgate running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    reconciler.abort();
    risk.stop_all_monitors();
    Ok(())
}

async fn reconcile_loop(
    store: Store,
    registry: Arc<ConnectorRegistry>,
    vault: Arc<CredentialVault>,
    executor: Arc<OrderExecutor>,
    tracker: Arc<PositionTracker>,
    accounts: Arc<AccountManager>,
) {
    let mut ticker = interval(RECONCILE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let bindings = match store.list_active_bindings().await {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(error = %e, "reconciler could not list bindings");
                continue;
            }
        };

        for binding in bindings {
            if let Err(e) = executor.sync_orders(binding.id).await {
                warn!(binding_id = binding.id, error = %e, "order sync failed");
            }

            let credentials = match Credentials::decrypt(&binding, &vault) {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!(binding_id = binding.id, error = %e, "credential decrypt failed");
                    continue;
                }
            };
            match registry.connector_for(&binding, &credentials).await {
                Ok(connector) => {
                    if let Err(e) = tracker.sync_positions(&binding, connector.as_ref()).await {
                        warn!(binding_id = binding.id, error = %e, "position sync failed");
                    }
                }
                Err(e) => {
                    warn!(binding_id = binding.id, error = %e, "connector unavailable");
                }
            }

            if let Err(e) = accounts.refresh_balances(binding.id).await {
                warn!(binding_id = binding.id, error = %e, "balance refresh failed");
            }
        }

        if let Err(e) = executor.expire_stale_orders().await {
            warn!(error = %e, "order expiry sweep failed");
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
