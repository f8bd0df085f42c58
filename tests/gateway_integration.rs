//! End-to-end gateway scenarios against the mock venue: the full
//! validate → risk → persist → dispatch → track pipeline without HTTP.

use std::sync::Arc;
use std::time::Duration;

use perpgate_backend::accounts::{AccountManager, BindingSecrets};
use perpgate_backend::config::VenueConfig;
use perpgate_backend::connectors::mock::MockConnector;
use perpgate_backend::connectors::{
    ConnectorConfig, ConnectorRegistry, Credentials, ModifyRequest, PlaceOrderRequest,
    VenueConnector,
};
use perpgate_backend::executor::OrderExecutor;
use perpgate_backend::models::{
    OrderSide, OrderStatus, PositionSide, PositionStatus, Venue,
};
use perpgate_backend::notify::{NotificationBus, NotificationKind, NotificationPriority};
use perpgate_backend::risk::{RiskEngine, RiskLimits};
use perpgate_backend::store::Store;
use perpgate_backend::tracker::{LiquidationAlertLevel, PositionTracker, PositionUpdate};
use perpgate_backend::vault::CredentialVault;
use perpgate_backend::GatewayError;

struct Gateway {
    store: Store,
    accounts: Arc<AccountManager>,
    executor: Arc<OrderExecutor>,
    risk: Arc<RiskEngine>,
    tracker: Arc<PositionTracker>,
    notifier: Arc<NotificationBus>,
    mock: Arc<MockConnector>,
    account_id: i64,
    binding_id: i64,
}

async fn gateway() -> Gateway {
    let store = Store::open_in_memory().unwrap();
    let vault = Arc::new(CredentialVault::new(b"0123456789abcdef0123456789abcdef"));
    let registry = Arc::new(ConnectorRegistry::new(
        VenueConfig::default(),
        Duration::from_secs(5),
    ));
    let notifier = Arc::new(NotificationBus::default());
    let tracker = Arc::new(PositionTracker::new(store.clone(), Arc::clone(&notifier)));
    let risk = Arc::new(RiskEngine::new(
        store.clone(),
        Arc::clone(&notifier),
        RiskLimits::default(),
        30,
        0.8,
    ));
    let executor = Arc::new(OrderExecutor::new(
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&vault),
        Arc::clone(&risk),
        Arc::clone(&tracker),
        Arc::clone(&notifier),
        Duration::from_secs(5),
        86_400,
        100,
    ));
    risk.bind_executor(&executor);

    let accounts = Arc::new(AccountManager::new(
        store.clone(),
        Arc::clone(&vault),
        Arc::clone(&registry),
        100_000.0,
        10.0,
    ));

    let account = accounts
        .register("trader", "trader@example.com", "correct-horse")
        .await
        .unwrap();
    let binding = accounts
        .add_binding(
            account.id,
            Venue::Mock,
            "main",
            BindingSecrets {
                private_key: Some("0xtest-key".to_string()),
                ..Default::default()
            },
            true,
            600,
        )
        .await
        .unwrap();

    // Drive the same connector instance the executor will use so the
    // tests can steer prices and balances.
    let mock = Arc::new(MockConnector::new(ConnectorConfig {
        venue: Venue::Mock,
        testnet: true,
        rest_url: "mock://local".to_string(),
        ws_url: None,
        requests_per_minute: 600,
        request_timeout: Duration::from_secs(5),
    }));
    mock.connect().await.unwrap();
    mock.authenticate(&Credentials::default()).await.unwrap();
    registry.install(binding.id, Arc::clone(&mock) as Arc<dyn VenueConnector>);

    Gateway {
        store,
        accounts,
        executor,
        risk,
        tracker,
        notifier,
        mock,
        account_id: account.id,
        binding_id: binding.id,
    }
}

// Scenario 1: limit buy resting. Order persists as NEW with no fill, no
// position appears, and one MEDIUM order notification is emitted.
#[tokio::test]
async fn limit_buy_rests_with_notification() {
    let g = gateway().await;

    let result = g
        .executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 50_000.0),
        )
        .await
        .unwrap();

    assert_eq!(result.status, OrderStatus::New);
    assert_eq!(result.filled_quantity, 0.0);
    assert!(result.venue_order_id.is_some());

    let positions = g
        .store
        .open_positions_for_account(g.account_id)
        .await
        .unwrap();
    assert!(positions.is_empty());

    let order_events: Vec<_> = g
        .notifier
        .recent(g.account_id, false, 20)
        .into_iter()
        .filter(|n| n.kind == NotificationKind::OrderPlaced)
        .collect();
    assert_eq!(order_events.len(), 1);
    assert_eq!(order_events[0].priority, NotificationPriority::Medium);
}

// Scenario 2: market sell, full fill. Order FILLED at the venue mark, a
// SHORT position opens, and ORDER_FILLED is emitted.
#[tokio::test]
async fn market_sell_fills_and_opens_short() {
    let g = gateway().await;

    let result = g
        .executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::market("ETH-PERP", OrderSide::Sell, 1.5),
        )
        .await
        .unwrap();

    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.filled_quantity, 1.5);
    assert_eq!(result.average_price, Some(3_000.5));

    let position = g
        .store
        .get_open_position(g.binding_id, "ETH-PERP")
        .await
        .unwrap()
        .expect("short position should exist");
    assert_eq!(position.side, PositionSide::Short);
    assert_eq!(position.quantity, 1.5);
    assert_eq!(position.entry_price, 3_000.5);
    assert_eq!(position.status, PositionStatus::Open);

    assert!(g
        .notifier
        .recent(g.account_id, false, 20)
        .iter()
        .any(|n| n.kind == NotificationKind::OrderFilled));
}

// Scenario 3: insufficient balance blocks before dispatch; no NEW order
// row exists and the venue never sees the order.
#[tokio::test]
async fn insufficient_balance_fails_pre_dispatch() {
    let g = gateway().await;
    g.store
        .update_binding_balances(g.binding_id, 100.0, 100.0, 0.0, 0.0)
        .await
        .unwrap();

    let err = g
        .executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 10.0, 50_000.0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InsufficientBalance(_)));

    let all = g
        .store
        .list_orders(g.account_id, None, None, None, 20)
        .await
        .unwrap();
    assert!(all.iter().all(|o| o.status != OrderStatus::New));
    assert!(g.mock.get_open_orders(None).await.unwrap().is_empty());
}

// Scenario 4: leverage above the account cap yields a single violation
// naming the Leverage rule.
#[tokio::test]
async fn leverage_cap_violation_is_isolated() {
    let g = gateway().await;

    let mut request = PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 50_000.0);
    request.leverage = Some(15.0);

    let err = g
        .executor
        .place_order(g.account_id, g.binding_id, request)
        .await
        .unwrap_err();

    match err {
        GatewayError::RiskLimitExceeded { violations } => {
            assert_eq!(violations.len(), 1);
            assert!(violations[0].contains("Leverage"));
        }
        other => panic!("expected RiskLimitExceeded, got {other:?}"),
    }
}

// Scenario 5: cancel-replace modify. The venue cancels the old id and
// issues a new one; the same durable row carries the new identity,
// quantity and price.
#[tokio::test]
async fn modify_swaps_venue_id_on_same_row() {
    let g = gateway().await;

    let placed = g
        .executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 50_000.0),
        )
        .await
        .unwrap();
    let old_id = placed.venue_order_id.clone().unwrap();

    let modified = g
        .executor
        .modify_order(
            g.account_id,
            g.binding_id,
            &old_id,
            ModifyRequest {
                quantity: Some(0.2),
                price: Some(49_000.0),
                stop_price: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(modified.order_id, placed.order_id);
    let new_id = modified.venue_order_id.unwrap();
    assert_ne!(new_id, old_id);

    let row = g.store.get_order(placed.order_id).await.unwrap().unwrap();
    assert_eq!(row.venue_order_id.as_deref(), Some(new_id.as_str()));
    assert_eq!(row.quantity, 0.2);
    assert_eq!(row.price, Some(49_000.0));
    assert_eq!(row.status, OrderStatus::New);

    let venue_old = g.mock.get_order("BTC-PERP", &old_id).await.unwrap();
    assert_eq!(venue_old.status, OrderStatus::Canceled);
}

// Scenario 6: liquidation proximity. LONG 1 BTC, entry 50k, mark 46k,
// liq 45k → one HIGH entry at ≈2.17% distance.
#[tokio::test]
async fn liquidation_distance_reports_high_risk() {
    let g = gateway().await;
    let binding = g.accounts.get_binding(g.binding_id).await.unwrap();

    g.tracker
        .apply_update(
            &binding,
            &PositionUpdate {
                symbol: "BTC-PERP".to_string(),
                size_delta: 1.0,
                mark_price: Some(50_000.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    g.tracker
        .apply_update(
            &binding,
            &PositionUpdate {
                symbol: "BTC-PERP".to_string(),
                size_delta: 0.0,
                mark_price: Some(46_000.0),
                liquidation_price: Some(45_000.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let risks = g.tracker.check_liquidation_risk(g.account_id).await.unwrap();
    assert_eq!(risks.len(), 1);
    let risk = &risks[0];
    assert_eq!(risk.symbol, "BTC-PERP");
    assert!((risk.distance_pct - 2.1739).abs() < 0.01);
    assert_eq!(risk.risk_level, LiquidationAlertLevel::High);
}

// Batch placement is equivalent to placing one by one: each order carries
// its own outcome and a failure does not abort the rest.
#[tokio::test]
async fn batch_matches_sequential_outcomes() {
    let g = gateway().await;

    let mut invalid = PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 50_000.0);
    invalid.price = None;

    let results = g
        .executor
        .place_batch(
            g.account_id,
            g.binding_id,
            vec![
                PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 49_000.0),
                invalid,
                PlaceOrderRequest::limit("ETH-PERP", OrderSide::Buy, 1.0, 2_900.0),
            ],
        )
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(GatewayError::ValidationFailed(_))
    ));
    assert!(results[2].is_ok());
    assert_eq!(g.executor.active_orders(g.account_id).await.unwrap().len(), 2);
}

// Emergency flatten closes everything once and is a no-op right after.
#[tokio::test]
async fn emergency_flatten_idempotent_end_to_end() {
    let g = gateway().await;

    g.executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::market("SOL-PERP", OrderSide::Buy, 5.0),
        )
        .await
        .unwrap();
    g.executor
        .place_order(
            g.account_id,
            g.binding_id,
            PlaceOrderRequest::limit("BTC-PERP", OrderSide::Buy, 0.1, 49_000.0),
        )
        .await
        .unwrap();

    let closed = g.risk.emergency_close_all(g.account_id).await.unwrap();
    assert_eq!(closed, 1);
    assert!(g
        .store
        .open_positions_for_account(g.account_id)
        .await
        .unwrap()
        .is_empty());
    assert!(g.executor.active_orders(g.account_id).await.unwrap().is_empty());

    assert_eq!(g.risk.emergency_close_all(g.account_id).await.unwrap(), 0);
}

// Reconciliation: the venue snapshot is authoritative for both orders and
// positions, including the stale-close of locally-open symbols.
#[tokio::test]
async fn reconciliation_adopts_venue_state() {
    let g = gateway().await;
    let binding = g.accounts.get_binding(g.binding_id).await.unwrap();

    // Venue-only resting order.
    g.mock
        .place_order(&PlaceOrderRequest::limit(
            "BTC-PERP",
            OrderSide::Buy,
            0.05,
            49_000.0,
        ))
        .await
        .unwrap();
    // Local-only open position.
    g.tracker
        .apply_update(
            &binding,
            &PositionUpdate {
                symbol: "DOGE-PERP".to_string(),
                size_delta: 1_000.0,
                mark_price: Some(0.1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(g.executor.sync_orders(g.binding_id).await.unwrap(), 1);
    let mock_ref: &MockConnector = &g.mock;
    g.tracker.sync_positions(&binding, mock_ref).await.unwrap();

    let adopted = g
        .store
        .list_orders(g.account_id, None, Some(OrderStatus::New), None, 10)
        .await
        .unwrap();
    assert_eq!(adopted.len(), 1);

    let stale = g
        .store
        .get_open_position(g.binding_id, "DOGE-PERP")
        .await
        .unwrap();
    assert!(stale.is_none(), "stale position should be closed by sync");
}
