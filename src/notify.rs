//! Notification Bus
//! Mission: Typed order/position/risk events fanned out to subscribers
//! with priority filtering, plus a bounded per-account ring buffer

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// Default ring-buffer capacity per account.
const DEFAULT_RING_CAPACITY: usize = 1000;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    OrderPlaced,
    OrderFilled,
    OrderPartiallyFilled,
    OrderCancelled,
    OrderRejected,
    PositionOpened,
    PositionClosed,
    PositionLiquidated,
    RiskAlert,
    MarginCall,
    PriceAlert,
    SystemAlert,
}

impl NotificationKind {
    /// Preference category gating this kind.
    fn category(&self) -> PrefCategory {
        match self {
            NotificationKind::OrderPlaced
            | NotificationKind::OrderFilled
            | NotificationKind::OrderPartiallyFilled
            | NotificationKind::OrderCancelled
            | NotificationKind::OrderRejected => PrefCategory::Orders,
            NotificationKind::PositionOpened
            | NotificationKind::PositionClosed
            | NotificationKind::PositionLiquidated => PrefCategory::Positions,
            NotificationKind::RiskAlert | NotificationKind::MarginCall => PrefCategory::Risk,
            NotificationKind::PriceAlert => PrefCategory::Price,
            NotificationKind::SystemAlert => PrefCategory::System,
        }
    }
}

/// Priority is ordered; serialization uses the name per the envelope spec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrefCategory {
    Orders,
    Positions,
    Risk,
    Price,
    System,
}

/// Per-account, per-category delivery preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub min_priority: NotificationPriority,
    pub orders: bool,
    pub positions: bool,
    pub risk: bool,
    pub price_alerts: bool,
    pub system: bool,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            min_priority: NotificationPriority::Low,
            orders: true,
            positions: true,
            risk: true,
            price_alerts: false,
            system: true,
        }
    }
}

impl NotificationPrefs {
    fn allows(&self, kind: NotificationKind, priority: NotificationPriority) -> bool {
        if priority < self.min_priority {
            return false;
        }
        match kind.category() {
            PrefCategory::Orders => self.orders,
            PrefCategory::Positions => self.positions,
            PrefCategory::Risk => self.risk,
            PrefCategory::Price => self.price_alerts,
            PrefCategory::System => self.system,
        }
    }
}

/// The JSON-shaped envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub account_id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

struct AccountChannel {
    ring: VecDeque<Notification>,
    sender: broadcast::Sender<Notification>,
    prefs: NotificationPrefs,
}

impl AccountChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Self {
            ring: VecDeque::with_capacity(64),
            sender,
            prefs: NotificationPrefs::default(),
        }
    }
}

/// A filtered subscription handle. Lagged deliveries (slow consumer) drop
/// the oldest events and are counted on the bus.
pub struct NotificationStream {
    receiver: broadcast::Receiver<Notification>,
    min_priority: NotificationPriority,
    dropped: std::sync::Arc<AtomicU64>,
}

impl NotificationStream {
    /// Next event at or above the subscription's minimum priority.
    /// Returns `None` once the bus side is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => {
                    if notification.priority >= self.min_priority {
                        return Some(notification);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                    warn!(missed, "notification subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-memory fan-out with a durable-enough bounded history per account.
pub struct NotificationBus {
    next_id: AtomicU64,
    ring_capacity: usize,
    channels: RwLock<HashMap<i64, AccountChannel>>,
    dropped: std::sync::Arc<AtomicU64>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ring_capacity,
            channels: RwLock::new(HashMap::new()),
            dropped: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Returns the notification id, or `None` when the
    /// account's preferences suppressed delivery.
    pub fn publish(
        &self,
        account_id: i64,
        kind: NotificationKind,
        priority: NotificationPriority,
        title: &str,
        message: &str,
        data: Value,
    ) -> Option<u64> {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(account_id)
            .or_insert_with(AccountChannel::new);

        if !channel.prefs.allows(kind, priority) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notification = Notification {
            id,
            account_id,
            kind,
            priority,
            title: title.to_string(),
            message: message.to_string(),
            data,
            timestamp: Utc::now(),
            read: false,
        };

        if priority == NotificationPriority::Critical {
            warn!(
                account_id,
                title, message, "critical notification published"
            );
        }

        channel.ring.push_back(notification.clone());
        while channel.ring.len() > self.ring_capacity {
            channel.ring.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        // No receivers is fine; the ring still records the event.
        let _ = channel.sender.send(notification);
        Some(id)
    }

    /// Subscribe to an account's events at a minimum priority.
    pub fn subscribe(
        &self,
        account_id: i64,
        min_priority: NotificationPriority,
    ) -> NotificationStream {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(account_id)
            .or_insert_with(AccountChannel::new);
        NotificationStream {
            receiver: channel.sender.subscribe(),
            min_priority,
            dropped: std::sync::Arc::clone(&self.dropped),
        }
    }

    pub fn set_preferences(&self, account_id: i64, prefs: NotificationPrefs) {
        let mut channels = self.channels.write();
        channels
            .entry(account_id)
            .or_insert_with(AccountChannel::new)
            .prefs = prefs;
    }

    pub fn preferences(&self, account_id: i64) -> NotificationPrefs {
        self.channels
            .read()
            .get(&account_id)
            .map(|c| c.prefs.clone())
            .unwrap_or_default()
    }

    /// Recent events, newest first.
    pub fn recent(&self, account_id: i64, unread_only: bool, limit: usize) -> Vec<Notification> {
        self.channels
            .read()
            .get(&account_id)
            .map(|channel| {
                channel
                    .ring
                    .iter()
                    .rev()
                    .filter(|n| !unread_only || !n.read)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mark_read(&self, account_id: i64, notification_id: u64) -> bool {
        let mut channels = self.channels.write();
        if let Some(channel) = channels.get_mut(&account_id) {
            for entry in channel.ring.iter_mut() {
                if entry.id == notification_id {
                    entry.read = true;
                    return true;
                }
            }
        }
        false
    }

    pub fn mark_all_read(&self, account_id: i64) -> usize {
        let mut channels = self.channels.write();
        let Some(channel) = channels.get_mut(&account_id) else {
            return 0;
        };
        let mut count = 0;
        for entry in channel.ring.iter_mut() {
            if !entry.read {
                entry.read = true;
                count += 1;
            }
        }
        count
    }

    pub fn unread_count(&self, account_id: i64) -> usize {
        self.channels
            .read()
            .get(&account_id)
            .map(|channel| channel.ring.iter().filter(|n| !n.read).count())
            .unwrap_or(0)
    }

    /// Events dropped by ring overflow or lagging subscribers.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_and_recent() {
        let bus = NotificationBus::default();
        let id = bus
            .publish(
                1,
                NotificationKind::OrderFilled,
                NotificationPriority::Medium,
                "Order Filled",
                "BUY 0.1 BTC-PERP filled at 50000",
                json!({"symbol": "BTC-PERP"}),
            )
            .unwrap();
        assert!(id > 0);

        let recent = bus.recent(1, false, 10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, NotificationKind::OrderFilled);
        assert_eq!(bus.unread_count(1), 1);

        assert!(bus.mark_read(1, id));
        assert_eq!(bus.unread_count(1), 0);
        assert!(bus.recent(1, true, 10).is_empty());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let bus = NotificationBus::default();
        let a = bus
            .publish(1, NotificationKind::SystemAlert, NotificationPriority::Low, "a", "a", json!({}))
            .unwrap();
        let b = bus
            .publish(2, NotificationKind::SystemAlert, NotificationPriority::Low, "b", "b", json!({}))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_ring_overflow_drops_oldest() {
        let bus = NotificationBus::new(3);
        for i in 0..5 {
            bus.publish(
                1,
                NotificationKind::SystemAlert,
                NotificationPriority::Low,
                &format!("n{i}"),
                "",
                json!({}),
            );
        }
        let recent = bus.recent(1, false, 10);
        assert_eq!(recent.len(), 3);
        // Newest first; n0 and n1 were dropped.
        assert_eq!(recent[0].title, "n4");
        assert_eq!(recent[2].title, "n2");
        assert_eq!(bus.dropped_events(), 2);
    }

    #[test]
    fn test_preferences_gate_delivery() {
        let bus = NotificationBus::default();
        bus.set_preferences(
            1,
            NotificationPrefs {
                min_priority: NotificationPriority::High,
                orders: true,
                positions: false,
                risk: true,
                price_alerts: false,
                system: true,
            },
        );

        // Below minimum priority.
        assert!(bus
            .publish(1, NotificationKind::OrderFilled, NotificationPriority::Medium, "t", "m", json!({}))
            .is_none());
        // Category disabled.
        assert!(bus
            .publish(1, NotificationKind::PositionOpened, NotificationPriority::Critical, "t", "m", json!({}))
            .is_none());
        // Allowed.
        assert!(bus
            .publish(1, NotificationKind::RiskAlert, NotificationPriority::High, "t", "m", json!({}))
            .is_some());
    }

    #[tokio::test]
    async fn test_subscriber_receives_filtered_events() {
        let bus = NotificationBus::default();
        let mut stream = bus.subscribe(7, NotificationPriority::High);

        bus.publish(7, NotificationKind::OrderFilled, NotificationPriority::Low, "low", "m", json!({}));
        bus.publish(7, NotificationKind::RiskAlert, NotificationPriority::Critical, "crit", "m", json!({}));

        let received = stream.next().await.unwrap();
        assert_eq!(received.title, "crit");
        assert_eq!(received.priority, NotificationPriority::Critical);
    }

    #[test]
    fn test_envelope_serialization_uses_names() {
        let bus = NotificationBus::default();
        bus.publish(
            1,
            NotificationKind::MarginCall,
            NotificationPriority::Critical,
            "Margin Call",
            "margin level at 82%",
            json!({"margin_level": 82.0}),
        );
        let n = &bus.recent(1, false, 1)[0];
        let encoded = serde_json::to_value(n).unwrap();
        assert_eq!(encoded["type"], "MARGIN_CALL");
        assert_eq!(encoded["priority"], "CRITICAL");
        assert_eq!(encoded["read"], false);
        assert!(encoded["id"].as_u64().is_some());
    }
}
