//! Per-user event fan-out.
//!
//! Each socket connection registers one subscriber carrying an unbounded
//! sender; publishing walks the user's subscriber list. Delivery is
//! at-least-once and per-publisher FIFO (the mpsc channel preserves order);
//! subscribers deduplicate by checksum and version vector on receipt.
//!
//! File-change events are not echoed to the client that caused them;
//! conflict events go to every subscriber of the user.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;

use filesync_core::protocol::{
    ServerFrame, SyncEventDto, CONFLICTS_DESTINATION, FILE_CHANGES_DESTINATION,
};

/// Subscriptions with no heartbeat for this long are closed by the sweeper.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

struct Subscriber {
    id: String,
    client_id: String,
    sender: mpsc::UnboundedSender<ServerFrame>,
    destinations: RwLock<HashSet<String>>,
    /// Unix millis of the last heartbeat (or subscribe).
    last_seen: AtomicI64,
}

/// Identifies one subscription for touch/unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: String,
    pub user_id: String,
}

/// The per-user subscription table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<DashMap<String, Vec<Arc<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for a user. The returned receiver feeds the
    /// socket's sender task; dropping it ends delivery.
    pub fn subscribe(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Subscriber {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            sender,
            destinations: RwLock::new(HashSet::new()),
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
        });

        let handle = SubscriptionHandle {
            id: subscriber.id.clone(),
            user_id: user_id.to_string(),
        };

        self.subscribers
            .entry(user_id.to_string())
            .or_default()
            .push(subscriber);

        tracing::info!(user = user_id, client = client_id, "Subscriber registered");
        (handle, receiver)
    }

    /// Record a destination subscription for a handle.
    pub fn add_destination(&self, handle: &SubscriptionHandle, destination: &str) {
        if let Some(subscriber) = self.find(handle) {
            subscriber
                .destinations
                .write()
                .expect("destinations lock")
                .insert(destination.to_string());
        }
    }

    /// Drop a destination subscription.
    pub fn remove_destination(&self, handle: &SubscriptionHandle, destination: &str) {
        if let Some(subscriber) = self.find(handle) {
            subscriber
                .destinations
                .write()
                .expect("destinations lock")
                .remove(destination);
        }
    }

    /// Remove a subscriber entirely.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(mut subscribers) = self.subscribers.get_mut(&handle.user_id) {
            subscribers.retain(|s| s.id != handle.id);
        }
        self.subscribers
            .remove_if(&handle.user_id, |_, subs| subs.is_empty());
        tracing::debug!(user = handle.user_id.as_str(), "Subscriber removed");
    }

    /// Heartbeat bookkeeping: mark the subscription alive.
    pub fn touch(&self, handle: &SubscriptionHandle) {
        if let Some(subscriber) = self.find(handle) {
            subscriber
                .last_seen
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    /// Deliver a file-change event to every subscriber of the user except
    /// the one that produced it.
    pub fn publish_file_change(&self, user_id: &str, event: &SyncEventDto) {
        self.deliver(user_id, event, FILE_CHANGES_DESTINATION, true);
    }

    /// Deliver a conflict event to every subscriber of the user, the
    /// producer included, since it needs to learn the outcome too.
    pub fn publish_conflict(&self, user_id: &str, event: &SyncEventDto) {
        self.deliver(user_id, event, CONFLICTS_DESTINATION, false);
    }

    fn deliver(
        &self,
        user_id: &str,
        event: &SyncEventDto,
        destination: &str,
        skip_producer: bool,
    ) {
        let Some(subscribers) = self.subscribers.get(user_id) else {
            return;
        };

        let mut delivered = 0usize;
        for subscriber in subscribers.iter() {
            if skip_producer && subscriber.client_id == event.client_id {
                continue;
            }
            // Conflicts go to everyone; other destinations require an
            // explicit subscription.
            if skip_producer {
                let subscribed = subscriber
                    .destinations
                    .read()
                    .expect("destinations lock")
                    .contains(destination);
                if !subscribed {
                    continue;
                }
            }

            let frame = ServerFrame::Event {
                destination: destination.to_string(),
                event: event.clone(),
            };
            // A failed send means the socket is gone; the sweeper or the
            // socket's own cleanup will drop the subscriber.
            if subscriber.sender.send(frame).is_ok() {
                delivered += 1;
            }
        }

        tracing::debug!(
            user = user_id,
            destination,
            delivered,
            event = ?event.event_type,
            "Published event"
        );
    }

    /// Close subscriptions that have missed heartbeats beyond the timeout.
    /// Dropping the sender ends the socket's delivery loop.
    pub fn reap_stale(&self) {
        let cutoff = Utc::now().timestamp_millis() - HEARTBEAT_TIMEOUT.as_millis() as i64;
        let mut reaped = 0usize;

        for mut entry in self.subscribers.iter_mut() {
            let before = entry.value().len();
            entry
                .value_mut()
                .retain(|s| s.last_seen.load(Ordering::Relaxed) >= cutoff);
            reaped += before - entry.value().len();
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());

        if reaped > 0 {
            tracing::info!(count = reaped, "Reaped stale subscriptions");
        }
    }

    /// Number of live subscribers across all users.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }

    fn find(&self, handle: &SubscriptionHandle) -> Option<Arc<Subscriber>> {
        self.subscribers
            .get(&handle.user_id)
            .and_then(|subs| subs.iter().find(|s| s.id == handle.id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::protocol::{EventStatus, SyncEventType};

    fn event(client_id: &str, event_type: SyncEventType) -> SyncEventDto {
        SyncEventDto {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            user_id: "user-1".to_string(),
            file_id: Some("file-1".to_string()),
            file_path: Some("a.txt".to_string()),
            checksum: Some("abc".to_string()),
            file_size: Some(13),
            client_id: client_id.to_string(),
            timestamp: Utc::now(),
            sync_status: EventStatus::Completed,
            version_vector: None,
        }
    }

    fn subscribe_to_changes(
        bus: &EventBus,
        user: &str,
        client: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (handle, receiver) = bus.subscribe(user, client);
        bus.add_destination(&handle, FILE_CHANGES_DESTINATION);
        bus.add_destination(&handle, CONFLICTS_DESTINATION);
        (handle, receiver)
    }

    #[test]
    fn test_file_change_skips_producer() {
        let bus = EventBus::new();
        let (_ha, mut rx_a) = subscribe_to_changes(&bus, "user-1", "client-a");
        let (_hb, mut rx_b) = subscribe_to_changes(&bus, "user-1", "client-b");

        bus.publish_file_change("user-1", &event("client-a", SyncEventType::Modify));

        // Producer sees nothing
        assert!(rx_a.try_recv().is_err());
        // Peer receives the event
        match rx_b.try_recv().unwrap() {
            ServerFrame::Event { destination, event } => {
                assert_eq!(destination, FILE_CHANGES_DESTINATION);
                assert_eq!(event.client_id, "client-a");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_conflict_reaches_everyone() {
        let bus = EventBus::new();
        let (_ha, mut rx_a) = subscribe_to_changes(&bus, "user-1", "client-a");
        let (_hb, mut rx_b) = subscribe_to_changes(&bus, "user-1", "client-b");

        bus.publish_conflict("user-1", &event("client-a", SyncEventType::Conflict));

        assert!(matches!(rx_a.try_recv().unwrap(), ServerFrame::Event { .. }));
        assert!(matches!(rx_b.try_recv().unwrap(), ServerFrame::Event { .. }));
    }

    #[test]
    fn test_users_are_isolated() {
        let bus = EventBus::new();
        let (_ha, mut rx_a) = subscribe_to_changes(&bus, "user-1", "client-a");
        let (_hb, mut rx_b) = subscribe_to_changes(&bus, "user-2", "client-b");

        bus.publish_file_change("user-2", &event("client-z", SyncEventType::Create));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_delivery_preserves_publisher_order() {
        let bus = EventBus::new();
        let (_h, mut rx) = subscribe_to_changes(&bus, "user-1", "client-b");

        for i in 0..3 {
            let mut e = event("client-a", SyncEventType::Modify);
            e.event_id = format!("evt-{}", i);
            bus.publish_file_change("user-1", &e);
        }

        for i in 0..3 {
            match rx.try_recv().unwrap() {
                ServerFrame::Event { event, .. } => {
                    assert_eq!(event.event_id, format!("evt-{}", i));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[test]
    fn test_unsubscribed_destination_not_delivered() {
        let bus = EventBus::new();
        // Subscribes to conflicts only
        let (handle, mut rx) = bus.subscribe("user-1", "client-b");
        bus.add_destination(&handle, CONFLICTS_DESTINATION);

        bus.publish_file_change("user-1", &event("client-a", SyncEventType::Modify));
        assert!(rx.try_recv().is_err());

        bus.publish_conflict("user-1", &event("client-a", SyncEventType::Conflict));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (handle, mut rx) = subscribe_to_changes(&bus, "user-1", "client-b");

        bus.unsubscribe(&handle);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish_file_change("user-1", &event("client-a", SyncEventType::Modify));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reap_stale_removes_silent_subscribers() {
        let bus = EventBus::new();
        let (handle, _rx) = subscribe_to_changes(&bus, "user-1", "client-b");

        // Backdate the subscription beyond the timeout
        if let Some(subscriber) = bus.find(&handle) {
            subscriber.last_seen.store(
                Utc::now().timestamp_millis() - 1000 * 60 * 10,
                Ordering::Relaxed,
            );
        }

        bus.reap_stale();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_touch_keeps_subscriber_alive() {
        let bus = EventBus::new();
        let (handle, _rx) = subscribe_to_changes(&bus, "user-1", "client-b");

        bus.touch(&handle);
        bus.reap_stale();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
