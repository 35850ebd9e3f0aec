//! The pluggable session store interface. Treated as an external
//! collaborator — the core only ever calls the methods
//! below and never assumes a particular backing (file, database,
//! flash). None of the teacher's packages carry persistence (the
//! embedded target has no filesystem to assume), so this module's shape
//! is grounded instead in the broker-side session stores of the
//! sibling `hebo` examples (`RustRobotics-hebo`'s `connectors` module),
//! which front a real backend behind a small async trait.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::codec::property::Properties;
use crate::types::{PacketId, QoS};

/// The user-visible subset of a publish's v5 properties worth
/// persisting: topic-alias is deliberately absent
/// since it is meaningless across a reconnect and is always restored to
/// "none" when a pending publish is reloaded or redelivered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    pub subscription_identifier: Vec<u32>,
}

impl PersistedPublish {
    pub fn properties(&self) -> Properties {
        Properties {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            subscription_identifier: self.subscription_identifier.clone(),
            ..Properties::default()
        }
    }
}

/// A subscription as it should be restored after a reconnect: enough to
/// rebuild the SUBSCRIBE packet and the local registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedSubscription {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

/// Session persistence, called synchronously from the core's point of
/// view (every call is awaited before the operation it backs is
/// considered durable) but free to defer actual I/O inside its
/// implementation. Save/delete failures are logged by the core and
/// never fail the caller — there is intentionally
/// no `Result` in the mutating methods' signatures, so an implementation
/// cannot smuggle a fallible contract the core would have to guess at;
/// it logs internally and swallows its own errors.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_pending_publish(&self, id: PacketId, publish: PersistedPublish);
    async fn delete_pending_publish(&self, id: PacketId);
    async fn load_pending_publishes(&self) -> HashMap<PacketId, PersistedPublish>;
    async fn clear_pending_publishes(&self);

    async fn save_subscription(&self, filter: String, subscription: PersistedSubscription);
    async fn delete_subscription(&self, filter: &str);
    async fn load_subscriptions(&self) -> HashMap<String, PersistedSubscription>;

    async fn save_received_qos2(&self, id: PacketId);
    async fn delete_received_qos2(&self, id: PacketId);
    async fn load_received_qos2(&self) -> HashSet<PacketId>;
    async fn clear_received_qos2(&self);

    async fn clear(&self);
}

/// A process-local reference implementation, useful for tests and for
/// applications that only need session resumption to survive a
/// reconnect, not a process restart.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    inner: parking_lot::Mutex<InMemorySessionStoreData>,
}

#[derive(Debug, Default)]
struct InMemorySessionStoreData {
    pending_publishes: HashMap<PacketId, PersistedPublish>,
    subscriptions: HashMap<String, PersistedSubscription>,
    received_qos2: HashSet<PacketId>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_pending_publish(&self, id: PacketId, publish: PersistedPublish) {
        self.inner.lock().pending_publishes.insert(id, publish);
    }

    async fn delete_pending_publish(&self, id: PacketId) {
        self.inner.lock().pending_publishes.remove(&id);
    }

    async fn load_pending_publishes(&self) -> HashMap<PacketId, PersistedPublish> {
        self.inner.lock().pending_publishes.clone()
    }

    async fn clear_pending_publishes(&self) {
        self.inner.lock().pending_publishes.clear();
    }

    async fn save_subscription(&self, filter: String, subscription: PersistedSubscription) {
        self.inner.lock().subscriptions.insert(filter, subscription);
    }

    async fn delete_subscription(&self, filter: &str) {
        self.inner.lock().subscriptions.remove(filter);
    }

    async fn load_subscriptions(&self) -> HashMap<String, PersistedSubscription> {
        self.inner.lock().subscriptions.clone()
    }

    async fn save_received_qos2(&self, id: PacketId) {
        self.inner.lock().received_qos2.insert(id);
    }

    async fn delete_received_qos2(&self, id: PacketId) {
        self.inner.lock().received_qos2.remove(&id);
    }

    async fn load_received_qos2(&self) -> HashSet<PacketId> {
        self.inner.lock().received_qos2.clone()
    }

    async fn clear_received_qos2(&self) {
        self.inner.lock().received_qos2.clear();
    }

    async fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.pending_publishes.clear();
        guard.subscriptions.clear();
        guard.received_qos2.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_pending_publishes() {
        let store = InMemorySessionStore::new();
        let id = PacketId::ONE;
        store
            .save_pending_publish(
                id,
                PersistedPublish {
                    topic: "a/b".into(),
                    payload: b"x".to_vec(),
                    qos: QoS::AtLeastOnce,
                    ..Default::default()
                },
            )
            .await;
        let loaded = store.load_pending_publishes().await;
        assert_eq!(loaded.get(&id).unwrap().topic, "a/b");
        store.delete_pending_publish(id).await;
        assert!(store.load_pending_publishes().await.is_empty());
    }

    #[tokio::test]
    async fn clear_wipes_every_substructure() {
        let store = InMemorySessionStore::new();
        store.save_received_qos2(PacketId::ONE).await;
        store
            .save_subscription(
                "a".into(),
                PersistedSubscription {
                    qos: QoS::AtMostOnce,
                    no_local: false,
                    retain_as_published: false,
                    retain_handling: 0,
                },
            )
            .await;
        store.clear().await;
        assert!(store.load_received_qos2().await.is_empty());
        assert!(store.load_subscriptions().await.is_empty());
    }
}
