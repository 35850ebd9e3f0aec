//! Session bookkeeping: in-flight publications, the inbound QoS 2
//! dedup set, the packet id allocator, and the subscription registry.

mod pending;
mod subscriptions;

use std::collections::HashSet;

pub use pending::{OutboundPublishState, PacketIdAllocator, PendingPublish};
pub use subscriptions::{SubscriptionEntry, SubscriptionRegistry};

use crate::types::PacketId;

/// All state a clean_start=false session must survive a reconnect.
/// Unbounded `HashMap`/`HashSet` storage rather than fixed-capacity
/// slots, since this engine has no compile-time bound on in-flight
/// counts — the *server's* receive-maximum is enforced dynamically by
/// [`crate::flow::receive_max`] instead of by the container's capacity.
#[derive(Debug, Default)]
pub struct SessionState {
    pub outbound_ids: PacketIdAllocator,
    pub pending_client_publishes: std::collections::HashMap<PacketId, PendingPublish>,
    /// Packet ids of QoS 2 PUBLISH packets received and PUBREC'd, not yet
    /// resolved by PUBREL — dedups a retransmitted PUBLISH without
    /// redelivering it to the application.
    pending_server_publishes: HashSet<PacketId>,
    pub subscriptions: SubscriptionRegistry,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight_client_publishes(&self) -> usize {
        self.pending_client_publishes.len()
    }

    pub fn is_used_client_id(&self, id: PacketId) -> bool {
        self.pending_client_publishes.contains_key(&id)
    }

    pub fn is_awaiting_pubrel(&self, id: PacketId) -> bool {
        self.pending_server_publishes.contains(&id)
    }

    pub fn mark_awaiting_pubrel(&mut self, id: PacketId) {
        self.pending_server_publishes.insert(id);
    }

    pub fn clear_awaiting_pubrel(&mut self, id: PacketId) -> bool {
        self.pending_server_publishes.remove(&id)
    }

    /// Drops the whole inbound QoS 2 dedup set, on a lost session — the
    /// broker has forgotten which PUBRELs it still owes us too, so there
    /// is nothing left for these entries to deduplicate against.
    pub fn clear_awaiting_pubrel_set(&mut self) {
        self.pending_server_publishes.clear();
    }

    pub fn insert_pending(&mut self, id: PacketId, pending: PendingPublish) {
        self.pending_client_publishes.insert(id, pending);
    }

    pub fn pending_mut(&mut self, id: PacketId) -> Option<&mut PendingPublish> {
        self.pending_client_publishes.get_mut(&id)
    }

    pub fn remove_pending(&mut self, id: PacketId) -> Option<PendingPublish> {
        let removed = self.pending_client_publishes.remove(&id);
        if removed.is_some() {
            self.outbound_ids.release(id);
        }
        removed
    }

    /// Packet ids of every client publish still awaiting a terminal ack,
    /// in no particular order — used to drive the post-reconnect
    /// retransmission scan.
    pub fn pending_client_publish_ids(&self) -> Vec<PacketId> {
        self.pending_client_publishes.keys().copied().collect()
    }

    /// Every pending client publish by id, for the coarse-tick
    /// retransmit scan.
    pub fn pending_client_publishes_iter(&self) -> impl Iterator<Item = (PacketId, &PendingPublish)> {
        self.pending_client_publishes.iter().map(|(id, p)| (*id, p))
    }

    /// Wipes all session state, on a clean-start CONNECT or when the
    /// server reports `session_present = false` after we asked to resume.
    pub fn clear(&mut self) {
        self.outbound_ids.clear();
        self.pending_client_publishes.clear();
        self.pending_server_publishes.clear();
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::property::Properties;
    use crate::types::QoS;

    #[test]
    fn clear_resets_every_substructure() {
        let mut session = SessionState::new();
        let id = session.outbound_ids.allocate().unwrap();
        session.insert_pending(
            id,
            PendingPublish {
                state: OutboundPublishState::AwaitingPubAck,
                topic: "a".into(),
                payload: vec![],
                qos: QoS::AtLeastOnce,
                retain: false,
                properties: Properties::default(),
                use_topic_alias: false,
                last_sent: std::time::Instant::now(),
            },
        );
        session.mark_awaiting_pubrel(PacketId::ONE);
        session.clear();
        assert_eq!(session.in_flight_client_publishes(), 0);
        assert!(!session.is_awaiting_pubrel(PacketId::ONE));
    }

    #[test]
    fn remove_pending_releases_the_packet_id() {
        let mut session = SessionState::new();
        let id = session.outbound_ids.allocate().unwrap();
        session.insert_pending(
            id,
            PendingPublish {
                state: OutboundPublishState::AwaitingPubAck,
                topic: "a".into(),
                payload: vec![],
                qos: QoS::AtLeastOnce,
                retain: false,
                properties: Properties::default(),
                use_topic_alias: false,
                last_sent: std::time::Instant::now(),
            },
        );
        assert!(session.outbound_ids.is_in_use(id));
        session.remove_pending(id);
        assert!(!session.outbound_ids.is_in_use(id));
    }
}
