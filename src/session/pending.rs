use std::collections::HashSet;
use std::time::Instant;

use crate::codec::property::Properties;
use crate::types::{PacketId, QoS};

/// The state of an incomplete QoS 1 or 2 publication initiated by this
/// client, keyed dynamically rather than over a fixed-capacity slot. A
/// QoS 2 PUBLISH is sent at most once; only the PUBREL retransmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPublishState {
    /// A QoS 1 PUBLISH has been sent; awaiting PUBACK.
    AwaitingPubAck,
    /// A QoS 2 PUBLISH has been sent; awaiting PUBREC.
    AwaitingPubRec,
    /// PUBREC arrived and PUBREL was sent; awaiting PUBCOMP.
    AwaitingPubComp,
}

/// Everything needed to retransmit an outbound publish with DUP set, or
/// to resend the bare PUBREL once PUBREC has already arrived.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub state: OutboundPublishState,
    /// The full, never-aliased topic name. Topic-alias rewriting is
    /// applied fresh at encode time from the live [`crate::flow::AliasTables`],
    /// never baked into the stored value — this is what makes alias
    /// resurrection after reconnect automatic rather than a case the
    /// retransmit path has to remember to handle.
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
    /// Whether the original `publish()` call asked for alias use. Carried
    /// so a post-reconnect retransmit still requests one against the
    /// freshly negotiated (and currently empty) alias table.
    pub use_topic_alias: bool,
    /// When this entry last went out on the wire, refreshed on both the
    /// original send and every retransmit; the periodic retransmit scan
    /// reads this to decide what is due.
    pub last_sent: Instant,
}

/// Allocates packet identifiers for outbound QoS 1/2 operations,
/// skipping any id already in flight. The in-use set is a `HashSet`
/// since the engine has no fixed capacity ceiling baked into the type.
#[derive(Debug)]
pub struct PacketIdAllocator {
    next: Option<PacketId>,
    in_use: HashSet<PacketId>,
}

impl Default for PacketIdAllocator {
    /// Matches [`PacketIdAllocator::new`] rather than a derived all-zero
    /// default — `next: None` would route every allocator's very first
    /// call through `allocate_with_fallback`'s exhaustion path instead of
    /// the ordinary one.
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Some(PacketId::ONE),
            in_use: HashSet::new(),
        }
    }

    /// Returns `None` only if every one of the 65535 possible ids is
    /// currently in flight — in practice bounded well below that by the
    /// server's receive-maximum.
    pub fn allocate(&mut self) -> Option<PacketId> {
        let start = self.next?;
        let mut candidate = start;
        loop {
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                self.next = Some(candidate.next());
                return Some(candidate);
            }
            candidate = candidate.next();
            if candidate == start {
                return None;
            }
        }
    }

    /// Allocates an id even if the space is exhausted: returns the
    /// current value regardless, accepting a possible collision rather
    /// than failing outright. In practice this only fires once in-flight
    /// count exceeds 65534, which the server's receive-maximum window
    /// should prevent well before it happens.
    pub fn allocate_with_fallback(&mut self) -> PacketId {
        if let Some(id) = self.allocate() {
            return id;
        }
        let id = self.next.unwrap_or(PacketId::ONE);
        self.next = Some(id.next());
        self.in_use.insert(id);
        id
    }

    pub fn release(&mut self, id: PacketId) {
        self.in_use.remove(&id);
    }

    /// Seeds an id as already in flight without handing it out, used
    /// when restoring pending publishes from a [`crate::store::SessionStore`]
    /// on startup, before CONNECT.
    pub fn mark_in_use(&mut self, id: PacketId) {
        self.in_use.insert(id);
    }

    pub fn is_in_use(&self, id: PacketId) -> bool {
        self.in_use.contains(&id)
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next = Some(PacketId::ONE);
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_use.len()
    }
}
