use std::collections::VecDeque;

/// How the engine reacts if the server breaches the inbound
/// receive-maximum it granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboundPolicy {
    /// Disconnect with `ReceiveMaximumExceeded` — the server promised not
    /// to do this, so treat it as a protocol violation.
    #[default]
    Strict,
    /// Accept an over-quota PUBLISH anyway, no questions asked.
    Ignore,
}

/// Bounds how many outbound QoS 1/2 publications may be unacknowledged
/// at once, per the receive-maximum the server advertised in CONNACK
/// (defaulting to 65535 pre-negotiation / on v3). Publishes requested
/// beyond the quota queue here rather than block the caller holding the
/// session lock (spec.md section 4.E, "outbound queue deadlock
/// avoidance").
#[derive(Debug)]
pub struct OutboundWindow {
    max: u16,
    in_flight: u16,
    waiting: VecDeque<tokio::sync::oneshot::Sender<()>>,
}

impl OutboundWindow {
    pub fn new(max: u16) -> Self {
        Self {
            max: max.max(1),
            in_flight: 0,
            waiting: VecDeque::new(),
        }
    }

    pub fn set_max(&mut self, max: u16) {
        self.max = max.max(1);
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.in_flight < self.max {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Registers interest in the next freed slot; the returned receiver
    /// resolves once `release` admits it.
    pub fn wait_for_slot(&mut self) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.waiting.push_back(tx);
        rx
    }

    pub fn release(&mut self) {
        if let Some(tx) = self.waiting.pop_front() {
            // A waiter takes the slot directly; in_flight stays unchanged.
            let _ = tx.send(());
        } else {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
    }

    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }
}

/// Tracks how many unacknowledged QoS 1/2 publications the server has
/// currently sent us, enforcing the receive-maximum *we* advertised.
#[derive(Debug)]
pub struct InboundTracker {
    max: u16,
    in_flight: u16,
    policy: InboundPolicy,
}

impl InboundTracker {
    pub fn new(max: u16, policy: InboundPolicy) -> Self {
        Self {
            max: max.max(1),
            in_flight: 0,
            policy,
        }
    }

    /// Returns `true` if this inbound publish is within quota (or the
    /// policy ignores the breach); `false` under `Strict` means the
    /// connection must be dropped with `ReceiveMaximumExceeded`.
    pub fn admit(&mut self) -> bool {
        if self.in_flight < self.max {
            self.in_flight += 1;
            true
        } else if self.policy == InboundPolicy::Ignore {
            log::warn!("inbound receive-maximum ({}) exceeded, admitting anyway under the Ignore policy", self.max);
            true
        } else {
            false
        }
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_window_blocks_past_quota() {
        let mut window = OutboundWindow::new(1);
        assert!(window.try_acquire());
        assert!(!window.try_acquire());
        window.release();
        assert!(window.try_acquire());
    }

    #[test]
    fn inbound_strict_policy_rejects_past_quota() {
        let mut tracker = InboundTracker::new(1, InboundPolicy::Strict);
        assert!(tracker.admit());
        assert!(!tracker.admit());
    }

    #[test]
    fn inbound_ignore_policy_admits_past_quota() {
        let mut tracker = InboundTracker::new(1, InboundPolicy::Ignore);
        assert!(tracker.admit());
        assert!(tracker.admit());
    }
}
