use std::num::NonZeroU16;

/// A nonzero MQTT packet identifier.
///
/// A packet's `packet_id` is nonzero iff the packet type requires one.
/// Representing it as `NonZeroU16` makes that a type-level guarantee
/// everywhere past decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    pub const ONE: Self = Self(NonZeroU16::new(1).unwrap());

    pub fn new(value: u16) -> Option<Self> {
        NonZeroU16::new(value).map(Self)
    }

    pub const fn get(self) -> u16 {
        self.0.get()
    }

    /// Wrapping successor, skipping zero.
    pub fn next(self) -> Self {
        NonZeroU16::new(self.0.get().wrapping_add(1))
            .map(Self)
            .unwrap_or(Self::ONE)
    }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_skips_zero_on_wraparound() {
        let max = PacketId::new(u16::MAX).unwrap();
        assert_eq!(max.next(), PacketId::ONE);
    }

    #[test]
    fn zero_is_rejected() {
        assert!(PacketId::new(0).is_none());
    }
}
