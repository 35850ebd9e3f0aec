use std::collections::HashMap;

/// Why an inbound topic alias could not be resolved to a topic name,
/// distinguished because each maps to a different DISCONNECT reason
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasError {
    /// Alias 0, or greater than the maximum this client advertised.
    OutOfRange,
    /// A bare alias (empty topic) referencing a slot never established
    /// with a full topic name in this connection.
    Unestablished,
    /// No alias tag and no topic name: nothing to resolve.
    EmptyTopic,
}

/// Bidirectional topic-alias translation tables: an alias must be
/// established with its full topic name before it is ever used bare.
/// Outbound and inbound tables are independent — each direction
/// negotiates its own maximum during CONNECT/CONNACK.
#[derive(Debug, Default)]
pub struct AliasTables {
    outbound: HashMap<String, u16>,
    outbound_max: u16,
    next_outbound: u16,
    inbound: HashMap<u16, String>,
    inbound_max: u16,
}

impl AliasTables {
    pub fn new(outbound_max: u16, inbound_max: u16) -> Self {
        Self {
            outbound: HashMap::new(),
            outbound_max,
            next_outbound: 1,
            inbound: HashMap::new(),
            inbound_max,
        }
    }

    /// Invalidated on every reconnect: the server does not remember
    /// alias assignments across a fresh network connection even when the
    /// application session is resumed.
    pub fn reset(&mut self, outbound_max: u16, inbound_max: u16) {
        self.outbound.clear();
        self.next_outbound = 1;
        self.outbound_max = outbound_max;
        self.inbound.clear();
        self.inbound_max = inbound_max;
    }

    /// Resolves the alias to use for an outbound PUBLISH to `topic`.
    /// Returns `(alias, topic_to_send)`: the first publish to a topic
    /// sends the full topic name with the alias, afterwards only the
    /// alias is needed — `topic_to_send` is `None` once established.
    pub fn outbound_alias_for(&mut self, topic: &str) -> Option<(u16, bool)> {
        if self.outbound_max == 0 {
            return None;
        }
        if let Some(&alias) = self.outbound.get(topic) {
            return Some((alias, false));
        }
        if (self.outbound.len() as u16) < self.outbound_max {
            let alias = self.next_outbound;
            self.next_outbound = self.next_outbound.checked_add(1).unwrap_or(1).max(1);
            if self.next_outbound > self.outbound_max {
                self.next_outbound = 1;
            }
            self.outbound.insert(topic.to_string(), alias);
            return Some((alias, true));
        }
        None
    }

    /// Call after a reconnect loses the alias assignment but the pending
    /// publish must be retransmitted with its full topic name restored.
    pub fn forget_outbound(&mut self, topic: &str) {
        self.outbound.remove(topic);
    }

    /// Resolves an inbound PUBLISH's effective topic: either the topic
    /// name carried in the packet (which also (re-)establishes the
    /// alias), or a previously-established alias with an empty topic.
    pub fn resolve_inbound(
        &mut self,
        topic: &str,
        alias: Option<u16>,
    ) -> Result<String, AliasError> {
        match alias {
            Some(alias) if alias == 0 || alias > self.inbound_max => Err(AliasError::OutOfRange),
            Some(alias) if !topic.is_empty() => {
                self.inbound.insert(alias, topic.to_string());
                Ok(topic.to_string())
            }
            Some(alias) => self
                .inbound
                .get(&alias)
                .cloned()
                .ok_or(AliasError::Unestablished),
            None => {
                if topic.is_empty() {
                    Err(AliasError::EmptyTopic)
                } else {
                    Ok(topic.to_string())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_publish_establishes_the_alias() {
        let mut table = AliasTables::new(10, 10);
        let (alias, send_topic) = table.outbound_alias_for("a/b").unwrap();
        assert_eq!(alias, 1);
        assert!(send_topic);
        let (alias2, send_topic2) = table.outbound_alias_for("a/b").unwrap();
        assert_eq!(alias2, 1);
        assert!(!send_topic2);
    }

    #[test]
    fn outbound_alias_exhausted_falls_back_to_full_topic() {
        let mut table = AliasTables::new(1, 10);
        table.outbound_alias_for("a").unwrap();
        assert!(table.outbound_alias_for("b").is_none());
    }

    #[test]
    fn inbound_alias_requires_prior_establishment() {
        let mut table = AliasTables::new(10, 10);
        assert!(table.resolve_inbound("", Some(5)).is_err());
        table.resolve_inbound("a/b", Some(5)).unwrap();
        assert_eq!(table.resolve_inbound("", Some(5)).unwrap(), "a/b");
    }

    #[test]
    fn reset_clears_both_directions() {
        let mut table = AliasTables::new(10, 10);
        table.outbound_alias_for("a/b").unwrap();
        table.resolve_inbound("c/d", Some(1)).unwrap();
        table.reset(10, 10);
        assert!(table.resolve_inbound("", Some(1)).is_err());
    }
}
