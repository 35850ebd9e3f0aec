use std::collections::HashMap;
use std::sync::Arc;

use crate::callbacks::PublishHandler;
use crate::types::{QoS, TopicFilter};

/// The locally-held record of one active subscription, enough to
/// reconstruct a resubscribe after a session is lost and to decide
/// inbound no-local/retain handling. Carries the per-filter handler; a
/// filter with no handler of its own falls back to the client's default
/// publish handler on delivery.
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub handler: Option<Arc<dyn PublishHandler>>,
}

impl std::fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("qos", &self.qos)
            .field("no_local", &self.no_local)
            .field("retain_as_published", &self.retain_as_published)
            .field("retain_handling", &self.retain_handling)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Subscriptions are registered locally before the SUBSCRIBE packet
/// leaves, so a PUBLISH racing the SUBACK is still matched.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, filter: String, entry: SubscriptionEntry) {
        self.entries.insert(filter, entry);
    }

    pub fn remove(&mut self, filter: &str) -> Option<SubscriptionEntry> {
        self.entries.remove(filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.contains_key(filter)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All subscription entries whose filter matches `topic`, in
    /// registration order is not guaranteed — callers needing the
    /// strongest QoS across overlapping filters should fold over this.
    ///
    /// A shared-subscription filter (`$share/<group>/<rest>`) matches on
    /// `<rest>` against the topic the broker actually delivered — the
    /// group prefix is forwarded on the wire but never appears in an
    /// inbound PUBLISH topic, since there is no local load-balancing
    /// group to strip it back out of.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = (&'a str, SubscriptionEntry)> + 'a {
        self.entries.iter().filter_map(move |(filter, entry)| {
            let match_against = shared_subscription_suffix(filter).unwrap_or(filter.as_str());
            let parsed = TopicFilter::new(match_against, usize::MAX).ok()?;
            parsed.matches(topic).then_some((filter.as_str(), entry.clone()))
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, SubscriptionEntry)> {
        self.entries.iter().map(|(f, e)| (f.as_str(), e.clone()))
    }
}

/// Strips the `$share/<group>/` prefix from a shared-subscription
/// filter, returning the remaining filter to match topics against.
fn shared_subscription_suffix(filter: &str) -> Option<&str> {
    let rest = filter.strip_prefix("$share/")?;
    let (_group, suffix) = rest.split_once('/')?;
    Some(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_matches_wildcard_filters() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(
            "sport/+".into(),
            SubscriptionEntry {
                qos: QoS::AtLeastOnce,
                no_local: false,
                retain_as_published: false,
                retain_handling: 0,
                handler: None,
            },
        );
        assert_eq!(reg.matching("sport/tennis").count(), 1);
        assert_eq!(reg.matching("sport/tennis/extra").count(), 0);
    }

    #[test]
    fn remove_clears_a_single_filter() {
        let mut reg = SubscriptionRegistry::new();
        reg.insert(
            "a/b".into(),
            SubscriptionEntry {
                qos: QoS::AtMostOnce,
                no_local: false,
                retain_as_published: false,
                retain_handling: 0,
                handler: None,
            },
        );
        assert!(reg.remove("a/b").is_some());
        assert!(!reg.contains("a/b"));
    }
}
