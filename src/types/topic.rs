use crate::error::ValidationError;

/// A validated publish topic name: non-empty, no wildcard characters, no
/// embedded NUL, within the configured length limit. Shared-subscription
/// group filters (`$share/<group>/...`) are a subscribe-side concept and
/// never appear as a publish topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(topic: impl Into<String>, max_len: usize) -> Result<Self, ValidationError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        if topic.len() > max_len {
            return Err(ValidationError::TopicTooLong);
        }
        if topic.contains(['+', '#', '\0']) {
            return Err(ValidationError::InvalidTopic);
        }
        Ok(Self(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_shared(&self) -> bool {
        self.0.starts_with("$share/")
    }
}

/// A validated subscribe filter: same rules as [`TopicName`] but `+` and
/// `#` are permitted subject to their positional rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(filter: impl Into<String>, max_len: usize) -> Result<Self, ValidationError> {
        let filter = filter.into();
        if filter.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        if filter.len() > max_len {
            return Err(ValidationError::TopicTooLong);
        }
        if filter.contains('\0') {
            return Err(ValidationError::InvalidFilter("embedded NUL"));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        for (i, level) in levels.iter().enumerate() {
            let is_last = i == levels.len() - 1;
            match *level {
                "#" => {
                    if !is_last {
                        return Err(ValidationError::InvalidFilter(
                            "'#' must be the last level",
                        ));
                    }
                }
                "+" => {}
                other => {
                    if other.contains(['+', '#']) {
                        return Err(ValidationError::InvalidFilter(
                            "'+'/'#' must occupy an entire level",
                        ));
                    }
                }
            }
        }

        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// True if this filter's first level is `+` or `#` — such filters must
    /// never match a `$`-prefixed topic name.
    fn first_level_is_wildcard(&self) -> bool {
        matches!(self.0.split('/').next(), Some("+") | Some("#"))
    }

    /// Matches a concrete topic name against this filter. Case-sensitive,
    /// byte-exact.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && self.first_level_is_wildcard() {
            return false;
        }
        match_levels(self.0.split('/'), topic.split('/'))
    }
}

fn match_levels<'a>(
    mut filter: impl Iterator<Item = &'a str>,
    mut topic: impl Iterator<Item = &'a str>,
) -> bool {
    loop {
        match (filter.next(), topic.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) => {
                if f != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s, 65535).unwrap()
    }

    #[test]
    fn exact_match() {
        assert!(filter("sport/tennis/player1").matches("sport/tennis/player1"));
        assert!(!filter("sport/tennis/player1").matches("sport/tennis/player2"));
    }

    #[test]
    fn hash_matches_zero_or_more_trailing_levels() {
        assert!(filter("sport/tennis/#").matches("sport/tennis"));
        assert!(filter("sport/tennis/#").matches("sport/tennis/player1"));
        assert!(filter("sport/tennis/#").matches("sport/tennis/player1/ranking"));
        assert!(filter("#").matches("anything/at/all"));
    }

    #[test]
    fn plus_matches_exactly_one_level() {
        assert!(filter("sport/+/player1").matches("sport/tennis/player1"));
        assert!(!filter("sport/+/player1").matches("sport/tennis/extra/player1"));
        assert!(!filter("sport/+").matches("sport"));
    }

    #[test]
    fn dollar_prefixed_topics_excluded_from_leading_wildcards() {
        assert!(!filter("#").matches("$SYS/broker/clients"));
        assert!(!filter("+/broker").matches("$SYS/broker"));
        assert!(filter("$SYS/#").matches("$SYS/broker/clients"));
        assert!(filter("$SYS/+").matches("$SYS/broker"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!filter("Sport/Tennis").matches("sport/tennis"));
    }

    #[test]
    fn hash_must_be_last_level() {
        assert!(TopicFilter::new("sport/#/player1", 65535).is_err());
    }

    #[test]
    fn wildcard_must_occupy_whole_level() {
        assert!(TopicFilter::new("sport+", 65535).is_err());
        assert!(TopicFilter::new("sport#", 65535).is_err());
    }

    #[test]
    fn publish_topic_rejects_wildcards_and_empty() {
        use crate::types::TopicName;
        assert!(TopicName::new("", 65535).is_err());
        assert!(TopicName::new("a/+", 65535).is_err());
        assert!(TopicName::new("a/#", 65535).is_err());
        assert!(TopicName::new("sensors/t", 65535).is_ok());
    }

    #[test]
    fn shared_subscription_filter_keeps_its_raw_prefix_in_matches() {
        // `TopicFilter::matches` is prefix-literal: the `$share/<group>/`
        // portion is stripped by the subscription registry before
        // matching against a delivered topic, not by the filter itself.
        let f = filter("$share/group1/sport/tennis/+");
        assert!(!f.matches("sport/tennis/player1"));
        assert!(f.matches("$share/group1/sport/tennis/player1"));
    }
}
