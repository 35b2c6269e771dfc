use crate::error::EventsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The closed set of domain topics a connection can subscribe to.
///
/// The declaration order is the canonical order used whenever a set of topics
/// is written to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Signal,
    Proposal,
    Decision,
    Outcome,
    Risk,
    System,
}

/// A connection's subscriptions. Ordered so replies list topics deterministically.
pub type TopicSet = BTreeSet<Topic>;

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Signal,
        Topic::Proposal,
        Topic::Decision,
        Topic::Outcome,
        Topic::Risk,
        Topic::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Signal => "signal",
            Topic::Proposal => "proposal",
            Topic::Decision => "decision",
            Topic::Outcome => "outcome",
            Topic::Risk => "risk",
            Topic::System => "system",
        }
    }

    /// Every domain topic.
    pub fn all() -> TopicSet {
        Self::ALL.into_iter().collect()
    }

    /// Parses a list of topic names, silently dropping anything outside the closed set.
    pub fn parse_lenient<I, S>(names: I) -> TopicSet
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| match name.as_ref().trim().parse::<Topic>() {
                Ok(topic) => Some(topic),
                Err(_) => {
                    tracing::debug!(topic = name.as_ref(), "Ignoring unknown topic.");
                    None
                }
            })
            .collect()
    }

    /// Parses a comma separated list such as `signal,proposal`.
    pub fn parse_csv(list: &str) -> TopicSet {
        Self::parse_lenient(list.split(',').filter(|s| !s.trim().is_empty()))
    }

    /// Renders a set as the string list used on the wire.
    pub fn names(set: &TopicSet) -> Vec<String> {
        set.iter().map(|t| t.as_str().to_string()).collect()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signal" => Ok(Topic::Signal),
            "proposal" => Ok(Topic::Proposal),
            "decision" => Ok(Topic::Decision),
            "outcome" => Ok(Topic::Outcome),
            "risk" => Ok(Topic::Risk),
            "system" => Ok(Topic::System),
            other => Err(EventsError::UnknownTopic(other.to_string())),
        }
    }
}

/// Every value the `type` field of an envelope can carry, plus the local
/// pseudo-events a client raises about its own connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Signal,
    Proposal,
    Decision,
    Outcome,
    Risk,
    System,
    Pong,
    SubscriptionUpdated,
    /// Sent first on a push stream; raised locally when a client transport connects.
    Connection,
    /// Client-local only.
    Disconnection,
    /// Client-local only.
    Error,
}

impl EventKind {
    /// The domain topic this kind belongs to, `None` for protocol kinds.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            EventKind::Signal => Some(Topic::Signal),
            EventKind::Proposal => Some(Topic::Proposal),
            EventKind::Decision => Some(Topic::Decision),
            EventKind::Outcome => Some(Topic::Outcome),
            EventKind::Risk => Some(Topic::Risk),
            EventKind::System => Some(Topic::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Pong => "pong",
            EventKind::SubscriptionUpdated => "subscription_updated",
            EventKind::Connection => "connection",
            EventKind::Disconnection => "disconnection",
            EventKind::Error => "error",
            domain => match domain.topic() {
                Some(topic) => topic.as_str(),
                None => "unknown",
            },
        }
    }
}

impl From<Topic> for EventKind {
    fn from(topic: Topic) -> Self {
        match topic {
            Topic::Signal => EventKind::Signal,
            Topic::Proposal => EventKind::Proposal,
            Topic::Decision => EventKind::Decision,
            Topic::Outcome => EventKind::Outcome,
            Topic::Risk => EventKind::Risk,
            Topic::System => EventKind::System,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_topics_are_dropped() {
        let set = Topic::parse_lenient(["risk", "gossip", "signal", "RISK"]);
        assert_eq!(set, TopicSet::from([Topic::Signal, Topic::Risk]));
    }

    #[test]
    fn csv_parsing_trims_and_skips_empty_entries() {
        let set = Topic::parse_csv(" signal, ,proposal,");
        assert_eq!(set, TopicSet::from([Topic::Signal, Topic::Proposal]));
        assert!(Topic::parse_csv("").is_empty());
    }

    #[test]
    fn names_follow_canonical_order() {
        let set = TopicSet::from([Topic::System, Topic::Signal, Topic::Risk]);
        assert_eq!(Topic::names(&set), vec!["signal", "risk", "system"]);
    }

    #[test]
    fn kind_and_topic_agree() {
        for topic in Topic::ALL {
            let kind = EventKind::from(topic);
            assert_eq!(kind.topic(), Some(topic));
            assert_eq!(kind.as_str(), topic.as_str());
        }
        assert_eq!(EventKind::SubscriptionUpdated.topic(), None);
        assert_eq!(EventKind::SubscriptionUpdated.as_str(), "subscription_updated");
    }
}
