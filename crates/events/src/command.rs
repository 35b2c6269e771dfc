use crate::error::EventsError;
use crate::topic::{Topic, TopicSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a heartbeat ping: the client's clock in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A message sent by a client over the bidirectional transport.
///
/// `{"type": "subscribe", "subscriptions": ["risk"]}`
/// `{"type": "ping", "data": {"timestamp": 1700000000000}}`
///
/// Topic names stay strings here so that one unknown name does not reject the
/// whole command; `topics()` applies the closed-set filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Subscribe {
        #[serde(default)]
        subscriptions: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        subscriptions: Vec<String>,
    },
    Ping {
        #[serde(default)]
        data: PingData,
    },
}

impl Command {
    const KNOWN_TYPES: [&'static str; 3] = ["subscribe", "unsubscribe", "ping"];

    pub fn subscribe<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        Command::Subscribe {
            subscriptions: topics.into_iter().map(|t| t.as_str().to_string()).collect(),
        }
    }

    pub fn unsubscribe<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        Command::Unsubscribe {
            subscriptions: topics.into_iter().map(|t| t.as_str().to_string()).collect(),
        }
    }

    pub fn ping(timestamp_millis: i64) -> Self {
        Command::Ping {
            data: PingData {
                timestamp: Some(timestamp_millis),
            },
        }
    }

    /// Parses an inbound frame, telling unknown command types apart from
    /// frames that are not commands at all.
    pub fn parse(raw: &str) -> Result<Self, EventsError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| EventsError::MalformedCommand(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventsError::MalformedCommand("missing `type` field".to_string()))?;
        if !Self::KNOWN_TYPES.contains(&kind) {
            return Err(EventsError::UnknownCommand(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| EventsError::MalformedCommand(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Ping { .. } => "ping",
        }
    }

    /// The recognised topics named by a subscribe/unsubscribe command.
    pub fn topics(&self) -> TopicSet {
        match self {
            Command::Subscribe { subscriptions } | Command::Unsubscribe { subscriptions } => {
                Topic::parse_lenient(subscriptions)
            }
            Command::Ping { .. } => TopicSet::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, EventsError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_wire_shape() {
        let cmd = Command::subscribe(&[Topic::Risk, Topic::Signal]);
        let wire: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(wire["type"], "subscribe");
        assert_eq!(wire["subscriptions"], serde_json::json!(["risk", "signal"]));
    }

    #[test]
    fn ping_wire_shape() {
        let cmd = Command::parse(r#"{"type":"ping","data":{"timestamp":42}}"#).unwrap();
        assert_eq!(cmd, Command::ping(42));
        let bare = Command::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(bare, Command::Ping { data: PingData::default() });
    }

    #[test]
    fn unknown_topics_survive_parsing_but_are_filtered() {
        let cmd = Command::parse(r#"{"type":"subscribe","subscriptions":["risk","weather"]}"#)
            .unwrap();
        assert_eq!(cmd.topics(), TopicSet::from([Topic::Risk]));
    }

    #[test]
    fn unknown_and_malformed_commands_are_distinguished() {
        assert!(matches!(
            Command::parse(r#"{"type":"shutdown"}"#),
            Err(EventsError::UnknownCommand(t)) if t == "shutdown"
        ));
        assert!(matches!(
            Command::parse("not json"),
            Err(EventsError::MalformedCommand(_))
        ));
        assert!(matches!(
            Command::parse(r#"{"subscriptions":[]}"#),
            Err(EventsError::MalformedCommand(_))
        ));
        assert!(matches!(
            Command::parse(r#"{"type":"subscribe","subscriptions":"risk"}"#),
            Err(EventsError::MalformedCommand(_))
        ));
    }
}
