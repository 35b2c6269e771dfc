use crate::error::EventsError;
use crate::payload::EventPayload;
use crate::topic::{EventKind, Topic, TopicSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// The unit of communication from server to client on both transports.
///
/// Serialized as a flat JSON object:
/// `{
///   "id": "6f1c...",
///   "type": "signal",
///   "data": { ... },
///   "timestamp": "2026-01-01T00:00:00Z",
///   "userId": "alice"
/// }`
/// `userId` is omitted for broadcasts. Envelopes are never mutated after they
/// are published; the builder-style methods consume and return `self`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Older producers omit the id; such envelopes get a fresh one and are never de-duplicated.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl EventEnvelope {
    /// Stamps a new envelope with a fresh id and the current time.
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            data,
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    /// Builds the canonical envelope for a domain object.
    pub fn from_payload<P: EventPayload>(payload: &P) -> Result<Self, EventsError> {
        let now = Utc::now();
        let data = serde_json::to_value(payload.to_data(now))?;
        Ok(Self {
            id: Uuid::new_v4(),
            kind: P::TOPIC.into(),
            data,
            timestamp: now,
            user_id: None,
        })
    }

    /// Restricts delivery to a single user.
    pub fn addressed_to(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn topic(&self) -> Option<Topic> {
        self.kind.topic()
    }

    /// The fan-out rule shared by both transports: the envelope's topic must be
    /// subscribed, and an addressed envelope only reaches its own user.
    pub fn is_deliverable_to(&self, user_id: &str, subscriptions: &TopicSet) -> bool {
        let Some(topic) = self.topic() else {
            return false;
        };
        if !subscriptions.contains(&topic) {
            return false;
        }
        match &self.user_id {
            Some(target) => target == user_id,
            None => true,
        }
    }

    pub fn to_json(&self) -> Result<String, EventsError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, EventsError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decodes `data` into a typed payload such as `SignalData`.
    pub fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventsError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    // --- Protocol replies ---

    /// The greeting sent on the socket right after a connection is registered.
    pub fn welcome(subscriptions: &TopicSet) -> Self {
        let now = Utc::now();
        Self::new(
            EventKind::System,
            json!({
                "message": "Connected to the event stream",
                "timestamp": now,
                "subscriptions": Topic::names(subscriptions),
            }),
        )
    }

    /// The first frame of a push stream.
    pub fn push_connected(subscriptions: &TopicSet) -> Self {
        let now = Utc::now();
        Self::new(
            EventKind::Connection,
            json!({
                "message": "Push stream established",
                "timestamp": now,
                "subscriptions": Topic::names(subscriptions),
            }),
        )
    }

    pub fn subscription_updated(subscriptions: &TopicSet) -> Self {
        let now = Utc::now();
        Self::new(
            EventKind::SubscriptionUpdated,
            json!({
                "subscriptions": Topic::names(subscriptions),
                "timestamp": now,
            }),
        )
    }

    /// Heartbeat reply. `timestamp` echoes the client's ping so it can measure round trips.
    pub fn pong(echo: Option<i64>) -> Self {
        let now = Utc::now();
        Self::new(
            EventKind::Pong,
            json!({
                "timestamp": echo.unwrap_or_else(|| now.timestamp_millis()),
                "serverTime": now,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_omits_user_id_on_the_wire() {
        let envelope = EventEnvelope::new(EventKind::Risk, json!({"risk_score": "0.4"}));
        let wire: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(wire["type"], "risk");
        assert!(wire.get("userId").is_none());

        let addressed = envelope.addressed_to("alice");
        let wire: Value = serde_json::from_str(&addressed.to_json().unwrap()).unwrap();
        assert_eq!(wire["userId"], "alice");
    }

    #[test]
    fn delivery_requires_topic_and_matching_user() {
        let risk_only = TopicSet::from([Topic::Risk]);
        let risk = EventEnvelope::new(EventKind::Risk, Value::Null);
        let signal = EventEnvelope::new(EventKind::Signal, Value::Null);

        assert!(risk.is_deliverable_to("bob", &risk_only));
        assert!(!signal.is_deliverable_to("bob", &risk_only));

        let for_alice = risk.clone().addressed_to("alice");
        assert!(for_alice.is_deliverable_to("alice", &risk_only));
        assert!(!for_alice.is_deliverable_to("bob", &risk_only));
    }

    #[test]
    fn protocol_kinds_are_never_fanned_out() {
        let pong = EventEnvelope::pong(Some(1));
        assert!(!pong.is_deliverable_to("anonymous", &Topic::all()));
    }

    #[test]
    fn missing_id_is_filled_on_decode() {
        let raw = r#"{"type":"system","data":{"message":"hi"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let envelope = EventEnvelope::from_json(raw).unwrap();
        assert_eq!(envelope.kind, EventKind::System);
        assert_eq!(envelope.data["message"], "hi");
        assert!(envelope.user_id.is_none());
    }

    #[test]
    fn pong_echoes_client_timestamp() {
        let pong = EventEnvelope::pong(Some(1_700_000_000_000));
        assert_eq!(pong.data["timestamp"], 1_700_000_000_000_i64);
    }
}
