use crate::error::ServerError;
use crate::manager::StreamingManager;
use crate::push::PushStreamHandler;
use core_types::{Decision, Outcome, Proposal, RiskAssessment, Signal, SystemStatus};
use events::{EventEnvelope, EventPayload, Topic};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A producer record as it arrives on the ingress endpoint:
/// `{"eventType": "signal", "data": { ...domain object... }}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub data: Value,
}

/// The entry point for domain code. Wraps each object in an envelope and hands
/// it to both transports.
///
/// Publishing never fails from the caller's point of view; problems are logged.
#[derive(Clone)]
pub struct EventPublisher {
    manager: Arc<StreamingManager>,
    push: Arc<PushStreamHandler>,
}

impl EventPublisher {
    pub fn new(manager: Arc<StreamingManager>, push: Arc<PushStreamHandler>) -> Self {
        Self { manager, push }
    }

    pub fn publish_signal(&self, signal: &Signal) {
        self.emit(signal, None);
    }

    pub fn publish_proposal(&self, proposal: &Proposal) {
        self.emit(proposal, None);
    }

    pub fn publish_decision(&self, decision: &Decision) {
        self.emit(decision, None);
    }

    pub fn publish_outcome(&self, outcome: &Outcome) {
        self.emit(outcome, None);
    }

    pub fn publish_risk(&self, assessment: &RiskAssessment) {
        self.emit(assessment, None);
    }

    pub fn publish_system(&self, status: &SystemStatus) {
        self.emit(status, None);
    }

    /// Publishes an object that only `user_id`'s connections will receive.
    pub fn publish_to_user<P: EventPayload>(&self, user_id: &str, payload: &P) {
        self.emit(payload, Some(user_id));
    }

    /// Decodes a producer record into its domain object and publishes it.
    pub fn publish_record(&self, record: &PublishRecord) -> Result<Topic, ServerError> {
        let result = record
            .event_type
            .parse::<Topic>()
            .map_err(|e| ServerError::InvalidRecord(e.to_string()))
            .and_then(|topic| {
                match topic {
                    Topic::Signal => self.publish_signal(&decode::<Signal>(topic, &record.data)?),
                    Topic::Proposal => {
                        self.publish_proposal(&decode::<Proposal>(topic, &record.data)?)
                    }
                    Topic::Decision => {
                        self.publish_decision(&decode::<Decision>(topic, &record.data)?)
                    }
                    Topic::Outcome => {
                        self.publish_outcome(&decode::<Outcome>(topic, &record.data)?)
                    }
                    Topic::Risk => self.publish_risk(&decode::<RiskAssessment>(topic, &record.data)?),
                    Topic::System => {
                        self.publish_system(&decode::<SystemStatus>(topic, &record.data)?)
                    }
                }
                Ok(topic)
            });

        if let Err(e) = &result {
            warn!(event_type = %record.event_type, error = %e, "Ignoring producer record.");
        }
        result
    }

    fn emit<P: EventPayload>(&self, payload: &P, user_id: Option<&str>) {
        let envelope = match EventEnvelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(topic = %P::TOPIC, error = %e, "Failed to build event envelope.");
                return;
            }
        };
        let envelope = match user_id {
            Some(user_id) => envelope.addressed_to(user_id),
            None => envelope,
        };

        let pushed = self.push.publish(&envelope);
        let event_id = envelope.id;
        if let Err(e) = self.manager.publish(envelope) {
            error!(event_id = %event_id, topic = %P::TOPIC, error = %e, "Socket fan-out skipped.");
        }
        debug!(event_id = %event_id, topic = %P::TOPIC, pushed, "Event published.");
    }
}

fn decode<T: DeserializeOwned>(topic: Topic, data: &Value) -> Result<T, ServerError> {
    serde_json::from_value(data.clone())
        .map_err(|e| ServerError::InvalidRecord(format!("{topic} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingSink;
    use chrono::Utc;
    use configuration::ServerSettings;
    use core_types::{AlertLevel, HealthStatus, SystemAlert};
    use events::{EventKind, SystemData};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Harness {
        publisher: EventPublisher,
        manager: Arc<StreamingManager>,
        push: Arc<PushStreamHandler>,
    }

    fn harness() -> Harness {
        let manager = Arc::new(StreamingManager::new(&ServerSettings::default()));
        let push = Arc::new(PushStreamHandler::new(16, Topic::all()));
        Harness {
            publisher: EventPublisher::new(manager.clone(), push.clone()),
            manager,
            push,
        }
    }

    fn risk() -> RiskAssessment {
        RiskAssessment {
            risk_score: dec!(0.42),
            var: dec!(0.03),
            cvar: dec!(0.05),
            volatility: dec!(0.18),
            correlation: None,
            recommendations: vec!["trim tech exposure".to_string()],
        }
    }

    #[tokio::test]
    async fn publishes_to_both_transports() {
        let h = harness();
        let sink = Arc::new(RecordingSink::default());
        h.manager.handle_connect(None, sink.clone()).await.unwrap();
        sink.clear();
        let (_, mut rx) = h.push.open(None, None);
        rx.recv().await.unwrap();

        h.publisher.publish_risk(&risk());
        h.manager.drain_queue().await;

        let socket = sink.envelopes();
        let pushed = rx.recv().await.unwrap();
        assert_eq!(socket.len(), 1);
        assert_eq!(socket[0].id, pushed.id);
        assert_eq!(pushed.kind, EventKind::Risk);
        assert_eq!(pushed.data["risk_score"], json!("0.42"));
    }

    #[tokio::test]
    async fn publish_to_user_addresses_the_envelope() {
        let h = harness();
        let (_, mut rx) = h.push.open(Some("alice".to_string()), None);
        rx.recv().await.unwrap();

        let status = SystemStatus {
            health: HealthStatus::Degraded,
            metrics: BTreeMap::new(),
            alerts: vec![SystemAlert {
                level: AlertLevel::Warning,
                message: "lagging feed".to_string(),
            }],
        };
        h.publisher.publish_to_user("alice", &status);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.user_id.as_deref(), Some("alice"));
        let data: SystemData = envelope.decode_data().unwrap();
        assert_eq!(data.alerts[0].level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn records_are_decoded_into_domain_objects() {
        let h = harness();
        let (_, mut rx) = h.push.open(None, None);
        rx.recv().await.unwrap();

        let record = PublishRecord {
            event_type: "signal".to_string(),
            data: json!({
                "id": uuid::Uuid::new_v4(),
                "source": "news",
                "content": "Chip maker beats estimates",
                "scores": {"sentiment": 0.8},
                "timestamp": Utc::now(),
            }),
        };
        assert_eq!(h.publisher.publish_record(&record).unwrap(), Topic::Signal);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EventKind::Signal);
        assert_eq!(envelope.data["source"], "news");
        assert_eq!(h.manager.stats().await.queue_depth, 1);
    }

    #[test]
    fn bad_records_are_rejected() {
        let h = harness();
        let unknown = PublishRecord {
            event_type: "weather".to_string(),
            data: json!({}),
        };
        assert!(matches!(
            h.publisher.publish_record(&unknown),
            Err(ServerError::InvalidRecord(_))
        ));

        let malformed = PublishRecord {
            event_type: "risk".to_string(),
            data: json!({"risk_score": "high"}),
        };
        assert!(matches!(
            h.publisher.publish_record(&malformed),
            Err(ServerError::InvalidRecord(_))
        ));
    }
}
