//! Fire-and-forget live feed of alert and remediation activity.

use mailmon_common::types::{AlertEvent, TargetStatus};
use serde::Serialize;
use tokio::sync::broadcast;

pub const TOPIC_ALERT_FIRED: &str = "alerts.fired";
pub const TOPIC_ALERT_RESOLVED: &str = "alerts.resolved";
pub const TOPIC_REMEDIATION_APPLIED: &str = "remediation.applied";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    AlertFired { event: AlertEvent },
    AlertResolved { event: AlertEvent },
    RemediationApplied {
        target_id: String,
        source: String,
        status: TargetStatus,
        event: Option<AlertEvent>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveMessage {
    pub topic: String,
    #[serde(flatten)]
    pub event: LiveEvent,
}

/// Sink for live events. Publishing never blocks and never fails the caller.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, event: LiveEvent);
}

/// [`EventPublisher`] over a tokio broadcast channel.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<LiveMessage>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveMessage> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, topic: &str, event: LiveEvent) {
        let message = LiveMessage {
            topic: topic.to_string(),
            event,
        };
        // No subscribers is the normal idle state.
        if self.tx.send(message).is_err() {
            tracing::trace!(topic, "No live subscribers");
        }
    }
}

/// Discards everything.
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _topic: &str, _event: LiveEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailmon_common::types::Severity;

    #[tokio::test]
    async fn subscribers_receive_topic_and_payload() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let event = AlertEvent::firing(
            "r1",
            "High CPU",
            Severity::Critical,
            "cpu high",
            serde_json::Value::Null,
            None,
            Utc::now(),
        );
        publisher.publish(TOPIC_ALERT_FIRED, LiveEvent::AlertFired { event: event.clone() });

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, TOPIC_ALERT_FIRED);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["kind"], "alert_fired");
        assert_eq!(json["event"]["id"], event.id);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(1);
        publisher.publish(
            TOPIC_REMEDIATION_APPLIED,
            LiveEvent::RemediationApplied {
                target_id: "ip-1".into(),
                source: "zen".into(),
                status: TargetStatus::Paused,
                event: None,
            },
        );
    }
}
