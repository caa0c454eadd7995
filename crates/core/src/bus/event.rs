//! # Bus Events
//!
//! Immutable message envelope shared read-only by every subscriber.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved topic carrying synthesized failure notifications
pub const ERROR_TOPIC: &str = "_error";

/// Metadata attached to every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub id: Uuid,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Optional caller-supplied correlation identifier
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Agent that published the event, if any
    #[serde(default)]
    pub source_agent_id: Option<String>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            source_agent_id: None,
        }
    }
}

impl EventMetadata {
    /// Fresh metadata with a new id and the current time
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a correlation identifier
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach the publishing agent
    pub fn with_source(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }
}

/// A published event
///
/// Cloning is cheap: the payload is reference counted and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    topic: String,
    payload: Arc<Value>,
    metadata: EventMetadata,
}

impl Event {
    /// Build an event from already-validated parts
    pub(crate) fn new(topic: impl Into<String>, payload: Value, metadata: EventMetadata) -> Self {
        Self {
            topic: topic.into(),
            payload: Arc::new(payload),
            metadata,
        }
    }

    /// Dot-segmented topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Read-only payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Event metadata
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Shortcut for `metadata().id`
    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    /// Shortcut for `metadata().source_agent_id`
    pub fn source_agent_id(&self) -> Option<&str> {
        self.metadata.source_agent_id.as_deref()
    }

    /// Shortcut for `metadata().correlation_id`
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id.as_deref()
    }

    /// Whether this is a system failure notification
    pub fn is_error_event(&self) -> bool {
        self.topic == ERROR_TOPIC
    }
}

/// Kind of failure reported on [`ERROR_TOPIC`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error or panicked
    HandlerError,
    /// The handler exceeded its timeout
    DispatchTimeout,
}

/// Payload of an event published on [`ERROR_TOPIC`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Topic of the event whose handler failed
    pub original_topic: String,
    /// Subscriber whose handler failed
    pub subscriber_id: String,
    /// Subscription that received the delivery
    pub subscription_id: Uuid,
    /// Human-readable failure
    pub error_description: String,
    /// Id of the event whose handler failed
    pub original_event_id: Uuid,
    /// Failure category
    pub kind: FailureKind,
}

impl ErrorReport {
    /// Decode the payload of an `_error` event
    pub fn from_event(event: &Event) -> Option<Self> {
        if !event.is_error_event() {
            return None;
        }
        serde_json::from_value(event.payload().clone()).ok()
    }

    /// Wrap this report into an `_error` event correlated with the original
    pub(crate) fn into_event(self, original: &Event) -> Event {
        let correlation = original
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| original.id().to_string());
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        Event::new(
            ERROR_TOPIC,
            payload,
            EventMetadata::new().with_correlation_id(correlation),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_creation() {
        let event = Event::new(
            "user.request",
            json!({"data": "hello"}),
            EventMetadata::new().with_source("architect-01"),
        );

        assert_eq!(event.topic(), "user.request");
        assert_eq!(event.payload()["data"], "hello");
        assert_eq!(event.source_agent_id(), Some("architect-01"));
        assert!(event.correlation_id().is_none());
        assert!(!event.is_error_event());
    }

    #[test]
    fn test_clones_share_payload() {
        let event = Event::new("a.b", json!({"n": 1}), EventMetadata::new());
        let copy = event.clone();
        assert!(Arc::ptr_eq(&event.payload, &copy.payload));
        assert_eq!(event, copy);
    }

    #[test]
    fn test_error_report_round_trip_through_event() {
        let original = Event::new(
            "code.generated",
            json!({}),
            EventMetadata::new().with_correlation_id("req-7"),
        );
        let report = ErrorReport {
            original_topic: original.topic().to_string(),
            subscriber_id: "qa".to_string(),
            subscription_id: Uuid::new_v4(),
            error_description: "boom".to_string(),
            original_event_id: original.id(),
            kind: FailureKind::HandlerError,
        };

        let event = report.clone().into_event(&original);
        assert!(event.is_error_event());
        assert_eq!(event.correlation_id(), Some("req-7"));
        assert_eq!(event.payload()["kind"], "handler_error");
        assert_eq!(ErrorReport::from_event(&event), Some(report));
        assert_eq!(ErrorReport::from_event(&original), None);
    }

    #[test]
    fn test_error_event_falls_back_to_event_id_for_correlation() {
        let original = Event::new("a.b", json!(null), EventMetadata::new());
        let report = ErrorReport {
            original_topic: "a.b".to_string(),
            subscriber_id: "s".to_string(),
            subscription_id: Uuid::new_v4(),
            error_description: "late".to_string(),
            original_event_id: original.id(),
            kind: FailureKind::DispatchTimeout,
        };
        let event = report.into_event(&original);
        assert_eq!(event.correlation_id(), Some(original.id().to_string().as_str()));
    }
}
