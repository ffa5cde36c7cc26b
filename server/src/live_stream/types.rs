use crate::model::{EntityAddress, EntityKind, MessageRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A message discovered by the live stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub message: MessageRecord,
    /// When this client saw the message
    pub received_at: DateTime<Utc>,
    pub entity_name: String,
    pub entity_kind: EntityKind,
    pub parent_topic: Option<String>,
}

impl StreamEvent {
    pub fn new(message: MessageRecord, address: &EntityAddress) -> Self {
        let (entity_name, parent_topic) = match &address.subscription {
            Some(subscription) => (subscription.clone(), Some(address.entity.clone())),
            None => (address.entity.clone(), None),
        };
        Self {
            message,
            received_at: Utc::now(),
            entity_name,
            entity_kind: address.kind(),
            parent_topic,
        }
    }

    pub fn sequence_number(&self) -> i64 {
        self.message.sequence_number
    }

    /// Case-insensitive substring match on message id, body, correlation id
    /// and session id. An empty filter matches everything.
    pub fn matches(&self, filter: &str) -> bool {
        let filter = filter.trim().to_lowercase();
        if filter.is_empty() {
            return true;
        }
        let contains = |value: Option<&str>| value.is_some_and(|v| v.to_lowercase().contains(&filter));

        contains(self.message.message_id.as_deref())
            || contains(Some(self.message.body_text().as_str()))
            || contains(self.message.correlation_id.as_deref())
            || contains(self.message.session_id.as_deref())
    }
}

/// Everything a subscriber of the engine receives.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotification {
    Message(StreamEvent),
    /// Fired only when streaming actually starts or stops
    StatusChanged(bool),
    Error(String),
}

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Stopping,
}

/// What to stream and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub address: EntityAddress,
    pub requires_session: bool,
    /// Peek polling when true, receive-and-abandon otherwise
    pub peek_only: bool,
}

impl StreamRequest {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            address: EntityAddress::entity(queue),
            requires_session: false,
            peek_only: true,
        }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            address: EntityAddress::subscription(topic, subscription),
            requires_session: false,
            peek_only: true,
        }
    }

    pub fn with_sessions(mut self, requires_session: bool) -> Self {
        self.requires_session = requires_session;
        self
    }

    pub fn with_peek_only(mut self, peek_only: bool) -> Self {
        self.peek_only = peek_only;
        self
    }
}

/// The stream currently owned by the engine.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub entity_name: String,
    pub subscription_name: Option<String>,
    pub is_session_enabled: bool,
    pub last_seen_sequence_number: i64,
    pub is_peek_only: bool,
    pub cancellation: CancellationToken,
}

/// Counters for the current (or last) stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub emitted: u64,
    pub errors: u64,
    pub last_sequence_number: i64,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> StreamEvent {
        let message = MessageRecord {
            message_id: Some("Order-42".into()),
            body: b"{\"total\": 10}".to_vec(),
            session_id: Some("Customer-7".into()),
            sequence_number: 3,
            ..Default::default()
        };
        StreamEvent::new(message, &EntityAddress::subscription("orders", "audit"))
    }

    #[test]
    fn subscription_events_carry_their_topic() {
        let event = event();
        assert_eq!(event.entity_name, "audit");
        assert_eq!(event.parent_topic.as_deref(), Some("orders"));
        assert_eq!(event.entity_kind, EntityKind::Subscription);
    }

    #[test]
    fn filter_is_case_insensitive_across_fields() {
        let event = event();
        assert!(event.matches("order-42"));
        assert!(event.matches("TOTAL"));
        assert!(event.matches("customer"));
        assert!(event.matches(""));
        assert!(!event.matches("invoice"));
    }
}
