//! Data models shared by the operations layer, the backends and the live stream engine.

use crate::common::{ServiceBusError, ServiceBusResult};
use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Suffix the broker uses for the dead-letter sub-queue of any entity.
pub const DEAD_LETTER_SUFFIX: &str = "$DeadLetterQueue";

/// Kind of Service Bus entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Queue,
    Topic,
    Subscription,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Queue => write!(f, "queue"),
            EntityKind::Topic => write!(f, "topic"),
            EntityKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// Snapshot of an entity as returned by a directory listing.
///
/// Snapshots are never patched in place; every listing produces fresh values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub kind: EntityKind,
    /// Owning topic, set for subscriptions only
    pub parent_topic: Option<String>,
    pub requires_session: bool,
    pub active_count: i64,
    pub dead_letter_count: i64,
    pub scheduled_count: i64,
    pub size_bytes: i64,
    pub default_ttl: Option<Duration>,
    pub lock_duration: Option<Duration>,
}

impl EntityDescriptor {
    /// Descriptor with zero counts, used when only the name and kind are known.
    pub fn named(name: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent_topic: None,
            requires_session: false,
            active_count: 0,
            dead_letter_count: 0,
            scheduled_count: 0,
            size_bytes: 0,
            default_ttl: None,
            lock_duration: None,
        }
    }

    pub fn address(&self) -> EntityAddress {
        match (&self.kind, &self.parent_topic) {
            (EntityKind::Subscription, Some(topic)) => {
                EntityAddress::subscription(topic.clone(), self.name.clone())
            }
            _ => EntityAddress::entity(self.name.clone()),
        }
    }
}

/// Where a receiver or sender is pointed: a queue or topic, optionally a
/// subscription of that topic, optionally its dead-letter sub-queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityAddress {
    pub entity: String,
    pub subscription: Option<String>,
    pub dead_letter: bool,
}

impl EntityAddress {
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            subscription: None,
            dead_letter: false,
        }
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            entity: topic.into(),
            subscription: Some(subscription.into()),
            dead_letter: false,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: bool) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// The same entity without the dead-letter flag.
    pub fn main(&self) -> Self {
        self.clone().with_dead_letter(false)
    }

    /// Parses user-supplied entity and subscription strings.
    ///
    /// Accepts `queue`, `topic/subscriptions/sub`, either of them suffixed with
    /// `/$DeadLetterQueue` (any case), and tolerates surrounding slashes and
    /// whitespace. An explicit `subscription` argument wins over one embedded in
    /// the path.
    pub fn parse(entity: &str, subscription: Option<&str>) -> ServiceBusResult<Self> {
        let trimmed = entity.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(ServiceBusError::InvalidEntityPath(entity.to_string()));
        }

        let mut segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        let mut dead_letter = false;
        if segments
            .last()
            .is_some_and(|last| last.eq_ignore_ascii_case(DEAD_LETTER_SUFFIX))
        {
            segments.pop();
            dead_letter = true;
        }

        let (name, embedded_subscription) = match segments.as_slice() {
            [name] => (name.to_string(), None),
            [topic, marker, sub] if marker.eq_ignore_ascii_case("subscriptions") => {
                (topic.to_string(), Some(sub.to_string()))
            }
            _ => return Err(ServiceBusError::InvalidEntityPath(entity.to_string())),
        };

        let subscription = match subscription.map(str::trim).filter(|s| !s.is_empty()) {
            Some(explicit) => Some(explicit.trim_matches('/').to_string()),
            None => embedded_subscription,
        };

        Ok(Self {
            entity: name,
            subscription,
            dead_letter,
        })
    }

    /// Canonical broker path, e.g. `orders/Subscriptions/audit/$DeadLetterQueue`.
    pub fn path(&self) -> String {
        let mut path = match &self.subscription {
            Some(sub) => format!("{}/Subscriptions/{}", self.entity, sub),
            None => self.entity.clone(),
        };
        if self.dead_letter {
            path.push('/');
            path.push_str(DEAD_LETTER_SUFFIX);
        }
        path
    }

    /// Kind of the addressed entity as far as the path can tell.
    pub fn kind(&self) -> EntityKind {
        if self.subscription.is_some() {
            EntityKind::Subscription
        } else {
            EntityKind::Queue
        }
    }
}

impl std::fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

/// State of a message as reported by the broker.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MessageState {
    #[default]
    Active,
    Deferred,
    Scheduled,
}

/// Read-only snapshot of a message obtained by peek or receive.
///
/// The sequence number is the identity used for delete and resend round-trips;
/// the message id is informational only and may repeat across resends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageRecord {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub session_id: Option<String>,
    pub properties: BTreeMap<String, Value>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub expires_at: Option<DateTime<Utc>>,
    pub lock_token: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub dead_letter_source: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub state: MessageState,
}

impl MessageRecord {
    /// Body decoded as UTF-8, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Attempts to parse the body as JSON first and falls back to raw text.
    pub fn body_data(&self) -> BodyData {
        match serde_json::from_slice::<Value>(&self.body) {
            Ok(val) => BodyData::ValidJson(val),
            Err(_) => BodyData::RawString(self.body_text()),
        }
    }

    pub fn message_id_or_unknown(&self) -> &str {
        self.message_id.as_deref().unwrap_or("unknown")
    }
}

/// Represents the body content of a message.
///
/// Bodies can be valid JSON that can be displayed structurally, or raw
/// string content that should be displayed as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyData {
    ValidJson(Value),
    RawString(String),
}

impl Serialize for BodyData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            BodyData::ValidJson(val) => val.serialize(serializer),
            BodyData::RawString(s) => serializer.serialize_str(s),
        }
    }
}

/// A message about to be sent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub session_id: Option<String>,
    pub partition_key: Option<String>,
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub properties: BTreeMap<String, Value>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Applies a default time-to-live when the message does not set one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        if self.time_to_live.is_none() {
            self.time_to_live = Some(ttl);
        }
        self
    }
}

impl From<&MessageRecord> for OutgoingMessage {
    /// Copy of a peeked or received message suitable for resending.
    ///
    /// Broker-assigned fields (sequence number, lock, enqueue time, dead-letter
    /// metadata) are dropped; user-settable fields and properties are kept.
    fn from(record: &MessageRecord) -> Self {
        Self {
            body: record.body.clone(),
            message_id: record.message_id.clone(),
            correlation_id: record.correlation_id.clone(),
            content_type: record.content_type.clone(),
            subject: record.subject.clone(),
            to: record.to.clone(),
            reply_to: record.reply_to.clone(),
            reply_to_session_id: record.reply_to_session_id.clone(),
            session_id: record.session_id.clone(),
            partition_key: record.partition_key.clone(),
            time_to_live: record.time_to_live,
            scheduled_enqueue_time: None,
            properties: record.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_queue() {
        let address = EntityAddress::parse(" /orders/ ", None).unwrap();
        assert_eq!(address, EntityAddress::entity("orders"));
        assert_eq!(address.path(), "orders");
    }

    #[test]
    fn parses_subscription_path_and_dead_letter_suffix() {
        let address = EntityAddress::parse("events/subscriptions/audit/$deadletterqueue", None)
            .unwrap();
        assert_eq!(address.entity, "events");
        assert_eq!(address.subscription.as_deref(), Some("audit"));
        assert!(address.dead_letter);
        assert_eq!(address.path(), "events/Subscriptions/audit/$DeadLetterQueue");
        assert_eq!(address.main().path(), "events/Subscriptions/audit");
    }

    #[test]
    fn explicit_subscription_wins() {
        let address = EntityAddress::parse("events", Some("billing")).unwrap();
        assert_eq!(address.kind(), EntityKind::Subscription);
        assert_eq!(address.path(), "events/Subscriptions/billing");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(EntityAddress::parse("", None).is_err());
        assert!(EntityAddress::parse("a/b", None).is_err());
    }

    #[test]
    fn resend_copy_keeps_user_fields_only() {
        let mut record = MessageRecord {
            message_id: Some("m-1".into()),
            body: b"{\"a\":1}".to_vec(),
            sequence_number: 42,
            session_id: Some("s-1".into()),
            dead_letter_reason: Some("MaxDeliveryCountExceeded".into()),
            ..Default::default()
        };
        record.properties.insert("tenant".into(), Value::from("contoso"));

        let outgoing = OutgoingMessage::from(&record);
        assert_eq!(outgoing.message_id.as_deref(), Some("m-1"));
        assert_eq!(outgoing.session_id.as_deref(), Some("s-1"));
        assert_eq!(outgoing.properties.get("tenant"), Some(&Value::from("contoso")));
        assert_eq!(record.body_data(), BodyData::ValidJson(serde_json::json!({"a": 1})));
    }
}
