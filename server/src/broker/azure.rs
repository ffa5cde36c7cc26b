//! Azure Service Bus backend built on `azservicebus`.

use super::{MessageReceiver, MessageSender, ServiceBusBackend, SessionReceiver};
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{EntityAddress, MessageRecord, MessageState, OutgoingMessage};
use async_trait::async_trait;
use azservicebus::core::BasicRetryPolicy;
use azservicebus::prelude::ServiceBusPeekedMessage;
use azservicebus::primitives::service_bus_message_state::ServiceBusMessageState;
use azservicebus::{
    ServiceBusClient, ServiceBusClientOptions, ServiceBusMessage, ServiceBusReceivedMessage,
    ServiceBusReceiver, ServiceBusReceiverOptions, ServiceBusSender, ServiceBusSenderOptions,
    ServiceBusSessionReceiver, ServiceBusSessionReceiverOptions,
};
use azure_core::date::OffsetDateTime;
use chrono::{DateTime, Utc};
use fe2o3_amqp::types::messaging::ApplicationProperties;
use fe2o3_amqp::types::primitives::SimpleValue;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One AMQP connection to a namespace.
pub struct AzureBroker {
    client: Arc<Mutex<Option<ServiceBusClient<BasicRetryPolicy>>>>,
    endpoint: String,
}

impl AzureBroker {
    /// Opens a client from a SAS connection string.
    pub async fn connect(connection_string: &str, endpoint: String) -> ServiceBusResult<Self> {
        log::debug!("Opening Service Bus connection to {endpoint}");
        let client = ServiceBusClient::new_from_connection_string(
            connection_string,
            ServiceBusClientOptions::default(),
        )
        .await
        .map_err(|e| {
            ServiceBusError::ConnectionFailed(format!("Failed to create Service Bus client: {e}"))
        })?;

        Ok(Self {
            client: Arc::new(Mutex::new(Some(client))),
            endpoint,
        })
    }
}

fn convert_time(time: OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(time.unix_timestamp(), time.nanosecond())
}

fn offset_time(time: DateTime<Utc>) -> Option<OffsetDateTime> {
    let nanos = time.timestamp_nanos_opt()?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).ok()
}

/// The SDK reports an unset schedule as the Unix epoch.
fn scheduled_time(time: OffsetDateTime) -> Option<DateTime<Utc>> {
    if time.unix_timestamp() > 0 {
        convert_time(time)
    } else {
        None
    }
}

fn convert_state(state: ServiceBusMessageState) -> MessageState {
    match state {
        ServiceBusMessageState::Active => MessageState::Active,
        ServiceBusMessageState::Deferred => MessageState::Deferred,
        ServiceBusMessageState::Scheduled => MessageState::Scheduled,
    }
}

/// JSON property value as an AMQP application property. Arrays and objects
/// have no AMQP simple-value counterpart and travel as their JSON text.
fn to_amqp_value(value: &Value) -> SimpleValue {
    match value {
        Value::Null => SimpleValue::Null,
        Value::Bool(b) => SimpleValue::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SimpleValue::from(i)
            } else if let Some(u) = n.as_u64() {
                SimpleValue::from(u)
            } else {
                SimpleValue::from(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SimpleValue::from(s.clone()),
        other => SimpleValue::from(other.to_string()),
    }
}

fn from_amqp_value(value: &SimpleValue) -> Value {
    match value {
        SimpleValue::Null => Value::Null,
        SimpleValue::Bool(b) => Value::from(*b),
        SimpleValue::Ubyte(v) => Value::from(*v),
        SimpleValue::Ushort(v) => Value::from(*v),
        SimpleValue::Uint(v) => Value::from(*v),
        SimpleValue::Ulong(v) => Value::from(*v),
        SimpleValue::Byte(v) => Value::from(*v),
        SimpleValue::Short(v) => Value::from(*v),
        SimpleValue::Int(v) => Value::from(*v),
        SimpleValue::Long(v) => Value::from(*v),
        SimpleValue::Float(v) => Value::from(f64::from(v.0)),
        SimpleValue::Double(v) => Value::from(v.0),
        SimpleValue::Char(c) => Value::from(c.to_string()),
        SimpleValue::Timestamp(t) => DateTime::<Utc>::from_timestamp_millis(t.milliseconds())
            .map(|time| Value::from(time.to_rfc3339()))
            .unwrap_or(Value::Null),
        SimpleValue::Uuid(u) => Value::from(uuid::Uuid::from_bytes(*u.as_inner()).to_string()),
        SimpleValue::String(s) => Value::from(s.clone()),
        SimpleValue::Symbol(s) => Value::from(s.0.clone()),
        other => Value::from(format!("{other:?}")),
    }
}

fn read_properties(properties: Option<&ApplicationProperties>) -> BTreeMap<String, Value> {
    properties
        .map(|props| {
            props
                .iter()
                .map(|(key, value)| (key.clone(), from_amqp_value(value)))
                .collect()
        })
        .unwrap_or_default()
}

// Peeked and received messages expose the same getters without a shared trait.
macro_rules! record_from {
    ($msg:expr) => {{
        let msg = $msg;
        let time_to_live = msg.time_to_live();
        MessageRecord {
            message_id: msg.message_id().map(|s| s.to_string()),
            correlation_id: msg.correlation_id().map(|s| s.to_string()),
            content_type: msg.content_type().map(|s| s.to_string()),
            body: msg.body().map(<[u8]>::to_vec).unwrap_or_default(),
            enqueued_time: convert_time(msg.enqueued_time()),
            scheduled_enqueue_time: scheduled_time(msg.scheduled_enqueue_time()),
            sequence_number: msg.sequence_number(),
            delivery_count: msg.delivery_count().map(|c| c as u32).unwrap_or(0),
            session_id: msg.session_id().map(|s| s.to_string()),
            properties: read_properties(msg.application_properties()),
            subject: msg.subject().map(|s| s.to_string()),
            to: msg.to().map(|s| s.to_string()),
            reply_to: msg.reply_to().map(|s| s.to_string()),
            reply_to_session_id: msg.reply_to_session_id().map(|s| s.to_string()),
            partition_key: msg.partition_key().map(|s| s.to_string()),
            time_to_live,
            // Without a TTL the SDK reports the maximum representable instant
            expires_at: time_to_live.and_then(|_| convert_time(msg.expires_at())),
            dead_letter_reason: msg.dead_letter_reason().map(|s| s.to_string()),
            dead_letter_error_description: msg
                .dead_letter_error_description()
                .map(|s| s.to_string()),
            dead_letter_source: msg.dead_letter_source().map(|s| s.to_string()),
            state: convert_state(msg.state()),
            ..Default::default()
        }
    }};
}

fn peeked_record(msg: &ServiceBusPeekedMessage) -> MessageRecord {
    record_from!(msg)
}

fn received_record(msg: &ServiceBusReceivedMessage) -> MessageRecord {
    MessageRecord {
        lock_token: Some(uuid::Uuid::from_bytes(*msg.lock_token().as_inner()).to_string()),
        locked_until: msg.locked_until().and_then(convert_time),
        ..record_from!(msg)
    }
}

fn log_setter<E: std::fmt::Debug>(field: &str, result: Result<(), E>) {
    if let Err(e) = result {
        log::warn!("Failed to set {field} on outgoing message: {e:?}");
    }
}

fn outgoing_message(message: &OutgoingMessage) -> ServiceBusMessage {
    let mut sb_message = ServiceBusMessage::new(message.body.clone());
    if let Some(id) = &message.message_id {
        log_setter("message id", sb_message.set_message_id(id));
    }
    if message.session_id.is_some() {
        log_setter("session id", sb_message.set_session_id(message.session_id.clone()));
    }
    if message.partition_key.is_some() {
        log_setter(
            "partition key",
            sb_message.set_partition_key(message.partition_key.clone()),
        );
    }
    if message.reply_to_session_id.is_some() {
        log_setter(
            "reply-to session id",
            sb_message.set_reply_to_session_id(message.reply_to_session_id.clone()),
        );
    }
    if let Some(ttl) = message.time_to_live {
        log_setter("time to live", sb_message.set_time_to_live(ttl));
    }
    sb_message.set_correlation_id(message.correlation_id.clone());
    sb_message.set_content_type(message.content_type.clone());
    sb_message.set_subject(message.subject.clone());
    sb_message.set_to(message.to.clone());
    sb_message.set_reply_to(message.reply_to.clone());

    if let Some(at) = message.scheduled_enqueue_time {
        match offset_time(at) {
            Some(time) => sb_message.set_scheduled_enqueue_time(time),
            None => log::warn!("Scheduled enqueue time {at} is out of range, sending now"),
        }
    }

    if !message.properties.is_empty() {
        let mut properties = ApplicationProperties::default();
        for (key, value) in &message.properties {
            properties.insert(key.clone(), to_amqp_value(value));
        }
        *sb_message.application_properties_mut() = Some(properties);
    }
    sb_message
}

fn looks_like_timeout(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timeout") || lower.contains("timed out")
}

fn looks_like_not_found(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("notfound") || lower.contains("could not be found")
}

fn open_error(operation: &str, path: &str, error: impl std::fmt::Display) -> ServiceBusError {
    let message = error.to_string();
    if looks_like_not_found(&message) {
        ServiceBusError::EntityNotFound(path.to_string())
    } else {
        ServiceBusError::transport(operation, path, message)
    }
}

#[async_trait]
impl ServiceBusBackend for AzureBroker {
    async fn create_receiver(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn MessageReceiver>> {
        let path = address.path();
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| ServiceBusError::Disposed("Client".to_string()))?;

        let receiver = client
            .create_receiver_for_queue(path.clone(), ServiceBusReceiverOptions::default())
            .await
            .map_err(|e| open_error("open receiver", &path, e))?;

        Ok(Box::new(AzureReceiver {
            link: Link::Plain(receiver),
            path,
            held: HashMap::new(),
        }))
    }

    async fn accept_next_session(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn SessionReceiver>> {
        let path = address.path();
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| ServiceBusError::Disposed("Client".to_string()))?;

        let accepted = match &address.subscription {
            Some(subscription) => {
                client
                    .accept_next_session_for_subscription(
                        address.entity.clone(),
                        subscription.clone(),
                        ServiceBusSessionReceiverOptions::default(),
                    )
                    .await
            }
            None => {
                client
                    .accept_next_session_for_queue(
                        address.entity.clone(),
                        ServiceBusSessionReceiverOptions::default(),
                    )
                    .await
            }
        };

        let receiver = accepted.map_err(|e| {
            let message = e.to_string();
            if looks_like_timeout(&message) {
                ServiceBusError::TransientTimeout(format!("no sessions available on {path}"))
            } else {
                open_error("accept session", &path, message)
            }
        })?;

        let session_id = receiver.session_id().to_string();
        log::debug!("Accepted session '{session_id}' on {path}");
        Ok(Box::new(AzureSessionReceiver {
            inner: AzureReceiver {
                link: Link::Session(receiver),
                path,
                held: HashMap::new(),
            },
            session_id,
        }))
    }

    async fn create_sender(&self, entity: &str) -> ServiceBusResult<Box<dyn MessageSender>> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or_else(|| ServiceBusError::Disposed("Client".to_string()))?;

        let sender = client
            .create_sender(entity.to_string(), ServiceBusSenderOptions::default())
            .await
            .map_err(|e| open_error("open sender", entity, e))?;

        Ok(Box::new(AzureSender {
            sender: Some(sender),
            entity: entity.to_string(),
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn close(&self) -> ServiceBusResult<()> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            client.dispose().await.map_err(|e| {
                ServiceBusError::transport("close connection", &self.endpoint, e)
            })?;
            log::debug!("Closed Service Bus connection to {}", self.endpoint);
        }
        Ok(())
    }
}

enum Link {
    Plain(ServiceBusReceiver),
    Session(ServiceBusSessionReceiver),
    Closed,
}

// Both receiver kinds share method names but not a trait.
macro_rules! on_link {
    ($self:ident, $receiver:ident => $body:expr) => {
        match &mut $self.link {
            Link::Plain($receiver) => $body,
            Link::Session($receiver) => $body,
            Link::Closed => return Err(ServiceBusError::Disposed("Receiver".to_string())),
        }
    };
}

/// Receiver that keeps the SDK handles of the messages it holds so they can be
/// settled by sequence number.
pub struct AzureReceiver {
    link: Link,
    path: String,
    held: HashMap<i64, ServiceBusReceivedMessage>,
}

impl AzureReceiver {
    fn take_held(
        &mut self,
        operation: &str,
        sequence_number: i64,
    ) -> ServiceBusResult<ServiceBusReceivedMessage> {
        self.held.remove(&sequence_number).ok_or_else(|| {
            ServiceBusError::transport(
                operation,
                &self.path,
                format!("lock for message {sequence_number} is not held"),
            )
        })
    }
}

#[async_trait]
impl MessageReceiver for AzureReceiver {
    async fn peek(
        &mut self,
        max_count: u32,
        from_sequence: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        let path = self.path.clone();
        let messages = on_link!(self, receiver => receiver
            .peek_messages(max_count, from_sequence)
            .await
            .map_err(|e| open_error("peek", &path, e))?);
        Ok(messages.iter().map(peeked_record).collect())
    }

    async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        let path = self.path.clone();
        let received = on_link!(self, receiver => {
            match tokio::time::timeout(max_wait, receiver.receive_messages(max_count)).await {
                Ok(result) => result.map_err(|e| open_error("receive", &path, e))?,
                Err(_) => {
                    log::debug!("receive on {path} timed out after {max_wait:?}, returning empty result");
                    Vec::new()
                }
            }
        });

        let records = received.iter().map(received_record).collect();
        for message in received {
            self.held.insert(message.sequence_number(), message);
        }
        Ok(records)
    }

    async fn complete(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        let message = self.take_held("complete", sequence_number)?;
        let path = self.path.clone();
        let result = on_link!(self, receiver => receiver
            .complete_message(&message)
            .await
            .map_err(|e| e.to_string()));
        if let Err(e) = result {
            self.held.insert(sequence_number, message);
            return Err(ServiceBusError::transport("complete", path, e));
        }
        Ok(())
    }

    async fn abandon(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        let message = self.take_held("abandon", sequence_number)?;
        let path = self.path.clone();
        on_link!(self, receiver => receiver
            .abandon_message(&message, None)
            .await
            .map_err(|e| ServiceBusError::transport("abandon", path, e))?);
        Ok(())
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        let held: Vec<ServiceBusReceivedMessage> = self.held.drain().map(|(_, m)| m).collect();
        if !held.is_empty() {
            log::debug!("Releasing {} held locks on {}", held.len(), self.path);
            for message in &held {
                let result = match &mut self.link {
                    Link::Plain(receiver) => receiver
                        .abandon_message(message, None)
                        .await
                        .map_err(|e| e.to_string()),
                    Link::Session(receiver) => receiver
                        .abandon_message(message, None)
                        .await
                        .map_err(|e| e.to_string()),
                    Link::Closed => break,
                };
                if let Err(e) = result {
                    log::warn!(
                        "Failed to release lock for message {} on {}: {}",
                        message.sequence_number(),
                        self.path,
                        e
                    );
                }
            }
        }

        let result = match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Plain(receiver) => receiver.dispose().await.map_err(|e| e.to_string()),
            Link::Session(receiver) => receiver.dispose().await.map_err(|e| e.to_string()),
            Link::Closed => Ok(()),
        };
        result.map_err(|e| ServiceBusError::transport("close receiver", &self.path, e))
    }
}

pub struct AzureSessionReceiver {
    inner: AzureReceiver,
    session_id: String,
}

#[async_trait]
impl MessageReceiver for AzureSessionReceiver {
    async fn peek(
        &mut self,
        max_count: u32,
        from_sequence: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.inner.peek(max_count, from_sequence).await
    }

    async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.inner.receive(max_count, max_wait).await
    }

    async fn complete(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.inner.complete(sequence_number).await
    }

    async fn abandon(&mut self, sequence_number: i64) -> ServiceBusResult<()> {
        self.inner.abandon(sequence_number).await
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        self.inner.close().await
    }
}

#[async_trait]
impl SessionReceiver for AzureSessionReceiver {
    fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct AzureSender {
    sender: Option<ServiceBusSender>,
    entity: String,
}

#[async_trait]
impl MessageSender for AzureSender {
    async fn send(&mut self, messages: Vec<OutgoingMessage>) -> ServiceBusResult<()> {
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| ServiceBusError::Disposed("Sender".to_string()))?;

        let count = messages.len();
        let batch: Vec<ServiceBusMessage> = messages.iter().map(outgoing_message).collect();
        sender
            .send_messages(batch)
            .await
            .map_err(|e| open_error("send", &self.entity, e))?;
        log::debug!("Sent {count} messages to {}", self.entity);
        Ok(())
    }

    async fn close(&mut self) -> ServiceBusResult<()> {
        if let Some(sender) = self.sender.take() {
            sender
                .dispose()
                .await
                .map_err(|e| ServiceBusError::transport("close sender", &self.entity, e))?;
        }
        Ok(())
    }
}
