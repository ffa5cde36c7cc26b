use crate::broker::MessageSender;
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::OutgoingMessage;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A wrapper around a backend sender bound to one queue or topic.
///
/// The sender is protected by a mutex so the producer can be shared across
/// tasks. Once disposed, every send fails with [`ServiceBusError::Disposed`].
///
/// # Examples
///
/// ```no_run
/// use server::broker::{InMemoryBroker, ServiceBusBackend};
/// use server::model::OutgoingMessage;
/// use server::producer::Producer;
///
/// async fn example(broker: InMemoryBroker) -> server::common::ServiceBusResult<()> {
///     let producer = Producer::new(broker.create_sender("orders").await?, "orders");
///
///     producer.send_message(OutgoingMessage::text("Hello, world!")).await?;
///     producer
///         .send_messages(vec![
///             OutgoingMessage::text("Message 1"),
///             OutgoingMessage::text("Message 2"),
///         ])
///         .await?;
///
///     producer.dispose().await
/// }
/// ```
#[derive(Clone)]
pub struct Producer {
    sender: Arc<Mutex<Option<Box<dyn MessageSender>>>>,
    entity: String,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("entity", &self.entity)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Producer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.sender, &other.sender)
    }
}

impl Producer {
    pub fn new(sender: Box<dyn MessageSender>, entity: impl Into<String>) -> Self {
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            entity: entity.into(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Sends a single message.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender has been disposed or the broker rejects the message
    pub async fn send_message(&self, message: OutgoingMessage) -> ServiceBusResult<()> {
        self.send_messages(vec![message]).await
    }

    /// Sends all messages as one batch. The broker accepts all of them or none.
    pub async fn send_messages(&self, messages: Vec<OutgoingMessage>) -> ServiceBusResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut guard = self.sender.lock().await;
        let sender = guard
            .as_mut()
            .ok_or_else(|| ServiceBusError::Disposed("Sender".to_string()))?;
        sender.send(messages).await
    }

    pub async fn dispose(&self) -> ServiceBusResult<()> {
        let mut guard = self.sender.lock().await;
        if let Some(mut sender) = guard.take() {
            sender.close().await?;
        }
        Ok(())
    }
}
