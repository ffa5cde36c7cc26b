use crate::broker::MessageReceiver;
use crate::common::{ServiceBusError, ServiceBusResult};
use crate::model::{EntityAddress, MessageRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shareable handle around a backend receiver with dispose-once semantics.
///
/// Every call after [`Consumer::dispose`] fails with
/// [`ServiceBusError::Disposed`]; disposing twice is a no-op.
///
/// # Examples
///
/// ```no_run
/// use server::broker::{InMemoryBroker, ServiceBusBackend};
/// use server::consumer::Consumer;
/// use server::model::EntityAddress;
///
/// async fn example(broker: InMemoryBroker) -> server::common::ServiceBusResult<()> {
///     let address = EntityAddress::entity("orders");
///     let receiver = broker.create_receiver(&address).await?;
///     let consumer = Consumer::new(receiver, address);
///
///     let messages = consumer.peek_messages(10, None).await?;
///     println!("peeked {} messages", messages.len());
///     consumer.dispose().await
/// }
/// ```
#[derive(Clone)]
pub struct Consumer {
    receiver: Arc<Mutex<Option<Box<dyn MessageReceiver>>>>,
    address: EntityAddress,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Consumer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

fn disposed() -> ServiceBusError {
    ServiceBusError::Disposed("Receiver".to_string())
}

impl Consumer {
    pub fn new(receiver: Box<dyn MessageReceiver>, address: EntityAddress) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(Some(receiver))),
            address,
        }
    }

    pub fn address(&self) -> &EntityAddress {
        &self.address
    }

    pub async fn peek_messages(
        &self,
        max_count: u32,
        from_sequence_number: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;
        receiver.peek(max_count, from_sequence_number).await
    }

    /// Receives up to `max_count` messages; an expired window yields an empty batch.
    pub async fn receive_messages_with_timeout(
        &self,
        max_count: u32,
        timeout: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;
        let messages = receiver.receive(max_count, timeout).await?;
        if messages.is_empty() {
            log::debug!(
                "receive on {} returned nothing within {:?}",
                self.address,
                timeout
            );
        }
        Ok(messages)
    }

    pub async fn complete_message(&self, sequence_number: i64) -> ServiceBusResult<()> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;
        receiver.complete(sequence_number).await
    }

    pub async fn abandon_message(&self, sequence_number: i64) -> ServiceBusResult<()> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;
        receiver.abandon(sequence_number).await
    }

    /// Completes each message independently and returns the sequence numbers
    /// that were actually completed. Individual failures are logged, not returned.
    pub async fn complete_messages(
        &self,
        messages: &[MessageRecord],
    ) -> ServiceBusResult<Vec<i64>> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;

        let mut completed = Vec::with_capacity(messages.len());
        for message in messages {
            let sequence = message.sequence_number;
            match receiver.complete(sequence).await {
                Ok(()) => {
                    log::debug!(
                        "Completed message {} (sequence: {})",
                        message.message_id_or_unknown(),
                        sequence
                    );
                    completed.push(sequence);
                }
                Err(e) => {
                    // Keep going; the rest of the batch may still settle
                    log::warn!(
                        "Failed to complete message {} (sequence: {}): {}",
                        message.message_id_or_unknown(),
                        sequence,
                        e
                    );
                }
            }
        }

        log::debug!(
            "Batch completion on {}: {} successful, {} failed out of {} messages",
            self.address,
            completed.len(),
            messages.len() - completed.len(),
            messages.len()
        );
        Ok(completed)
    }

    /// Abandons each message, returning how many locks were released.
    pub async fn abandon_messages(&self, messages: &[MessageRecord]) -> ServiceBusResult<usize> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or_else(disposed)?;

        let mut released = 0;
        for message in messages {
            match receiver.abandon(message.sequence_number).await {
                Ok(()) => released += 1,
                Err(e) => log::warn!(
                    "Failed to abandon message {} (sequence: {}): {}",
                    message.message_id_or_unknown(),
                    message.sequence_number,
                    e
                ),
            }
        }
        Ok(released)
    }

    pub async fn is_disposed(&self) -> bool {
        self.receiver.lock().await.is_none()
    }

    pub async fn dispose(&self) -> ServiceBusResult<()> {
        let mut guard = self.receiver.lock().await;
        if let Some(mut receiver) = guard.take() {
            receiver.close().await?;
        }
        Ok(())
    }
}
