use super::directory::EntityDirectory;
use super::peek::{PeekRequest, peek_sessions, peek_standard};
use super::{ConnectionValidation, OperationOptions, OperationsSource};
use crate::broker::ServiceBusBackend;
use crate::bulk_operations::{
    BulkOperationContext, BulkOperationResult, DeadLetterResubmitter, MessageDeleter,
    MessagePurger, MessageResender,
};
use crate::common::{ServiceBusError, ServiceBusResult, receive_bounded};
use crate::consumer::Consumer;
use crate::model::{EntityAddress, EntityDescriptor, MessageRecord, OutgoingMessage};
use crate::producer::Producer;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Operation helper shared by every connection mode.
///
/// Holds a connected backend, a directory for listings and the options the
/// bulk algorithms run with. Receivers and senders are opened per call and
/// closed before the call returns.
pub struct ServiceBusOperations {
    backend: Arc<dyn ServiceBusBackend>,
    directory: Arc<dyn EntityDirectory>,
    options: OperationOptions,
    scoped_entity: Option<String>,
}

impl std::fmt::Debug for ServiceBusOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBusOperations")
            .field("endpoint", &self.backend.endpoint())
            .field("scoped_entity", &self.scoped_entity)
            .finish_non_exhaustive()
    }
}

impl ServiceBusOperations {
    pub fn new(
        backend: Arc<dyn ServiceBusBackend>,
        directory: Arc<dyn EntityDirectory>,
        options: OperationOptions,
    ) -> Self {
        Self {
            backend,
            directory,
            options,
            scoped_entity: None,
        }
    }

    /// Marks the connection as limited to one queue or topic.
    pub fn with_scoped_entity(mut self, entity: Option<String>) -> Self {
        self.scoped_entity = entity;
        self
    }

    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    pub fn endpoint(&self) -> String {
        self.backend.endpoint()
    }

    pub fn scoped_entity(&self) -> Option<&str> {
        self.scoped_entity.as_deref()
    }

    pub async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.directory
            .list_queues()
            .await
            .inspect_err(|e| log::error!("Failed to list queues: {e}"))
    }

    pub async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.directory
            .list_topics()
            .await
            .inspect_err(|e| log::error!("Failed to list topics: {e}"))
    }

    pub async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.directory
            .list_subscriptions(topic)
            .await
            .inspect_err(|e| log::error!("Failed to list subscriptions of {topic}: {e}"))
    }

    pub async fn peek_messages(
        &self,
        request: &PeekRequest,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        let result = if request.uses_sessions() {
            peek_sessions(self.backend.as_ref(), request, &self.options, cancel).await
        } else {
            peek_standard(self.backend.as_ref(), request, &self.options, cancel).await
        };

        match &result {
            Ok(messages) => log::debug!(
                "Peeked {} of {} requested messages from {}",
                messages.len(),
                request.count,
                request.address
            ),
            Err(e) => log::error!("Failed to peek messages from {}: {e}", request.address),
        }
        result
    }

    /// Sends one message. Messages without a time-to-live get the default one.
    ///
    /// A send that does not finish within the operation timeout fails with a
    /// transport error; nothing is retried.
    pub async fn send_message(&self, entity: &str, message: OutgoingMessage) -> ServiceBusResult<()> {
        let producer = self.open_producer(entity).await?;
        let message = message.with_default_ttl(self.options.default_message_ttl());

        let never = CancellationToken::new();
        let result = receive_bounded(
            producer.send_message(message),
            self.options.operation_timeout(),
            &never,
            "send",
        )
        .await
        .map_err(|e| match e {
            ServiceBusError::TransientTimeout(msg) => ServiceBusError::transport("send", entity, msg),
            other => other,
        });

        if let Err(e) = producer.dispose().await {
            log::warn!("Failed to close sender for {entity}: {e}");
        }
        match &result {
            Ok(()) => log::info!("Sent message to {entity}"),
            Err(e) => log::error!("Failed to send message to {entity}: {e}"),
        }
        result
    }

    pub async fn purge_messages(
        &self,
        address: &EntityAddress,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize> {
        let context = self.bulk_context(address, cancel).await?;
        let result = MessagePurger::new(self.options.clone())
            .purge(&context)
            .await;
        Self::dispose_consumer(&context).await;
        result.inspect_err(|e| log::error!("Failed to purge {address}: {e}"))
    }

    pub async fn delete_messages_detailed(
        &self,
        address: &EntityAddress,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        let context = self.bulk_context(address, cancel).await?;
        let result = MessageDeleter::new(self.options.clone())
            .bulk_delete(&context, sequence_numbers)
            .await;
        Self::dispose_consumer(&context).await;
        result.inspect_err(|e| log::error!("Failed to delete messages from {address}: {e}"))
    }

    pub async fn resend_messages_detailed(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        let producer = self.open_producer(entity).await?;
        let result = MessageResender::new(self.options.clone())
            .resend(&producer, messages, cancel)
            .await;
        if let Err(e) = producer.dispose().await {
            log::warn!("Failed to close sender for {entity}: {e}");
        }
        Ok(result)
    }

    pub async fn resubmit_dead_letter_messages_detailed(
        &self,
        address: &EntityAddress,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        let dead_letter = address.main().with_dead_letter(true);
        let producer = self.open_producer(&address.entity).await?;
        let context = match self.bulk_context(&dead_letter, cancel).await {
            Ok(context) => context,
            Err(e) => {
                if let Err(dispose_error) = producer.dispose().await {
                    log::warn!(
                        "Failed to close sender for {}: {dispose_error}",
                        address.entity
                    );
                }
                return Err(e);
            }
        };

        let sequence_numbers: Vec<i64> = messages.iter().map(|m| m.sequence_number).collect();
        let result = DeadLetterResubmitter::new(self.options.clone())
            .resubmit(&context, &producer, &sequence_numbers)
            .await;

        Self::dispose_consumer(&context).await;
        if let Err(e) = producer.dispose().await {
            log::warn!("Failed to close sender for {}: {e}", address.entity);
        }
        result.inspect_err(|e| log::error!("Failed to resubmit messages from {dead_letter}: {e}"))
    }

    pub async fn open_consumer(&self, address: &EntityAddress) -> ServiceBusResult<Consumer> {
        let receiver = self.backend.create_receiver(address).await?;
        Ok(Consumer::new(receiver, address.clone()))
    }

    pub async fn open_producer(&self, entity: &str) -> ServiceBusResult<Producer> {
        let sender = self.backend.create_sender(entity).await?;
        Ok(Producer::new(sender, entity))
    }

    /// Reports the endpoint and the scoped entity, probing the directory
    /// (or the scoped entity) to make sure the connection works.
    pub async fn validate_connection(&self) -> ConnectionValidation {
        let endpoint = Some(self.backend.endpoint());
        let check = match &self.scoped_entity {
            Some(entity) => self.check_entity(entity).await,
            None => self.check_namespace().await,
        };

        match check {
            Ok(()) => ConnectionValidation {
                valid: true,
                resolved_entity: self.scoped_entity.clone(),
                endpoint,
                error: None,
            },
            Err(e) => {
                log::warn!("Connection validation failed: {e}");
                ConnectionValidation {
                    valid: false,
                    resolved_entity: self.scoped_entity.clone(),
                    endpoint,
                    error: Some(e.user_message()),
                }
            }
        }
    }

    /// Closes the backend connection.
    pub async fn shutdown(&self) -> ServiceBusResult<()> {
        self.backend.close().await
    }

    async fn check_entity(&self, entity: &str) -> ServiceBusResult<()> {
        let producer = self.open_producer(entity).await?;
        producer.dispose().await
    }

    async fn check_namespace(&self) -> ServiceBusResult<()> {
        let queues = self.directory.list_queues().await?;
        match queues.first() {
            Some(first) => log::debug!("Connection check found queue {}", first.name),
            None => log::debug!("Connection check found no queues"),
        }
        Ok(())
    }

    async fn bulk_context(
        &self,
        address: &EntityAddress,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationContext> {
        let consumer = self.open_consumer(address).await?;
        Ok(BulkOperationContext::new(consumer, cancel.child_token()))
    }

    async fn dispose_consumer(context: &BulkOperationContext) {
        if let Err(e) = context.consumer.dispose().await {
            log::warn!("Failed to close receiver for {}: {e}", context.entity);
        }
    }
}

#[async_trait]
impl OperationsSource for ServiceBusOperations {
    async fn operations(&self) -> ServiceBusResult<&ServiceBusOperations> {
        Ok(self)
    }

    fn endpoint_hint(&self) -> Option<String> {
        Some(self.backend.endpoint())
    }

    async fn close(&self) -> ServiceBusResult<()> {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::operations::MessageTransport;

    fn operations(broker: &InMemoryBroker) -> ServiceBusOperations {
        ServiceBusOperations::new(
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            OperationOptions::default(),
        )
    }

    #[tokio::test]
    async fn send_to_missing_entity_is_a_transport_error() {
        let broker = InMemoryBroker::new();
        let ops = operations(&broker);

        let err = ops
            .send_message("missing", OutgoingMessage::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceBusError::Transport { .. }));
    }

    #[tokio::test]
    async fn sent_messages_get_the_default_ttl() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        let ops = operations(&broker);

        ops.send_message("orders", OutgoingMessage::text("hi"))
            .await
            .unwrap();

        let stored = broker.messages(&EntityAddress::entity("orders"));
        assert_eq!(
            stored[0].time_to_live,
            Some(OperationOptions::default().default_message_ttl())
        );
    }

    #[tokio::test]
    async fn validation_reports_endpoint_and_scope() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders", false);
        let ops = operations(&broker).with_scoped_entity(Some("orders".into()));

        let validation = ops.validate_connection().await;
        assert!(validation.valid);
        assert_eq!(validation.resolved_entity.as_deref(), Some("orders"));
        assert_eq!(validation.endpoint, Some(broker.endpoint()));
    }

    #[tokio::test]
    async fn failing_listing_invalidates_connection() {
        let broker = InMemoryBroker::new();
        broker.fail_listings(true);
        let ops = operations(&broker);

        let validation = MessageTransport::validate_connection(&ops).await;
        assert!(!validation.valid);
        assert!(validation.error.is_some());
    }
}
