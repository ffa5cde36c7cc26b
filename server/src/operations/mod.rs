//! Connection-scoped Service Bus operations.
//!
//! [`MessageTransport`] is the operation surface every connection offers.
//! [`ServiceBusOperations`] implements it over a backend and an entity
//! directory; [`ConnectionStringOperations`] and [`AzureCredentialOperations`]
//! build one lazily on first use and delegate to it. [`ClientPool`] shares
//! those connections between callers.

use crate::bulk_operations::BulkOperationResult;
use crate::common::ServiceBusResult;
use crate::consumer::Consumer;
use crate::model::{EntityAddress, EntityDescriptor, MessageRecord, OutgoingMessage};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub mod azure_credential;
pub mod connection_string;
pub mod directory;
pub mod management;
pub mod options;
pub mod peek;
pub mod pool;
pub mod profile;
pub mod sas_directory;
pub mod shared;

pub use azure_credential::AzureCredentialOperations;
pub use connection_string::ConnectionStringOperations;
pub use directory::{EntityDirectory, ManagementDirectory, ScopedDirectory};
pub use management::{ManagementClient, NamespaceRef};
pub use options::OperationOptions;
pub use peek::PeekRequest;
pub use pool::{ClientPool, PooledClient};
pub use profile::{ConnectionProfile, ProfileKind};
pub use sas_directory::SasDirectory;
pub use shared::ServiceBusOperations;

/// Outcome of [`MessageTransport::validate_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionValidation {
    pub valid: bool,
    /// Entity the connection is scoped to, if any
    pub resolved_entity: Option<String>,
    pub endpoint: Option<String>,
    /// Short human-readable reason when `valid` is false
    pub error: Option<String>,
}

/// Operations every backing connection supports.
///
/// Listing, peeking and bulk operations report problems as errors or counts;
/// none of them retries on its own.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Empty namespaces list as an empty vector.
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>>;

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>>;

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>>;

    /// Up to `request.count` messages ordered by sequence number. Never blocks
    /// indefinitely; an exhausted entity yields fewer messages, not an error.
    async fn peek_messages(
        &self,
        request: &PeekRequest,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<Vec<MessageRecord>>;

    async fn send_message(&self, entity: &str, message: OutgoingMessage) -> ServiceBusResult<()>;

    /// Removes every message and returns how many were completed.
    async fn purge_messages(
        &self,
        address: &EntityAddress,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize>;

    async fn delete_messages_detailed(
        &self,
        address: &EntityAddress,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult>;

    async fn delete_messages(
        &self,
        address: &EntityAddress,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize> {
        Ok(self
            .delete_messages_detailed(address, sequence_numbers, cancel)
            .await?
            .successful)
    }

    async fn resend_messages_detailed(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult>;

    async fn resend_messages(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize> {
        Ok(self
            .resend_messages_detailed(entity, messages, cancel)
            .await?
            .successful)
    }

    /// Moves the given messages from the dead-letter sub-queue of `address`
    /// back to its entity. Subscription messages go back to the topic.
    async fn resubmit_dead_letter_messages_detailed(
        &self,
        address: &EntityAddress,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult>;

    async fn resubmit_dead_letter_messages(
        &self,
        address: &EntityAddress,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize> {
        Ok(self
            .resubmit_dead_letter_messages_detailed(address, messages, cancel)
            .await?
            .successful)
    }

    /// Opens a peek-lock consumer, used by the live stream in processor mode.
    async fn open_consumer(&self, address: &EntityAddress) -> ServiceBusResult<Consumer>;

    /// Never fails; problems are reported in the returned value.
    async fn validate_connection(&self) -> ConnectionValidation;
}

/// Anything that can hand out a ready [`ServiceBusOperations`], possibly
/// creating it on first use. Every source is a [`MessageTransport`].
#[async_trait]
pub trait OperationsSource: Send + Sync {
    async fn operations(&self) -> ServiceBusResult<&ServiceBusOperations>;

    /// Endpoint known without connecting.
    fn endpoint_hint(&self) -> Option<String> {
        None
    }

    /// Closes the connection if it was ever opened.
    async fn close(&self) -> ServiceBusResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: OperationsSource + ?Sized> MessageTransport for T {
    async fn list_queues(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.operations().await?.list_queues().await
    }

    async fn list_topics(&self) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.operations().await?.list_topics().await
    }

    async fn list_subscriptions(&self, topic: &str) -> ServiceBusResult<Vec<EntityDescriptor>> {
        self.operations().await?.list_subscriptions(topic).await
    }

    async fn peek_messages(
        &self,
        request: &PeekRequest,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<Vec<MessageRecord>> {
        self.operations()
            .await?
            .peek_messages(request, cancel)
            .await
    }

    async fn send_message(&self, entity: &str, message: OutgoingMessage) -> ServiceBusResult<()> {
        self.operations().await?.send_message(entity, message).await
    }

    async fn purge_messages(
        &self,
        address: &EntityAddress,
        cancel: &CancellationToken,
    ) -> ServiceBusResult<usize> {
        self.operations()
            .await?
            .purge_messages(address, cancel)
            .await
    }

    async fn delete_messages_detailed(
        &self,
        address: &EntityAddress,
        sequence_numbers: &[i64],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        self.operations()
            .await?
            .delete_messages_detailed(address, sequence_numbers, cancel)
            .await
    }

    async fn resend_messages_detailed(
        &self,
        entity: &str,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        self.operations()
            .await?
            .resend_messages_detailed(entity, messages, cancel)
            .await
    }

    async fn resubmit_dead_letter_messages_detailed(
        &self,
        address: &EntityAddress,
        messages: &[MessageRecord],
        cancel: &CancellationToken,
    ) -> ServiceBusResult<BulkOperationResult> {
        self.operations()
            .await?
            .resubmit_dead_letter_messages_detailed(address, messages, cancel)
            .await
    }

    async fn open_consumer(&self, address: &EntityAddress) -> ServiceBusResult<Consumer> {
        self.operations().await?.open_consumer(address).await
    }

    async fn validate_connection(&self) -> ConnectionValidation {
        match self.operations().await {
            Ok(operations) => operations.validate_connection().await,
            Err(e) => {
                log::error!("Connection could not be established: {e}");
                ConnectionValidation {
                    valid: false,
                    resolved_entity: None,
                    endpoint: self.endpoint_hint(),
                    error: Some(e.user_message()),
                }
            }
        }
    }
}
