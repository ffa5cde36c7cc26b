//! Backend seam between the operations layer and a concrete message broker.
//!
//! The operations layer and the live stream engine only talk to these traits.
//! Two implementations ship with the crate:
//!
//! - [`azure::AzureBroker`] - Azure Service Bus over AMQP via `azservicebus`
//! - `memory::InMemoryBroker` - an in-process broker with sessions, dead-letter
//!   sub-queues, lock tracking and fault injection, built with the `test-utils`
//!   feature
//!
//! Received messages are identified by sequence number. A receiver keeps the
//! broker-side lock handles of the messages it holds and settles them by
//! sequence number, so callers never need to carry SDK message objects around.

use crate::common::ServiceBusResult;
use crate::model::{EntityAddress, MessageRecord, OutgoingMessage};
use async_trait::async_trait;
use std::time::Duration;

pub mod azure;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use azure::AzureBroker;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryBroker;

/// Factory for receivers and senders bound to one namespace connection.
#[async_trait]
pub trait ServiceBusBackend: Send + Sync {
    /// Opens a peek-lock receiver for the address (main or dead-letter sub-queue).
    async fn create_receiver(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn MessageReceiver>>;

    /// Accepts the next session that has messages available.
    ///
    /// Fails with [`ServiceBusError::TransientTimeout`] when no session becomes
    /// available; other failures are transport errors.
    ///
    /// [`ServiceBusError::TransientTimeout`]: crate::common::ServiceBusError::TransientTimeout
    async fn accept_next_session(
        &self,
        address: &EntityAddress,
    ) -> ServiceBusResult<Box<dyn SessionReceiver>>;

    /// Opens a sender for a queue or topic.
    async fn create_sender(&self, entity: &str) -> ServiceBusResult<Box<dyn MessageSender>>;

    /// Namespace endpoint this backend is connected to.
    fn endpoint(&self) -> String;

    /// Closes the underlying connection. Receivers and senders must be closed first.
    async fn close(&self) -> ServiceBusResult<()>;
}

/// Receiver over a single entity path.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Non-destructive read of up to `max_count` messages starting at `from_sequence`.
    async fn peek(
        &mut self,
        max_count: u32,
        from_sequence: Option<i64>,
    ) -> ServiceBusResult<Vec<MessageRecord>>;

    /// Receives and locks up to `max_count` messages, waiting at most `max_wait`.
    ///
    /// Returns an empty batch when nothing arrived inside the window.
    async fn receive(
        &mut self,
        max_count: u32,
        max_wait: Duration,
    ) -> ServiceBusResult<Vec<MessageRecord>>;

    /// Settles a held message by deleting it.
    async fn complete(&mut self, sequence_number: i64) -> ServiceBusResult<()>;

    /// Releases the lock on a held message without deleting it.
    async fn abandon(&mut self, sequence_number: i64) -> ServiceBusResult<()>;

    /// Releases every held lock and closes the link.
    async fn close(&mut self) -> ServiceBusResult<()>;
}

/// Receiver bound to one accepted session; closing it releases the session lock.
#[async_trait]
pub trait SessionReceiver: MessageReceiver {
    fn session_id(&self) -> &str;
}

/// Sender bound to one queue or topic.
#[async_trait]
pub trait MessageSender: Send {
    /// Sends all messages as one batch; either all are accepted or the call fails.
    async fn send(&mut self, messages: Vec<OutgoingMessage>) -> ServiceBusResult<()>;

    async fn close(&mut self) -> ServiceBusResult<()>;
}
