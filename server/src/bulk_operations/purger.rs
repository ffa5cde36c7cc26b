use super::types::BulkOperationContext;
use crate::common::ServiceBusResult;
use crate::model::MessageRecord;
use crate::operations::OperationOptions;

/// Drains an entity by receiving and completing fixed-size batches.
pub struct MessagePurger {
    options: OperationOptions,
}

impl MessagePurger {
    pub fn new(options: OperationOptions) -> Self {
        Self { options }
    }

    /// Completes everything until the first empty batch and returns how many
    /// messages were removed.
    ///
    /// Batches in which nothing could be completed count towards
    /// `max_consecutive_empty_batches`, so a purge never spins on messages
    /// whose completion keeps failing.
    pub async fn purge(&self, context: &BulkOperationContext) -> ServiceBusResult<usize> {
        log::info!("Starting purge of {}", context.entity);

        let batch_size = self.options.purge_batch_size();
        let receive_timeout = self.options.purge_receive_timeout();
        let max_stalled = self.options.max_consecutive_empty_batches();

        let mut purged = 0;
        let mut stalled = 0;
        let mut unsettled: Vec<MessageRecord> = Vec::new();

        let outcome = loop {
            if context.is_cancelled() {
                log::info!("Purge of {} cancelled after {purged} messages", context.entity);
                break Ok(());
            }

            let batch = match context
                .consumer
                .receive_messages_with_timeout(batch_size, receive_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_transient_timeout() => Vec::new(),
                Err(e) => break Err(e),
            };
            if batch.is_empty() {
                log::debug!("Empty batch on {}, purge finished", context.entity);
                break Ok(());
            }

            let completed = match context.consumer.complete_messages(&batch).await {
                Ok(completed) => completed,
                Err(e) => break Err(e),
            };
            purged += completed.len();
            log::debug!(
                "Purged {} of {} messages in batch on {} (total {purged})",
                completed.len(),
                batch.len(),
                context.entity
            );

            if completed.is_empty() {
                stalled += 1;
                if stalled >= max_stalled {
                    log::warn!(
                        "Nothing could be completed on {} in {stalled} batches, stopping purge",
                        context.entity
                    );
                    break Ok(());
                }
            } else {
                stalled = 0;
            }
            unsettled.extend(
                batch
                    .into_iter()
                    .filter(|m| !completed.contains(&m.sequence_number)),
            );
        };

        if !unsettled.is_empty() {
            if let Err(e) = context.consumer.abandon_messages(&unsettled).await {
                log::warn!(
                    "Could not release {} unsettled messages on {}: {}",
                    unsettled.len(),
                    context.entity,
                    e
                );
            }
        }
        outcome?;

        log::info!("Purge of {} completed: {purged} messages removed", context.entity);
        Ok(purged)
    }
}
