use super::collector::MessageCollector;
use super::types::{BulkOperationContext, BulkOperationResult};
use crate::common::ServiceBusResult;
use crate::operations::OperationOptions;
use std::collections::HashSet;

/// Handles bulk message deletion by sequence number.
pub struct MessageDeleter {
    options: OperationOptions,
}

impl MessageDeleter {
    pub fn new(options: OperationOptions) -> Self {
        Self { options }
    }

    /// Receives in peek-lock mode, completes the targets and abandons the rest.
    ///
    /// Duplicate sequence numbers count once. Targets whose completion fails
    /// are recorded as failures and left in the entity.
    pub async fn bulk_delete(
        &self,
        context: &BulkOperationContext,
        sequence_numbers: &[i64],
    ) -> ServiceBusResult<BulkOperationResult> {
        let targets: HashSet<i64> = sequence_numbers.iter().copied().collect();
        let mut result = BulkOperationResult::new(targets.len());

        log::info!(
            "Starting bulk delete operation for {} messages on {}",
            targets.len(),
            context.entity
        );
        if targets.is_empty() {
            log::warn!("No messages provided for bulk delete operation");
            return Ok(result);
        }

        let mut collector = MessageCollector::new(
            context,
            targets,
            self.options.delete_batch_size(),
            self.options.delete_receive_timeout(),
            self.options.max_consecutive_empty_batches(),
        );
        let outcome = Self::delete_targets(context, &mut collector, &mut result).await;
        result.not_found = collector.finish().await;
        outcome?;

        log::info!(
            "Bulk delete completed on {}: {} successful, {} failed, {} not found",
            context.entity,
            result.successful,
            result.failed,
            result.not_found
        );
        Ok(result)
    }

    async fn delete_targets(
        context: &BulkOperationContext,
        collector: &mut MessageCollector<'_>,
        result: &mut BulkOperationResult,
    ) -> ServiceBusResult<()> {
        while let Some(targets) = collector.next_targets().await? {
            let completed = context.consumer.complete_messages(&targets).await?;
            for message in targets {
                if completed.contains(&message.sequence_number) {
                    result.add_successful_sequence(message.sequence_number);
                } else {
                    result.add_failure(format!(
                        "Failed to delete message {} (sequence: {})",
                        message.message_id_or_unknown(),
                        message.sequence_number
                    ));
                    collector.release(message);
                }
            }
        }
        Ok(())
    }
}
