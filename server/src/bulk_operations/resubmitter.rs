use super::collector::MessageCollector;
use super::types::{BulkOperationContext, BulkOperationResult};
use crate::common::ServiceBusResult;
use crate::model::{MessageRecord, OutgoingMessage};
use crate::operations::OperationOptions;
use crate::producer::Producer;
use std::collections::HashSet;

/// Moves dead-lettered messages back to their main entity.
pub struct DeadLetterResubmitter {
    options: OperationOptions,
}

impl DeadLetterResubmitter {
    pub fn new(options: OperationOptions) -> Self {
        Self { options }
    }

    /// For every target found in the dead-letter sub-queue behind `context`:
    /// send a copy with its properties to `producer`, then complete the
    /// dead-letter copy. A message whose send fails stays dead-lettered.
    pub async fn resubmit(
        &self,
        context: &BulkOperationContext,
        producer: &Producer,
        sequence_numbers: &[i64],
    ) -> ServiceBusResult<BulkOperationResult> {
        let targets: HashSet<i64> = sequence_numbers.iter().copied().collect();
        let mut result = BulkOperationResult::new(targets.len());
        if targets.is_empty() {
            return Ok(result);
        }

        log::info!(
            "Resubmitting {} messages from {} to {}",
            targets.len(),
            context.entity,
            producer.entity()
        );

        let mut collector = MessageCollector::new(
            context,
            targets,
            self.options.delete_batch_size(),
            self.options.delete_receive_timeout(),
            self.options.max_consecutive_empty_batches(),
        );
        let outcome = Self::resubmit_targets(context, producer, &mut collector, &mut result).await;
        result.not_found = collector.finish().await;
        outcome?;

        log::info!(
            "Resubmit to {} completed: {} successful, {} failed, {} not found",
            producer.entity(),
            result.successful,
            result.failed,
            result.not_found
        );
        Ok(result)
    }

    async fn resubmit_targets(
        context: &BulkOperationContext,
        producer: &Producer,
        collector: &mut MessageCollector<'_>,
        result: &mut BulkOperationResult,
    ) -> ServiceBusResult<()> {
        while let Some(targets) = collector.next_targets().await? {
            for message in targets {
                match Self::resubmit_one(context, producer, &message).await {
                    Ok(()) => result.add_successful_sequence(message.sequence_number),
                    Err(detail) => {
                        log::warn!("{detail}");
                        result.add_failure(detail);
                        collector.release(message);
                    }
                }
            }
        }
        Ok(())
    }

    async fn resubmit_one(
        context: &BulkOperationContext,
        producer: &Producer,
        message: &MessageRecord,
    ) -> Result<(), String> {
        producer
            .send_message(OutgoingMessage::from(message))
            .await
            .map_err(|e| {
                format!(
                    "Failed to resubmit message {} (sequence: {}): {}",
                    message.message_id_or_unknown(),
                    message.sequence_number,
                    e
                )
            })?;

        context
            .consumer
            .complete_message(message.sequence_number)
            .await
            .map_err(|e| {
                format!(
                    "Resubmitted message {} (sequence: {}) but could not remove the dead-letter copy: {}",
                    message.message_id_or_unknown(),
                    message.sequence_number,
                    e
                )
            })
    }
}
