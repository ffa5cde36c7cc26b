use super::types::BulkOperationResult;
use crate::model::{MessageRecord, OutgoingMessage};
use crate::operations::OperationOptions;
use crate::producer::Producer;
use tokio_util::sync::CancellationToken;

/// Re-sends copies of existing messages in batches.
pub struct MessageResender {
    options: OperationOptions,
}

impl MessageResender {
    pub fn new(options: OperationOptions) -> Self {
        Self { options }
    }

    /// Sends each message as a copy, batch by batch.
    ///
    /// When a batch is rejected every message of that batch is retried on its
    /// own, so one bad message only costs itself. Failures never abort the
    /// operation; the result tells how many copies were accepted.
    pub async fn resend(
        &self,
        producer: &Producer,
        messages: &[MessageRecord],
        cancel_token: &CancellationToken,
    ) -> BulkOperationResult {
        let mut result = BulkOperationResult::new(messages.len());
        let batch_size = self.options.resend_batch_size().max(1) as usize;

        log::info!(
            "Resending {} messages to {} in batches of {}",
            messages.len(),
            producer.entity(),
            batch_size
        );

        for chunk in messages.chunks(batch_size) {
            if cancel_token.is_cancelled() {
                log::info!(
                    "Resend to {} cancelled after {} messages",
                    producer.entity(),
                    result.successful
                );
                break;
            }

            let batch: Vec<OutgoingMessage> = chunk.iter().map(OutgoingMessage::from).collect();
            match producer.send_messages(batch).await {
                Ok(()) => {
                    for message in chunk {
                        result.add_successful_sequence(message.sequence_number);
                    }
                    log::debug!("Sent batch of {} to {}", chunk.len(), producer.entity());
                }
                Err(e) => {
                    log::warn!(
                        "Batch of {} to {} failed, falling back to individual sends: {}",
                        chunk.len(),
                        producer.entity(),
                        e
                    );
                    self.send_individually(producer, chunk, &mut result).await;
                }
            }
        }

        log::info!(
            "Resend to {} completed: {} successful, {} failed",
            producer.entity(),
            result.successful,
            result.failed
        );
        result
    }

    async fn send_individually(
        &self,
        producer: &Producer,
        chunk: &[MessageRecord],
        result: &mut BulkOperationResult,
    ) {
        for message in chunk {
            match producer.send_message(OutgoingMessage::from(message)).await {
                Ok(()) => result.add_successful_sequence(message.sequence_number),
                Err(e) => {
                    log::warn!(
                        "Failed to resend message {} (sequence: {}) to {}: {}",
                        message.message_id_or_unknown(),
                        message.sequence_number,
                        producer.entity(),
                        e
                    );
                    result.add_failure(format!(
                        "message {} (sequence: {}): {}",
                        message.message_id_or_unknown(),
                        message.sequence_number,
                        e
                    ));
                }
            }
        }
    }
}
