//! Types shared by the bulk delete, purge, resend and resubmit operations.

use crate::common::ServiceBusError;
use crate::consumer::Consumer;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Result of a bulk operation with detailed statistics and error tracking.
///
/// # Examples
///
/// ```no_run
/// use server::bulk_operations::BulkOperationResult;
///
/// let mut result = BulkOperationResult::new(100);
/// result.add_successful_sequence(42);
/// result.add_failure("Connection timeout".to_string());
///
/// if result.is_complete_success() {
///     println!("All operations completed successfully");
/// } else {
///     println!("Partial success: {} of {} succeeded",
///              result.successful, result.total_requested);
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOperationResult {
    /// Total number of operations requested
    pub total_requested: usize,
    /// Number of operations that completed successfully
    pub successful: usize,
    /// Number of operations that failed
    pub failed: usize,
    /// Number of target items that were not found
    pub not_found: usize,
    /// Detailed error messages for failed operations
    pub error_details: Vec<String>,
    /// Sequence numbers of messages that were processed successfully
    pub successful_sequences: Vec<i64>,
}

impl BulkOperationResult {
    pub fn new(total_requested: usize) -> Self {
        Self {
            total_requested,
            ..Default::default()
        }
    }

    pub fn add_successful_sequence(&mut self, sequence: i64) {
        self.successful += 1;
        self.successful_sequences.push(sequence);
    }

    pub fn add_failure(&mut self, error: String) {
        self.failed += 1;
        self.error_details.push(error);
    }

    /// Checks if all requested operations completed successfully.
    pub fn is_complete_success(&self) -> bool {
        self.successful == self.total_requested && self.failed == 0 && self.not_found == 0
    }

    /// Describes a mixed outcome as [`ServiceBusError::PartialFailure`], or
    /// `None` when nothing failed.
    pub fn partial_failure(&self) -> Option<ServiceBusError> {
        (self.failed > 0).then(|| ServiceBusError::PartialFailure {
            successful: self.successful,
            failed: self.failed,
        })
    }
}

/// Shared resources for one bulk operation against a single entity.
#[derive(Debug, Clone)]
pub struct BulkOperationContext {
    pub consumer: Consumer,
    pub cancel_token: CancellationToken,
    /// Path of the entity this operation is targeting, for logging
    pub entity: String,
}

impl BulkOperationContext {
    pub fn new(consumer: Consumer, cancel_token: CancellationToken) -> Self {
        let entity = consumer.address().path();
        Self {
            consumer,
            cancel_token,
            entity,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_only_when_something_failed() {
        let mut result = BulkOperationResult::new(2);
        result.add_successful_sequence(1);
        assert!(result.partial_failure().is_none());

        result.add_failure("rejected".into());
        assert!(matches!(
            result.partial_failure(),
            Some(ServiceBusError::PartialFailure {
                successful: 1,
                failed: 1
            })
        ));
        assert!(!result.is_complete_success());
    }
}
