use super::types::BulkOperationContext;
use crate::common::ServiceBusResult;
use crate::model::MessageRecord;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Scans an entity in peek-lock mode looking for messages by sequence number.
///
/// Non-target messages stay locked while the scan runs, so later receives
/// move further into the entity instead of returning the same messages
/// again. [`MessageCollector::finish`] abandons everything still held and
/// must be called on every path, including errors.
pub struct MessageCollector<'a> {
    context: &'a BulkOperationContext,
    remaining: HashSet<i64>,
    seen: HashSet<i64>,
    held: BTreeMap<i64, MessageRecord>,
    batch_size: u32,
    receive_timeout: Duration,
    max_consecutive_empty: u32,
    consecutive_empty: u32,
}

impl<'a> MessageCollector<'a> {
    pub fn new(
        context: &'a BulkOperationContext,
        targets: HashSet<i64>,
        batch_size: u32,
        receive_timeout: Duration,
        max_consecutive_empty: u32,
    ) -> Self {
        log::info!(
            "Starting message collection on {}: {} targets, batch size: {}",
            context.entity,
            targets.len(),
            batch_size
        );
        Self {
            context,
            remaining: targets,
            seen: HashSet::new(),
            held: BTreeMap::new(),
            batch_size,
            receive_timeout,
            max_consecutive_empty,
            consecutive_empty: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    /// Receives batches until one contains target messages and returns those.
    ///
    /// Returns `Ok(None)` once every target was found, the operation was
    /// cancelled, or too many batches in a row brought nothing new. Receive
    /// timeouts count as empty batches; other receive errors propagate.
    pub async fn next_targets(&mut self) -> ServiceBusResult<Option<Vec<MessageRecord>>> {
        loop {
            if self.remaining.is_empty() {
                return Ok(None);
            }
            if self.context.is_cancelled() {
                log::info!("Message collection on {} cancelled", self.context.entity);
                return Ok(None);
            }
            if self.consecutive_empty >= self.max_consecutive_empty {
                log::debug!(
                    "{} empty batches in a row on {}, stopping scan",
                    self.consecutive_empty,
                    self.context.entity
                );
                return Ok(None);
            }

            let batch = match self
                .context
                .consumer
                .receive_messages_with_timeout(self.batch_size, self.receive_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_transient_timeout() => Vec::new(),
                Err(e) => return Err(e),
            };

            let mut targets = Vec::new();
            let mut fresh = 0;
            for message in batch {
                let sequence = message.sequence_number;
                if self.seen.insert(sequence) {
                    fresh += 1;
                }
                if self.remaining.remove(&sequence) {
                    targets.push(message);
                } else {
                    self.held.insert(sequence, message);
                }
            }

            if fresh == 0 {
                self.consecutive_empty += 1;
                continue;
            }
            self.consecutive_empty = 0;

            if !targets.is_empty() {
                log::debug!(
                    "Found {} targets on {} ({} still missing)",
                    targets.len(),
                    self.context.entity,
                    self.remaining.len()
                );
                return Ok(Some(targets));
            }
        }
    }

    /// Hands a received target back so its lock is released when the scan ends.
    pub fn release(&mut self, message: MessageRecord) {
        self.held.insert(message.sequence_number, message);
    }

    /// Abandons every held message and returns how many targets were never found.
    pub async fn finish(self) -> usize {
        if !self.held.is_empty() {
            let held: Vec<MessageRecord> = self.held.into_values().collect();
            match self.context.consumer.abandon_messages(&held).await {
                Ok(released) => log::debug!(
                    "Released {released} of {} held messages on {}",
                    held.len(),
                    self.context.entity
                ),
                Err(e) => log::warn!(
                    "Could not release {} held messages on {}: {}",
                    held.len(),
                    self.context.entity,
                    e
                ),
            }
        }

        log::info!(
            "Collection complete on {}. Scanned: {}, remaining targets: {}",
            self.context.entity,
            self.seen.len(),
            self.remaining.len()
        );
        if !self.remaining.is_empty() {
            log::warn!(
                "Could not find {} target messages on {} after scanning {} messages",
                self.remaining.len(),
                self.context.entity,
                self.seen.len()
            );
        }
        self.remaining.len()
    }
}
