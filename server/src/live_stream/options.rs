use crate::common::{ServiceBusError, ServiceBusResult};
use serde::Deserialize;
use std::time::Duration;

/// Tuning for the live stream engine and its batching buffer.
///
/// Like [`OperationOptions`](crate::operations::OperationOptions), every
/// field is optional and the accessors apply defaults.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct LiveStreamOptions {
    /// Pause between peek polls in milliseconds (default: 1000)
    poll_interval_ms: Option<u64>,
    /// Window for one poll or processor receive in milliseconds (default: 30000)
    receive_timeout_ms: Option<u64>,
    /// Pause after a failed poll in milliseconds (default: 5000)
    error_backoff_ms: Option<u64>,
    /// How long stopping waits for the stream task in milliseconds (default: 5000)
    stop_timeout_ms: Option<u64>,
    /// Messages per poll or receive (default: 100)
    batch_size: Option<u32>,
    /// Events kept in the visible buffer (default: 500)
    buffer_capacity: Option<usize>,
    /// Delay between buffer flushes in milliseconds (default: 100)
    flush_interval_ms: Option<u64>,
}

impl LiveStreamOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(1_000))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.unwrap_or(30_000))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms.unwrap_or(5_000))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms.unwrap_or(5_000))
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(100)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or(500)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.unwrap_or(100))
    }

    pub fn with_poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn with_receive_timeout(mut self, value: Duration) -> Self {
        self.receive_timeout_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn with_error_backoff(mut self, value: Duration) -> Self {
        self.error_backoff_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn with_stop_timeout(mut self, value: Duration) -> Self {
        self.stop_timeout_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn with_batch_size(mut self, value: u32) -> Self {
        self.batch_size = Some(value);
        self
    }

    pub fn with_buffer_capacity(mut self, value: usize) -> Self {
        self.buffer_capacity = Some(value);
        self
    }

    pub fn with_flush_interval(mut self, value: Duration) -> Self {
        self.flush_interval_ms = Some(value.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> ServiceBusResult<()> {
        if self.batch_size() == 0 {
            return Err(ServiceBusError::ConfigurationError(
                "live stream batch_size must be greater than zero".to_string(),
            ));
        }
        if self.buffer_capacity() == 0 {
            return Err(ServiceBusError::ConfigurationError(
                "live stream buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval().is_zero() || self.receive_timeout().is_zero() {
            return Err(ServiceBusError::ConfigurationError(
                "live stream intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = LiveStreamOptions::default();
        assert_eq!(options.poll_interval(), Duration::from_secs(1));
        assert_eq!(options.receive_timeout(), Duration::from_secs(30));
        assert_eq!(options.error_backoff(), Duration::from_secs(5));
        assert_eq!(options.stop_timeout(), Duration::from_secs(5));
        assert_eq!(options.buffer_capacity(), 500);
        assert_eq!(options.flush_interval(), Duration::from_millis(100));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let options = LiveStreamOptions::default().with_buffer_capacity(0);
        assert!(options.validate().is_err());
    }
}
