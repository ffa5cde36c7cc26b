use crate::common::{ServiceBusError, ServiceBusResult};
use serde::Deserialize;
use std::time::Duration;

/// Tuning for peek, purge, delete and resend operations.
///
/// Every field is optional; accessors apply the process-wide defaults. A
/// single value is usually built from configuration and passed to an
/// operation mode, and call sites override individual values with the
/// `with_*` methods.
///
/// # Examples
///
/// ```no_run
/// use server::operations::OperationOptions;
/// use std::time::Duration;
///
/// let options = OperationOptions::default()
///     .with_delete_batch_size(50)
///     .with_delete_receive_timeout(Duration::from_secs(2));
///
/// assert_eq!(options.delete_batch_size(), 50);
/// assert_eq!(options.purge_batch_size(), 100);
/// ```
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct OperationOptions {
    /// Upper bound on sessions accepted during one session peek (default: 10)
    max_sessions_to_check: Option<u32>,
    /// Messages received per purge batch (default: 100)
    purge_batch_size: Option<u32>,
    /// Receive window per purge batch in milliseconds (default: 5000)
    purge_receive_timeout_ms: Option<u64>,
    /// Messages received per delete batch (default: 100)
    delete_batch_size: Option<u32>,
    /// Receive window per delete batch in milliseconds (default: 5000)
    delete_receive_timeout_ms: Option<u64>,
    /// Empty batches in a row before a delete scan gives up (default: 3)
    max_consecutive_empty_batches: Option<u32>,
    /// Messages per resend batch (default: 100)
    resend_batch_size: Option<u32>,
    /// TTL applied to sent messages that do not carry one, in seconds (default: 14 days)
    default_message_ttl_secs: Option<u64>,
    /// How long to wait for the next session when peeking sessions, in milliseconds (default: 5000)
    session_accept_timeout_ms: Option<u64>,
    /// Upper bound for a single peek or send call in milliseconds (default: 30000)
    operation_timeout_ms: Option<u64>,
}

macro_rules! with_field {
    ($name:ident, $field:ident, u32) => {
        pub fn $name(mut self, value: u32) -> Self {
            self.$field = Some(value);
            self
        }
    };
    ($name:ident, $field:ident, millis) => {
        pub fn $name(mut self, value: Duration) -> Self {
            self.$field = Some(value.as_millis() as u64);
            self
        }
    };
    ($name:ident, $field:ident, secs) => {
        pub fn $name(mut self, value: Duration) -> Self {
            self.$field = Some(value.as_secs());
            self
        }
    };
}

impl OperationOptions {
    pub fn max_sessions_to_check(&self) -> u32 {
        self.max_sessions_to_check.unwrap_or(10)
    }

    pub fn purge_batch_size(&self) -> u32 {
        self.purge_batch_size.unwrap_or(100)
    }

    pub fn purge_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.purge_receive_timeout_ms.unwrap_or(5_000))
    }

    pub fn delete_batch_size(&self) -> u32 {
        self.delete_batch_size.unwrap_or(100)
    }

    pub fn delete_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_receive_timeout_ms.unwrap_or(5_000))
    }

    pub fn max_consecutive_empty_batches(&self) -> u32 {
        self.max_consecutive_empty_batches.unwrap_or(3)
    }

    pub fn resend_batch_size(&self) -> u32 {
        self.resend_batch_size.unwrap_or(100)
    }

    pub fn default_message_ttl(&self) -> Duration {
        Duration::from_secs(self.default_message_ttl_secs.unwrap_or(14 * 24 * 60 * 60))
    }

    pub fn session_accept_timeout(&self) -> Duration {
        Duration::from_millis(self.session_accept_timeout_ms.unwrap_or(5_000))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.unwrap_or(30_000))
    }

    with_field!(with_max_sessions_to_check, max_sessions_to_check, u32);
    with_field!(with_purge_batch_size, purge_batch_size, u32);
    with_field!(with_purge_receive_timeout, purge_receive_timeout_ms, millis);
    with_field!(with_delete_batch_size, delete_batch_size, u32);
    with_field!(with_delete_receive_timeout, delete_receive_timeout_ms, millis);
    with_field!(with_max_consecutive_empty_batches, max_consecutive_empty_batches, u32);
    with_field!(with_resend_batch_size, resend_batch_size, u32);
    with_field!(with_default_message_ttl, default_message_ttl_secs, secs);
    with_field!(with_session_accept_timeout, session_accept_timeout_ms, millis);
    with_field!(with_operation_timeout, operation_timeout_ms, millis);

    /// Rejects values that would make an operation loop forever or do nothing.
    pub fn validate(&self) -> ServiceBusResult<()> {
        let sizes = [
            ("purge_batch_size", self.purge_batch_size()),
            ("delete_batch_size", self.delete_batch_size()),
            ("resend_batch_size", self.resend_batch_size()),
            ("max_consecutive_empty_batches", self.max_consecutive_empty_batches()),
            ("max_sessions_to_check", self.max_sessions_to_check()),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ServiceBusError::ConfigurationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        let windows = [
            ("purge_receive_timeout_ms", self.purge_receive_timeout()),
            ("delete_receive_timeout_ms", self.delete_receive_timeout()),
            ("session_accept_timeout_ms", self.session_accept_timeout()),
            ("operation_timeout_ms", self.operation_timeout()),
        ];
        for (name, value) in windows {
            if value.is_zero() {
                return Err(ServiceBusError::ConfigurationError(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}
