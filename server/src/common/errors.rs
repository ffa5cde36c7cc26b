use thiserror::Error;

/// Errors produced by the operations layer, the backends and the live stream engine.
///
/// The variants follow a small taxonomy that callers rely on to pick a reaction:
///
/// - [`EntityNotFound`] - the target entity does not exist; surface it, never retry.
/// - [`TransientTimeout`] - a receive or session accept found nothing inside its
///   window. Most call sites treat it as an empty result.
/// - [`Transport`] - auth, network or malformed path failures coming out of the
///   backend. The stream engine retries these with backoff; one-shot operations
///   fail the call.
/// - [`PartialFailure`] - some items of a bulk operation failed while others
///   succeeded.
///
/// The remaining variants cover configuration, authentication, disposal and
/// cancellation.
///
/// # Examples
///
/// ```no_run
/// use server::common::ServiceBusError;
///
/// fn describe(error: &ServiceBusError) -> String {
///     if error.is_transient_timeout() {
///         return "Nothing to do".to_string();
///     }
///     error.user_message()
/// }
/// ```
///
/// [`EntityNotFound`]: ServiceBusError::EntityNotFound
/// [`TransientTimeout`]: ServiceBusError::TransientTimeout
/// [`Transport`]: ServiceBusError::Transport
/// [`PartialFailure`]: ServiceBusError::PartialFailure
#[derive(Debug, Clone, Error)]
pub enum ServiceBusError {
    /// The queue, topic or subscription does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Nothing became available within the receive or accept window.
    #[error("No data available within the timeout window: {0}")]
    TransientTimeout(String),

    /// Failure reported by the backend while talking to the broker.
    #[error("Transport error during {operation} on '{entity}': {message}")]
    Transport {
        operation: String,
        entity: String,
        message: String,
    },

    /// A bulk operation completed for some items only.
    #[error("Bulk operation partially failed: {successful} successful, {failed} failed")]
    PartialFailure { successful: usize, failed: usize },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid entity path: {0}")]
    InvalidEntityPath(String),

    /// A bounded operation (not a receive window) ran out of time.
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The receiver or sender was already disposed.
    #[error("{0} already disposed")]
    Disposed(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceBusError {
    /// Builds a [`ServiceBusError::Transport`] carrying the operation and entity context.
    pub fn transport(
        operation: impl Into<String>,
        entity: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Transport {
            operation: operation.into(),
            entity: entity.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceBusError::EntityNotFound(_))
    }

    pub fn is_transient_timeout(&self) -> bool {
        matches!(self, ServiceBusError::TransientTimeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ServiceBusError::Cancelled(_))
    }

    /// Whether a background loop may retry after this error.
    ///
    /// Missing entities and bad configuration stay broken; expired or revoked
    /// credentials can be renewed while the loop backs off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceBusError::Transport { .. }
                | ServiceBusError::TransientTimeout(_)
                | ServiceBusError::ConnectionFailed(_)
                | ServiceBusError::AuthenticationFailed(_)
                | ServiceBusError::OperationTimeout(_)
                | ServiceBusError::InternalError(_)
        )
    }

    /// Short, human-readable description suitable for a status line.
    pub fn user_message(&self) -> String {
        match self {
            ServiceBusError::EntityNotFound(name) => format!("'{name}' does not exist"),
            ServiceBusError::TransientTimeout(_) => "No messages available".to_string(),
            ServiceBusError::Transport {
                operation, entity, ..
            } => format!("Could not {operation} on '{entity}'"),
            ServiceBusError::PartialFailure { successful, failed } => {
                format!("{successful} succeeded, {failed} failed")
            }
            ServiceBusError::ConnectionFailed(_) => "Connection failed".to_string(),
            ServiceBusError::AuthenticationFailed(_) => "Authentication failed".to_string(),
            ServiceBusError::ConfigurationError(msg) => format!("Configuration problem: {msg}"),
            ServiceBusError::InvalidEntityPath(path) => format!("Invalid entity path '{path}'"),
            ServiceBusError::OperationTimeout(_) => "The operation timed out".to_string(),
            ServiceBusError::Cancelled(_) => "Cancelled".to_string(),
            ServiceBusError::Disposed(what) => format!("{what} is closed"),
            ServiceBusError::InternalError(_) => "Unexpected error".to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ServiceBusError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ServiceBusError::OperationTimeout(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceBusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceBusError::OperationTimeout(err.to_string())
        } else {
            ServiceBusError::ConnectionFailed(err.to_string())
        }
    }
}

// Result type alias for convenience
pub type ServiceBusResult<T> = Result<T, ServiceBusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_keeps_context() {
        let err = ServiceBusError::transport("peek", "orders", "link detached");
        assert_eq!(
            err.to_string(),
            "Transport error during peek on 'orders': link detached"
        );
        assert_eq!(err.user_message(), "Could not peek on 'orders'");
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = ServiceBusError::EntityNotFound("orders".to_string());
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn authentication_failures_are_retryable() {
        let err = ServiceBusError::AuthenticationFailed("token expired".to_string());
        assert!(err.is_retryable());
        assert!(!ServiceBusError::ConfigurationError("bad".to_string()).is_retryable());
    }

    #[test]
    fn user_messages_never_contain_raw_details() {
        let err = ServiceBusError::InternalError("thread 'main' panicked at src/lib.rs".into());
        assert_eq!(err.user_message(), "Unexpected error");
    }
}
