use super::cancellation::{Bounded, run_bounded};
use super::errors::{ServiceBusError, ServiceBusResult};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Safe lock acquisition with timeout and optional cancellation.
pub async fn acquire_lock_with_timeout<'a, T>(
    mutex: &'a Mutex<T>,
    operation_name: &str,
    timeout_duration: Duration,
    cancel_token: Option<&CancellationToken>,
) -> ServiceBusResult<MutexGuard<'a, T>> {
    log::debug!("Attempting to acquire lock for {operation_name}");

    let never = CancellationToken::new();
    let token = cancel_token.unwrap_or(&never);

    match run_bounded(mutex.lock(), timeout_duration, token).await {
        Bounded::Completed(guard) => {
            log::debug!("Successfully acquired lock for {operation_name}");
            Ok(guard)
        }
        Bounded::TimedOut => {
            let error_msg =
                format!("Timeout acquiring lock for {operation_name} after {timeout_duration:?}");
            log::error!("{error_msg}");
            Err(ServiceBusError::OperationTimeout(error_msg))
        }
        Bounded::Cancelled => {
            let error_msg = format!("Lock acquisition for {operation_name} was cancelled");
            log::warn!("{error_msg}");
            Err(ServiceBusError::Cancelled(error_msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn held_lock_times_out() {
        let mutex = Mutex::new(0);
        let _held = mutex.lock().await;

        let result =
            acquire_lock_with_timeout(&mutex, "test", Duration::from_millis(20), None).await;
        assert!(matches!(result, Err(ServiceBusError::OperationTimeout(_))));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_acquisition() {
        let mutex = Mutex::new(0);
        let _held = mutex.lock().await;
        let token = CancellationToken::new();
        token.cancel();

        let result =
            acquire_lock_with_timeout(&mutex, "test", Duration::from_secs(5), Some(&token)).await;
        assert!(matches!(result, Err(ServiceBusError::Cancelled(_))));
    }
}
