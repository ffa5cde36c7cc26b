//! Composition of deadlines and cooperative cancellation.
//!
//! Long-running calls take a [`CancellationToken`] from the caller and usually
//! also carry their own deadline. Either one ends the call: the deadline maps to
//! a timeout error, the token to [`ServiceBusError::Cancelled`].

use super::errors::{ServiceBusError, ServiceBusResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a future raced against a deadline and a cancellation token.
#[derive(Debug)]
pub enum Bounded<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Runs `future` until it completes, `timeout` elapses or `token` is cancelled.
///
/// Cancellation wins ties so a stop request is never reported as a timeout.
pub async fn run_bounded<F, T>(future: F, timeout: Duration, token: &CancellationToken) -> Bounded<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return Bounded::Cancelled;
    }

    tokio::select! {
        biased;
        () = token.cancelled() => Bounded::Cancelled,
        result = tokio::time::timeout(timeout, future) => match result {
            Ok(value) => Bounded::Completed(value),
            Err(_) => Bounded::TimedOut,
        },
    }
}

/// Like [`run_bounded`] for fallible futures; an elapsed deadline becomes
/// [`ServiceBusError::TransientTimeout`] because every caller uses it around a
/// receive-style window.
pub async fn receive_bounded<F, T>(
    future: F,
    timeout: Duration,
    token: &CancellationToken,
    what: &str,
) -> ServiceBusResult<T>
where
    F: Future<Output = ServiceBusResult<T>>,
{
    match run_bounded(future, timeout, token).await {
        Bounded::Completed(result) => result,
        Bounded::TimedOut => Err(ServiceBusError::TransientTimeout(format!(
            "{what} after {timeout:?}"
        ))),
        Bounded::Cancelled => Err(ServiceBusError::Cancelled(what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_elapses_into_transient_timeout() {
        let token = CancellationToken::new();
        let result: ServiceBusResult<()> = receive_bounded(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(20),
            &token,
            "accept session",
        )
        .await;

        assert!(matches!(result, Err(ServiceBusError::TransientTimeout(_))));
    }

    #[tokio::test]
    async fn external_token_cancels_before_deadline() {
        let token = CancellationToken::new();
        let child = token.child_token();
        token.cancel();

        let outcome = run_bounded(
            tokio::time::sleep(Duration::from_secs(5)),
            Duration::from_secs(10),
            &child,
        )
        .await;

        assert!(matches!(outcome, Bounded::Cancelled));
    }

    #[tokio::test]
    async fn completed_future_passes_value_through() {
        let token = CancellationToken::new();
        let outcome = run_bounded(async { 7 }, Duration::from_secs(1), &token).await;
        assert!(matches!(outcome, Bounded::Completed(7)));
    }
}
