//! Timeout wrapper distinguishing "the operation failed" from "the
//! operation never finished".
//!
//! Every outbound subprocess the scheduler starts — job-runner commands,
//! event handlers, polls — carries a timeout, and the caller usually
//! needs to treat the two failure shapes differently: a failed handler
//! is logged with its stderr, a timed-out one is logged as stuck.

use std::future::Future;
use std::time::Duration;

/// Why a timed operation did not produce a value.
#[derive(Debug)]
pub enum TimeoutError<E> {
    /// The operation completed with its own error before the deadline.
    OperationFailed(E),
    /// The deadline elapsed first; the operation was dropped.
    Timeout(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::OperationFailed(e) => write!(f, "operation failed: {e}"),
            TimeoutError::Timeout(d) => write!(f, "operation timed out after {d:?}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TimeoutError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TimeoutError::OperationFailed(e) => Some(e),
            TimeoutError::Timeout(_) => None,
        }
    }
}

/// Await `operation` for at most `duration`.
pub async fn with_timeout<F, T, E>(duration: Duration, operation: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(TimeoutError::OperationFailed(error)),
        Err(_elapsed) => Err(TimeoutError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_deadline() {
        let result: Result<u32, TimeoutError<&str>> =
            with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert!(matches!(result, Ok(7)));
    }

    #[tokio::test]
    async fn operation_error_is_not_a_timeout() {
        let result: Result<u32, _> =
            with_timeout(Duration::from_secs(1), async { Err("exit 1") }).await;
        assert!(matches!(result, Err(TimeoutError::OperationFailed("exit 1"))));
    }

    #[tokio::test]
    async fn deadline_elapsing_reports_the_duration() {
        let deadline = Duration::from_millis(10);
        let result: Result<(), TimeoutError<&str>> = with_timeout(deadline, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TimeoutError::Timeout(d)) if d == deadline));
    }
}
