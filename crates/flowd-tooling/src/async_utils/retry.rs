//! Bounded retry with exponential backoff.
//!
//! Two kinds of retry live in the scheduler and they are deliberately
//! separate. Task-level retries (a job that failed and has `retry
//! delays` configured) are driven by the scheduler's own timers against
//! an explicit, finite delay list. This module covers the other kind:
//! transport-level retries against a host that answered with a transient
//! error, where an exponential policy with a small cap is appropriate.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// An exponential backoff policy: `initial * factor^attempt`, clamped to
/// `max_interval`, with optional jitter to spread simultaneous retries
/// from a large batch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_interval: f64,
    backoff_factor: f64,
    max_interval: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// A policy allowing up to `max_attempts` retries after the first
    /// try. Defaults: 1s initial interval, doubling, capped at 60s, with
    /// jitter.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 1.0,
            backoff_factor: 2.0,
            max_interval: 60.0,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// The delay to sleep before retry number `attempt` (0-based).
    /// Jitter, when enabled, scales the delay by a factor in [0.5, 1.5).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exp = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let mut seconds = exp.min(self.max_interval);
        if self.jitter {
            seconds *= rand::thread_rng().gen_range(0.5..1.5);
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted,
/// sleeping the policy's delay between attempts. Returns the last error
/// when every attempt failed.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.should_retry(attempt) {
                    return Err(error);
                }
                tokio::time::sleep(policy.calculate_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(5.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(5));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::new(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = RetryPolicy::new(1).with_initial_interval(2.0).with_jitter(true);
        for _ in 0..50 {
            let d = policy.calculate_delay(0);
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn with_retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3).with_initial_interval(0.001).with_jitter(false);
        let result: Result<&str, &str> = with_retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection reset")
                } else {
                    Ok("submitted")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("submitted"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_surfaces_the_final_error() {
        let policy = RetryPolicy::new(1).with_initial_interval(0.001).with_jitter(false);
        let result: Result<(), &str> = with_retry(&policy, || async { Err("host down") }).await;
        assert_eq!(result, Err("host down"));
    }
}
