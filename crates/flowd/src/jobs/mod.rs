//! Job lifecycle manager: submission, polling, killing, and host fallback
//! across a task's target platform.

pub mod driver;
pub mod platform;

pub use driver::{JobDriver, JobPollState, JobSpec, LocalBackgroundDriver, SubmitResult};
pub use platform::{BadHosts, HostSelectionMethod, HostSelector, Platform};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use flowd_tooling::async_utils::retry::RetryPolicy;
use thiserror::Error;

/// Maximum batch size before a platform's ready proxies are split into
/// balanced chunks.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no platform matches selector: {0}")]
    PlatformLookup(String),
    #[error("platform unreachable: {0}")]
    PlatformUnreachable(String),
    #[error("job submit failed: {0}")]
    SubmitFailed(String),
}

/// Split `items` into chunks of roughly equal size, each at most
/// `max_size`.
pub fn balanced_chunks<T: Clone>(items: &[T], max_size: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let num_chunks = items.len().div_ceil(max_size);
    let base = items.len() / num_chunks;
    let remainder = items.len() % num_chunks;

    let mut chunks = Vec::with_capacity(num_chunks);
    let mut idx = 0;
    for i in 0..num_chunks {
        let size = base + if i < remainder { 1 } else { 0 };
        chunks.push(items[idx..idx + size].to_vec());
        idx += size;
    }
    chunks
}

/// A terminal/non-terminal job status, used by the reconciliation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    SubmitFailed,
}

impl ReportedStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportedStatus::Succeeded | ReportedStatus::Failed | ReportedStatus::SubmitFailed)
    }
}

/// Tracks the authoritative status of one `(cycle, name, submit_num)` job
/// across its three asynchronous report sources and applies the
/// precedence rule: the most recent terminal report wins; a terminal
/// status is never reverted to a non-terminal one.
#[derive(Debug, Default)]
pub struct StatusReconciler {
    current: HashMap<(String, String, u32), ReportedStatus>,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a new report, returning the resulting authoritative status if
    /// it changed.
    pub fn report(&mut self, key: (String, String, u32), status: ReportedStatus) -> Option<ReportedStatus> {
        match self.current.get(&key) {
            Some(existing) if existing.is_terminal() && !status.is_terminal() => None,
            Some(existing) if *existing == status => None,
            _ => {
                self.current.insert(key, status);
                Some(status)
            }
        }
    }

    pub fn status(&self, key: &(String, String, u32)) -> Option<ReportedStatus> {
        self.current.get(key).copied()
    }
}

/// Schedules a poll at `start_time + execution_time_limit + margin` to
/// catch jobs stuck past their declared limit even when the driver itself
/// offers no timeout.
pub fn time_limit_poll_at(start: std::time::Instant, limit: Duration, margin: Duration) -> std::time::Instant {
    start + limit + margin
}

/// Coordinates submission/poll/kill across platforms, applying batching,
/// host fallback, and retry bookkeeping. Owns no task state itself;
/// callers (the scheduler loop) pass in the proxies to act on and apply
/// the returned outcomes back to the pool.
pub struct JobManager {
    drivers: HashMap<String, Arc<dyn JobDriver>>,
    bad_hosts: BadHosts,
    host_selector: HostSelector,
    bad_host_retention: Duration,
    host_retry: RetryPolicy,
    pub reconciler: StatusReconciler,
}

impl JobManager {
    pub fn new(bad_host_retention: Duration) -> Self {
        let mut drivers: HashMap<String, Arc<dyn JobDriver>> = HashMap::new();
        drivers.insert("background".to_string(), Arc::new(LocalBackgroundDriver));
        Self {
            drivers,
            bad_hosts: BadHosts::new(),
            host_selector: HostSelector::new(),
            bad_host_retention,
            host_retry: RetryPolicy::new(2).with_initial_interval(0.01).with_jitter(false),
            reconciler: StatusReconciler::new(),
        }
    }

    pub fn register_driver(&mut self, driver: Arc<dyn JobDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Submit a batch of jobs to `platform`. A connection failure against
    /// the current host is retried in place per `host_retry` before
    /// falling over to the next host and marking the failed one bad for
    /// the configured retention period; local retry and host fallback are
    /// distinct recovery paths for the same class of transient error.
    pub async fn submit_batch(
        &self,
        platform: &Platform,
        batch: &[JobSpec],
    ) -> Result<Vec<SubmitResult>, JobError> {
        let driver = self
            .drivers
            .get(&platform.job_runner)
            .ok_or_else(|| JobError::PlatformLookup(platform.job_runner.clone()))?;

        let mut attempted_hosts = 0;
        loop {
            let Some(host) = self.host_selector.select(platform, &self.bad_hosts) else {
                return Err(JobError::PlatformUnreachable(platform.name.clone()));
            };

            let mut attempt = 0;
            let results = loop {
                let results = driver.submit(host, batch).await;
                let connection_failed = !results.is_empty()
                    && results.iter().all(|r| matches!(&r.outcome, Err(e) if e.contains("connect") || e.contains("ssh")));
                if connection_failed && self.host_retry.should_retry(attempt) {
                    let delay = self.host_retry.calculate_delay(attempt);
                    tracing::debug!(host, attempt, ?delay, "submit connection failure, retrying host");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                break results;
            };

            let all_connection_failed = !results.is_empty()
                && results.iter().all(|r| matches!(&r.outcome, Err(e) if e.contains("connect") || e.contains("ssh")));
            if all_connection_failed {
                self.bad_hosts.mark_bad(host, self.bad_host_retention);
                attempted_hosts += 1;
                if attempted_hosts >= platform.hosts.len() {
                    return Err(JobError::PlatformUnreachable(platform.name.clone()));
                }
                continue;
            }
            return Ok(results);
        }
    }

    pub async fn poll_batch(&self, platform: &Platform, job_ids: &[String]) -> Result<Vec<(String, JobPollState)>, JobError> {
        let driver = self
            .drivers
            .get(&platform.job_runner)
            .ok_or_else(|| JobError::PlatformLookup(platform.job_runner.clone()))?;
        let host = self
            .host_selector
            .select(platform, &self.bad_hosts)
            .ok_or_else(|| JobError::PlatformUnreachable(platform.name.clone()))?;
        Ok(driver.poll(host, job_ids).await)
    }

    pub async fn kill_batch(&self, platform: &Platform, job_ids: &[String]) -> Result<Vec<(String, Result<(), String>)>, JobError> {
        let driver = self
            .drivers
            .get(&platform.job_runner)
            .ok_or_else(|| JobError::PlatformLookup(platform.job_runner.clone()))?;
        let host = self
            .host_selector
            .select(platform, &self.bad_hosts)
            .ok_or_else(|| JobError::PlatformUnreachable(platform.name.clone()))?;
        Ok(driver.kill(host, job_ids).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_chunks_splits_evenly() {
        let items: Vec<u32> = (0..250).collect();
        let chunks = balanced_chunks(&items, MAX_BATCH_SIZE);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.len() <= MAX_BATCH_SIZE);
        }
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 250);
    }

    #[test]
    fn terminal_status_is_never_reverted() {
        let mut r = StatusReconciler::new();
        let key = ("1".to_string(), "foo".to_string(), 0);
        assert_eq!(r.report(key.clone(), ReportedStatus::Succeeded), Some(ReportedStatus::Succeeded));
        assert_eq!(r.report(key.clone(), ReportedStatus::Running), None);
        assert_eq!(r.status(&key), Some(ReportedStatus::Succeeded));
    }
}
