//! Platform definitions and host-selection with bad-host fallback.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostSelectionMethod {
    DefinitionOrder,
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub hosts: Vec<String>,
    pub job_runner: String,
    pub install_target: String,
    pub selection_method: HostSelectionMethod,
}

/// Process-local set of hosts currently considered unreachable, shared
/// read/write between the scheduler and the job-submission worker pool.
#[derive(Clone, Default)]
pub struct BadHosts {
    retained_until: Arc<DashMap<String, Instant>>,
}

impl BadHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_bad(&self, host: &str, retention: Duration) {
        self.retained_until.insert(host.to_string(), Instant::now() + retention);
    }

    pub fn is_bad(&self, host: &str) -> bool {
        match self.retained_until.get(host) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.retained_until.remove(host);
                false
            }
            None => false,
        }
    }
}

/// Picks a working host for a platform, honouring `selection_method` and
/// skipping hosts in `bad_hosts`. Returns `None` if every host is bad,
/// which the caller surfaces as `PlatformUnreachable`.
pub struct HostSelector {
    round_robin_cursor: std::sync::atomic::AtomicUsize,
}

impl HostSelector {
    pub fn new() -> Self {
        Self { round_robin_cursor: std::sync::atomic::AtomicUsize::new(0) }
    }

    pub fn select<'a>(&self, platform: &'a Platform, bad_hosts: &BadHosts) -> Option<&'a str> {
        let candidates: Vec<&str> = platform
            .hosts
            .iter()
            .map(String::as_str)
            .filter(|h| !bad_hosts.is_bad(h))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        match platform.selection_method {
            HostSelectionMethod::DefinitionOrder => Some(candidates[0]),
            HostSelectionMethod::RoundRobin => {
                let idx = self
                    .round_robin_cursor
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % candidates.len();
                Some(candidates[idx])
            }
            HostSelectionMethod::Random => {
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx])
            }
        }
    }
}

impl Default for HostSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(method: HostSelectionMethod) -> Platform {
        Platform {
            name: "p1".into(),
            hosts: vec!["h1".into(), "h2".into()],
            job_runner: "background".into(),
            install_target: "p1".into(),
            selection_method: method,
        }
    }

    #[test]
    fn definition_order_prefers_first_healthy_host() {
        let p = platform(HostSelectionMethod::DefinitionOrder);
        let bad = BadHosts::new();
        let sel = HostSelector::new();
        assert_eq!(sel.select(&p, &bad), Some("h1"));
        bad.mark_bad("h1", Duration::from_secs(60));
        assert_eq!(sel.select(&p, &bad), Some("h2"));
    }

    #[test]
    fn round_robin_rotates_between_healthy_hosts() {
        let p = platform(HostSelectionMethod::RoundRobin);
        let bad = BadHosts::new();
        let sel = HostSelector::new();
        let first = sel.select(&p, &bad).unwrap().to_string();
        let second = sel.select(&p, &bad).unwrap().to_string();
        assert_ne!(first, second);
        assert_eq!(sel.select(&p, &bad), Some(first.as_str()));
    }

    #[test]
    fn all_hosts_bad_is_unreachable() {
        let p = platform(HostSelectionMethod::DefinitionOrder);
        let bad = BadHosts::new();
        bad.mark_bad("h1", Duration::from_secs(60));
        bad.mark_bad("h2", Duration::from_secs(60));
        let sel = HostSelector::new();
        assert_eq!(sel.select(&p, &bad), None);
    }
}
