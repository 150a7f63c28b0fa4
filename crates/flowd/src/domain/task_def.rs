//! Task definitions: the immutable configuration shared by every proxy of
//! a given task name.

use super::output::{Output, OutputSet};
use crate::cycle::Recurrence;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A platform selector: either a literal platform name or a list tried in
/// order until one is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformSelector {
    Named(String),
    Fallback(Vec<String>),
}

impl PlatformSelector {
    /// Platforms to try, in order.
    pub fn candidates(&self) -> &[String] {
        match self {
            PlatformSelector::Named(s) => std::slice::from_ref(s),
            PlatformSelector::Fallback(v) => v,
        }
    }
}

/// The immutable definition shared by every instance of a task across
/// cycle points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    /// Script body executed by the job, interpreted by the platform's
    /// shell.
    pub script: String,
    pub environment: BTreeMap<String, String>,
    pub platform: PlatformSelector,
    /// Delay before each successive execution retry; the list is finite,
    /// and a proxy that exhausts it keeps its terminal state.
    pub retry_delays: Vec<Duration>,
    /// Delay before each successive submission retry, consulted when a
    /// platform rejects the job outright.
    pub submission_retry_delays: Vec<Duration>,
    pub execution_time_limit: Option<Duration>,
    pub submission_time_limit: Option<Duration>,
    /// Shell commands run on specific task events (`succeeded`, `failed`,
    /// `retry`, ...), keyed by event name.
    pub event_handlers: BTreeMap<String, Vec<String>>,
    pub outputs: OutputSet,
    /// External trigger names every instance of this task waits on
    /// before it may run.
    pub ext_triggers: Vec<String>,
    /// The recurrences at which instances of this task exist; a task may
    /// be active across more than one recurrence.
    pub recurrences: Vec<Recurrence>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, script: impl Into<String>, platform: PlatformSelector) -> Self {
        let mut outputs = OutputSet::new();
        use super::output::PredefinedOutput::*;
        // Only `succeeded` is required by default; the rest are optional
        // signals.
        for p in [Submitted, Started, Succeeded, Failed, SubmitFailed, Expired] {
            outputs.declare(Output::Predefined(p), matches!(p, Succeeded));
        }
        Self {
            name: name.into(),
            script: script.into(),
            environment: BTreeMap::new(),
            platform,
            retry_delays: Vec::new(),
            submission_retry_delays: Vec::new(),
            execution_time_limit: None,
            submission_time_limit: None,
            event_handlers: BTreeMap::new(),
            outputs,
            ext_triggers: Vec::new(),
            recurrences: Vec::new(),
        }
    }

    pub fn with_recurrence(mut self, r: Recurrence) -> Self {
        self.recurrences.push(r);
        self
    }

    /// Whether this task has any instance at the given cycle point, across
    /// all its recurrences.
    pub fn active_at(&self, point: &crate::cycle::CyclePoint) -> bool {
        self.recurrences.iter().any(|r| {
            r.next(None)
                .ok()
                .flatten()
                .map(|first| {
                    if &first == point {
                        return true;
                    }
                    let mut cursor = first;
                    let mut guard = 0u32;
                    while &cursor < point {
                        match r.next(Some(&cursor)) {
                            Ok(Some(next)) => cursor = next,
                            _ => return false,
                        }
                        guard += 1;
                        if guard > 1_000_000 {
                            return false;
                        }
                    }
                    &cursor == point
                })
                .unwrap_or(false)
        })
    }

    pub fn retry_delay(&self, submit_num: u32) -> Option<Duration> {
        self.retry_delays.get(submit_num as usize).copied()
    }

    pub fn submission_retry_delay(&self, submit_num: u32) -> Option<Duration> {
        self.submission_retry_delays.get(submit_num as usize).copied()
    }
}
