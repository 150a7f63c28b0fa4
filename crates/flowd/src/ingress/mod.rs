//! Message ingress: task-emitted status messages, whether pushed over
//! the network or synthesised from poll results.
//!
//! Source priority (commands before task messages before job status) is
//! enforced structurally: the scheduler drains each source in a fixed
//! order every iteration. Within one source, messages are totally
//! ordered by the sender's timestamp with a server-side sequence number
//! breaking ties across senders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A structured task message, as sent over the network or synthesised by
/// the job manager from a poll result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub severity: Severity,
    pub text: String,
    pub cycle: String,
    pub name: String,
    pub submit_num: u32,
    /// The sender's own monotonic timestamp, used for total ordering
    /// among messages about the same `(task, cycle, submit-num)`.
    pub sender_timestamp: DateTime<Utc>,
    /// Assigned on arrival, used to break ties across different tasks.
    #[serde(default)]
    pub sequence_no: u64,
}

impl TaskMessage {
    /// `CRITICAL` severity with text `failed` is a synonym for the
    /// `failed` output.
    pub fn is_failed_synonym(&self) -> bool {
        self.severity == Severity::Critical && self.text == "failed"
    }
}

/// Assigns server-side sequence numbers to inbound messages on arrival.
pub struct SequenceAssigner {
    counter: AtomicU64,
}

impl SequenceAssigner {
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceAssigner {
    fn default() -> Self {
        Self::new()
    }
}
