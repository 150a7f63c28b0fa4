//! Command dispatch: the mutating operations external clients issue
//! against a running scheduler, deduplicated by an idempotency key
//! supplied by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StopMode {
    Graceful,
    Now,
    NowNow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowOption {
    New,
    None,
    Existing(u32),
}

/// The full verb set a client may issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Hold { task_glob: String, cycle_glob: Option<String> },
    Release { task_glob: String, cycle_glob: Option<String> },
    Trigger { task_glob: String, cycle_glob: Option<String>, flow: FlowOption, wait: bool },
    Set { task_glob: String, cycle_glob: Option<String>, outputs: Vec<String>, prereqs: Vec<String> },
    Kill { task_glob: String, cycle_glob: Option<String> },
    Poll { task_glob: String, cycle_glob: Option<String> },
    Remove { task_glob: String, cycle_glob: Option<String>, flow: Option<FlowOption> },
    Reload,
    Pause,
    Play,
    Stop { mode: StopMode, kill: bool },
    BroadcastSet { point: Option<String>, namespace: String, key: String, value: String },
    BroadcastCancel { point: Option<String>, namespace: String, key: String },
    BroadcastClear { point: Option<String>, namespace: Option<String> },
    ExtTrigger { name: String, id: String },
}

/// A command as it sits on the wire: the verb plus the idempotency key
/// the client supplied. Replies are emitted only after the resulting
/// state transitions are flushed to the snapshot tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub idempotency_key: String,
    pub command: Command,
}

/// Deduplicates commands by idempotency key within a single scheduler
/// run. Pending commands are dropped on restart; clients are expected to
/// retry.
#[derive(Default)]
pub struct Dispatcher {
    seen: HashSet<String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an idempotency key, returning `true` if this is the first
    /// time it has been seen (i.e. the command should actually be
    /// applied).
    pub fn apply(&mut self, envelope: &CommandEnvelope) -> bool {
        self.seen.insert(envelope.idempotency_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_idempotency_key_is_applied_once() {
        let mut dispatcher = Dispatcher::new();
        let envelope = CommandEnvelope {
            idempotency_key: "abc".to_string(),
            command: Command::Pause,
        };
        assert!(dispatcher.apply(&envelope));
        assert!(!dispatcher.apply(&envelope));
    }
}
