//! Task proxies: the mutable, per-`(task, cycle, flow)` instances the pool
//! tracks.

use super::flow::FlowSet;
use super::output::{Output, PredefinedOutput};
use super::prerequisite::PrereqExpr;
use super::{CycleId, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// The finite state graph a task proxy moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting on prerequisites, a retry timer, or an external trigger.
    Waiting,
    /// Prerequisites satisfied; queued for job submission, possibly
    /// behind its queue's concurrency cap.
    Preparing,
    /// Submitted to a platform, awaiting an authoritative start/fail.
    Submitted,
    /// The job has started running on its platform.
    Running,
    /// The job exited zero and all required outputs are satisfied.
    Succeeded,
    /// The job exited non-zero, or timed out and was judged failed.
    Failed,
    /// The platform rejected submission outright.
    SubmitFailed,
    /// The proxy outran its validity window before it could run.
    Expired,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::SubmitFailed | TaskState::Expired
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Submitted | TaskState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Preparing => "preparing",
            TaskState::Submitted => "submitted",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::SubmitFailed => "submit-failed",
            TaskState::Expired => "expired",
        }
    }

    /// Parse the snapshot-table representation back into a state, for
    /// restart recovery.
    pub fn parse(s: &str) -> Option<TaskState> {
        Some(match s {
            "waiting" => TaskState::Waiting,
            "preparing" => TaskState::Preparing,
            "submitted" => TaskState::Submitted,
            "running" => TaskState::Running,
            "succeeded" => TaskState::Succeeded,
            "failed" => TaskState::Failed,
            "submit-failed" => TaskState::SubmitFailed,
            "expired" => TaskState::Expired,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mutable task instance: `(task-name, cycle-point, flow-set)` plus its
/// runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProxy {
    pub task: TaskId,
    pub cycle: CycleId,
    pub flows: FlowSet,
    pub state: TaskState,
    pub held: bool,
    /// Number of submissions attempted so far, starting at 0 for the
    /// first submission.
    pub submit_num: u32,
    pub prerequisites: PrereqExpr,
    pub outputs_completed: BTreeSet<Output>,
    /// Per-proxy runtime settings overridden by a broadcast, keyed by
    /// setting name.
    pub runtime_overlay: std::collections::BTreeMap<String, String>,
    /// Earliest instant this proxy may be considered ready again; set by
    /// a retry delay and cleared once the deadline passes. Not persisted:
    /// a restart re-submits an interrupted retry immediately.
    #[serde(skip)]
    pub gated_until: Option<Instant>,
    /// External trigger names this proxy still waits on, each flagged
    /// satisfied once the matching `ext-trigger` command arrives.
    pub ext_triggers: std::collections::BTreeMap<String, bool>,
    /// Triggered with `--wait`: completed outputs are recorded but
    /// downstream spawning is deferred until an explicit release.
    pub defer_downstream: bool,
}

impl TaskProxy {
    pub fn new(task: TaskId, cycle: CycleId, flows: FlowSet, prerequisites: PrereqExpr) -> Self {
        Self {
            task,
            cycle,
            flows,
            state: TaskState::Waiting,
            held: false,
            submit_num: 0,
            prerequisites,
            outputs_completed: BTreeSet::new(),
            runtime_overlay: std::collections::BTreeMap::new(),
            gated_until: None,
            ext_triggers: std::collections::BTreeMap::new(),
            defer_downstream: false,
        }
    }

    /// Whether this proxy's prerequisites and external triggers are
    /// satisfied, no retry timer is pending, and it is not held, i.e. it
    /// is eligible to advance to `preparing`.
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Waiting
            && !self.held
            && self.gate_elapsed()
            && self.ext_triggers.values().all(|satisfied| *satisfied)
            && self.prerequisites.is_satisfied()
    }

    fn gate_elapsed(&self) -> bool {
        self.gated_until.map_or(true, |until| Instant::now() >= until)
    }

    /// Record an output completion, returning whether it was newly
    /// recorded (idempotent against duplicate job messages).
    pub fn complete_output(&mut self, output: Output) -> bool {
        self.outputs_completed.insert(output)
    }

    /// Mark one named external trigger satisfied. Returns false if this
    /// proxy never declared the trigger.
    pub fn satisfy_ext_trigger(&mut self, name: &str) -> bool {
        match self.ext_triggers.get_mut(name) {
            Some(satisfied) => {
                *satisfied = true;
                true
            }
            None => false,
        }
    }

    /// Apply an authoritative state transition driven by a job message.
    /// Rejects regressions from a terminal state, since late or duplicate
    /// job messages must not resurrect a finished proxy.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.is_terminal() && !matches!(next, TaskState::Waiting) {
            return false;
        }
        self.state = next;
        true
    }

    /// Whether a completed output on this proxy fires the given
    /// downstream trigger. Every predefined output fires its own literal
    /// trigger; `succeeded` and `failed` additionally fire the implicit
    /// `:finish` trigger. An `expired` proxy fires `:finish` (so
    /// downstream tasks waiting on `:finish` are not stuck forever) but
    /// fires no other triggers, since it never actually ran.
    pub fn fires_trigger(&self, output: &Output, trigger: &Output) -> bool {
        if output == trigger {
            return true;
        }
        let trigger_is_finish = matches!(trigger, Output::Predefined(t) if t.satisfies_finish());
        if let Output::Predefined(PredefinedOutput::Expired) = output {
            return trigger_is_finish;
        }
        if let Output::Predefined(p) = output {
            return p.satisfies_finish() && trigger_is_finish;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::output::PredefinedOutput;
    use std::time::Duration;

    fn proxy() -> TaskProxy {
        TaskProxy::new(TaskId(1), CycleId(1), FlowSet::single(1), PrereqExpr::All(vec![]))
    }

    #[test]
    fn ready_requires_satisfied_prereqs_and_not_held() {
        let mut p = proxy();
        assert!(p.is_ready());
        p.held = true;
        assert!(!p.is_ready());
    }

    #[test]
    fn pending_retry_gate_blocks_readiness() {
        let mut p = proxy();
        p.gated_until = Some(Instant::now() + Duration::from_secs(60));
        assert!(!p.is_ready());
        p.gated_until = Some(Instant::now() - Duration::from_secs(1));
        assert!(p.is_ready());
    }

    #[test]
    fn unsatisfied_ext_trigger_blocks_readiness() {
        let mut p = proxy();
        p.ext_triggers.insert("data_ready".to_string(), false);
        assert!(!p.is_ready());
        assert!(p.satisfy_ext_trigger("data_ready"));
        assert!(p.is_ready());
        assert!(!p.satisfy_ext_trigger("undeclared"));
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let mut p = proxy();
        assert!(p.transition(TaskState::Succeeded));
        assert!(!p.transition(TaskState::Running));
    }

    #[test]
    fn state_round_trips_through_snapshot_representation() {
        for state in [
            TaskState::Waiting,
            TaskState::Preparing,
            TaskState::SubmitFailed,
            TaskState::Expired,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn succeeded_and_failed_both_fire_finish_trigger() {
        let p = proxy();
        let finish = Output::Predefined(PredefinedOutput::Succeeded);
        assert!(p.fires_trigger(&Output::Predefined(PredefinedOutput::Succeeded), &finish));
        assert!(p.fires_trigger(&Output::Predefined(PredefinedOutput::Failed), &finish));
    }

    #[test]
    fn expired_does_not_fire_other_triggers() {
        let p = proxy();
        let started = Output::Predefined(PredefinedOutput::Started);
        assert!(!p.fires_trigger(&Output::Predefined(PredefinedOutput::Expired), &started));
    }
}
