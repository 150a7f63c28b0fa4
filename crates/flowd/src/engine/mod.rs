//! Scheduler loop: single-threaded, cooperative, eight phases per
//! iteration. Phases 1-3 and 6 (ingress drain, runahead, readiness,
//! retry/ext-trigger timers) live here; phases 4-5 and 7-8 (queueing,
//! submission, handlers, snapshot flush) are orchestrated by the server
//! binary, which owns the I/O workers and the database connection.

pub mod queue;

pub use queue::{QueueConfig, QueueTracker};

use crate::broadcast::BroadcastOverlay;
use crate::commands::{Command, CommandEnvelope, Dispatcher, FlowOption};
use crate::cycle::{self, CycleDuration, CyclePoint};
use crate::db::EventKind;
use crate::domain::flow::FlowSet;
use crate::domain::output::{Output, PredefinedOutput};
use crate::domain::proxy::TaskState;
use crate::domain::{TaskCycleKey, TaskDefinition, TaskId};
use crate::graph::{CycleArena, Graph, NameArena};
use crate::ingress::TaskMessage;
use crate::pool::{NameGlob, TaskPool};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
    #[error(transparent)]
    Graph(#[from] crate::graph::GraphError),
    #[error(transparent)]
    Cycle(#[from] cycle::CycleError),
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Why the scheduler loop stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `stop`: drain gracefully, wait for in-flight jobs.
    Graceful,
    /// `stop --now`: stop submitting; let running jobs continue; detach.
    Now,
    /// `stop --now --now`: stop submitting and detach immediately; running
    /// jobs are adopted on restart.
    NowNow,
    /// The graph has no more work and no forward recurrence remains.
    Completed,
    /// No transition occurred within the stall timeout and the workflow
    /// is configured to abort on stall.
    StalledAbort,
}

/// Outcome of one loop iteration, surfaced to the caller for logging,
/// driving the job manager, and appending to the durable event log.
#[derive(Debug, Default)]
pub struct IterationReport {
    pub transitions: usize,
    pub spawned: Vec<TaskCycleKey>,
    /// Active proxies a `kill` command targeted; the caller kills their
    /// jobs through the platform driver and reconciles the result.
    pub kill_requested: Vec<TaskCycleKey>,
    /// Proxies a `poll` command targeted explicitly.
    pub poll_requested: Vec<TaskCycleKey>,
    /// A `reload` command arrived and was not displaced by a later
    /// immediate stop.
    pub reload_requested: bool,
    /// Flow labels allocated this iteration by `trigger --flow=new`,
    /// with a description for the flow registry.
    pub new_flows: Vec<(u32, String)>,
    pub stalled: bool,
    /// Durable records staged this iteration, appended to the event log
    /// by the caller before any client acknowledgement.
    pub events: Vec<(EventKind, serde_json::Value)>,
}

/// Owns every piece of scheduler state and drives the loop. The only
/// component permitted to mutate the pool.
pub struct Scheduler {
    pub pool: TaskPool,
    pub graph: Graph,
    pub arena: CycleArena,
    pub names: NameArena,
    pub defs: BTreeMap<TaskId, TaskDefinition>,
    pub broadcast: BroadcastOverlay,
    pub dispatcher: Dispatcher,
    pub queues: QueueTracker,
    pub runahead_limit: CycleDuration,
    pub stall_timeout: Duration,
    pub stop_after: Option<CyclePoint>,
    /// External triggers already received this run, by signature, with
    /// the result id each carried.
    pub xtriggers: HashMap<String, String>,
    paused: bool,
    reload_requested: bool,
    /// Highest flow number ever allocated, including flows restored from
    /// a previous run whose proxies are gone.
    max_flow_num: u32,
    /// Next cycle point at which each parentless task spawns; advanced
    /// lazily as the runahead horizon moves. `None` once the recurrence
    /// is exhausted.
    seed_cursors: HashMap<TaskId, Option<CyclePoint>>,
    last_transition_at: Instant,
    iteration_seq: u64,
    shutdown: Option<ShutdownReason>,
}

impl Scheduler {
    pub fn new(graph: Graph, runahead_limit: CycleDuration, stall_timeout: Duration) -> Self {
        Self::with_names(graph, NameArena::new(), runahead_limit, stall_timeout)
    }

    /// Build a scheduler with a pre-populated name arena, as produced by
    /// loading a static workflow configuration.
    pub fn with_names(
        graph: Graph,
        names: NameArena,
        runahead_limit: CycleDuration,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            pool: TaskPool::new(),
            graph,
            arena: CycleArena::new(),
            names,
            defs: BTreeMap::new(),
            broadcast: BroadcastOverlay::new(),
            dispatcher: Dispatcher::new(),
            queues: QueueTracker::new(Vec::new()),
            runahead_limit,
            stall_timeout,
            stop_after: None,
            xtriggers: HashMap::new(),
            paused: false,
            reload_requested: false,
            max_flow_num: 0,
            seed_cursors: HashMap::new(),
            last_transition_at: Instant::now(),
            iteration_seq: 0,
            shutdown: None,
        }
    }

    /// Install the task definition table and derived per-task state
    /// (external-trigger declarations, seed cursors for parentless
    /// tasks).
    pub fn set_definitions(&mut self, defs: BTreeMap<TaskId, TaskDefinition>) {
        let ext_triggers: HashMap<TaskId, Vec<String>> = defs
            .iter()
            .filter(|(_, d)| !d.ext_triggers.is_empty())
            .map(|(id, d)| (*id, d.ext_triggers.clone()))
            .collect();
        self.pool.set_ext_trigger_defs(ext_triggers);
        let outputs = defs.iter().map(|(id, d)| (*id, d.outputs.clone())).collect();
        self.pool.set_output_defs(outputs);
        self.defs = defs;
    }

    /// Seed the pool: point each parentless task's cursor at the first
    /// point of its earliest recurrence. The actual spawning happens
    /// inside `iterate`, bounded by the runahead horizon.
    pub fn seed(&mut self) -> Result<(), EngineError> {
        let parentless: Vec<TaskId> = self
            .defs
            .keys()
            .copied()
            .filter(|id| !self.graph.has_parents(*id))
            .collect();
        for id in parentless {
            let first = self.first_recurrence_point(id)?;
            self.seed_cursors.insert(id, first);
        }
        Ok(())
    }

    fn first_recurrence_point(&self, id: TaskId) -> Result<Option<CyclePoint>, EngineError> {
        let def = match self.defs.get(&id) {
            Some(d) => d,
            None => return Ok(None),
        };
        let mut earliest: Option<CyclePoint> = None;
        for r in &def.recurrences {
            if let Some(p) = r.next(None)? {
                earliest = match earliest {
                    Some(e) if e <= p => Some(e),
                    _ => Some(p),
                };
            }
        }
        Ok(earliest)
    }

    /// Spawn parentless-task instances whose cycle points have entered
    /// the runahead window, advancing each task's cursor along its
    /// recurrence. Never spawns past `stop_after`.
    fn advance_parentless(&mut self, report: &mut IterationReport) -> Result<(), EngineError> {
        let horizon = self.runahead_horizon();
        let ids: Vec<TaskId> = self.seed_cursors.keys().copied().collect();
        for id in ids {
            loop {
                let Some(Some(point)) = self.seed_cursors.get(&id).cloned() else { break };
                if let Some(stop) = &self.stop_after {
                    if &point > stop {
                        self.seed_cursors.insert(id, None);
                        break;
                    }
                }
                // An empty pool has no horizon; spawn the first instance
                // to establish one.
                if let Some(h) = &horizon {
                    if &point > h {
                        break;
                    }
                }
                let cycle = self.arena.intern(point);
                self.pool.spawn(id, cycle, FlowSet::single(1), &self.graph, &mut self.arena)?;
                report.spawned.push(TaskCycleKey { task: id, cycle });

                let next = self.next_recurrence_point(id, &point)?;
                self.seed_cursors.insert(id, next);
                if horizon.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn next_recurrence_point(&self, id: TaskId, after: &CyclePoint) -> Result<Option<CyclePoint>, EngineError> {
        let def = match self.defs.get(&id) {
            Some(d) => d,
            None => return Ok(None),
        };
        let mut earliest: Option<CyclePoint> = None;
        for r in &def.recurrences {
            if let Some(p) = r.next(Some(after))? {
                earliest = match earliest {
                    Some(e) if e <= p => Some(e),
                    _ => Some(p),
                };
            }
        }
        Ok(earliest)
    }

    fn seeding_exhausted(&self) -> bool {
        self.seed_cursors.values().all(|cursor| match cursor {
            None => true,
            Some(point) => self.stop_after.as_ref().map_or(false, |stop| point > stop),
        })
    }

    pub fn request_shutdown(&mut self, reason: ShutdownReason) {
        self.shutdown = Some(reason);
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Drain a batch of commands in arrival order, applying idempotency
    /// dedup and staging state transitions.
    fn apply_commands(
        &mut self,
        commands: Vec<CommandEnvelope>,
        report: &mut IterationReport,
    ) -> Result<(), EngineError> {
        for envelope in commands {
            if !self.dispatcher.apply(&envelope) {
                debug!(key = %envelope.idempotency_key, "duplicate command dropped");
                continue;
            }
            if let Ok(payload) = serde_json::to_value(&envelope.command) {
                report.events.push((EventKind::Command, payload));
            }
            self.apply_one_command(envelope.command, report)?;
            report.transitions += 1;
        }
        Ok(())
    }

    fn apply_one_command(&mut self, command: Command, report: &mut IterationReport) -> Result<(), EngineError> {
        match command {
            Command::Hold { task_glob, cycle_glob } => {
                self.for_matching(&task_glob, cycle_glob.as_deref(), |pool, key| {
                    let _ = pool.hold(key);
                });
                self.hold_future_spawns(&task_glob, cycle_glob.as_deref());
            }
            Command::Release { task_glob, cycle_glob } => {
                let released = self.matching_keys(&task_glob, cycle_glob.as_deref());
                for key in released {
                    let _ = self.pool.release(key);
                    let spawned = self.pool.spawn_deferred(key, &self.graph, &mut self.arena)?;
                    report.spawned.extend(spawned);
                }
                self.release_future_spawns(&task_glob, cycle_glob.as_deref());
            }
            Command::Kill { task_glob, cycle_glob } => {
                for key in self.matching_keys(&task_glob, cycle_glob.as_deref()) {
                    let Some(proxy) = self.pool.get_mut(key) else { continue };
                    if proxy.state.is_active() {
                        report.kill_requested.push(key);
                    } else if proxy.state == TaskState::Preparing {
                        // Never reached a platform; nothing to kill.
                        proxy.transition(TaskState::SubmitFailed);
                    }
                }
            }
            Command::Poll { task_glob, cycle_glob } => {
                report.poll_requested.extend(self.matching_keys(&task_glob, cycle_glob.as_deref()));
            }
            Command::Remove { task_glob, cycle_glob, .. } => {
                self.for_matching(&task_glob, cycle_glob.as_deref(), |pool, key| {
                    pool.remove_with_flow_clear(key);
                });
            }
            Command::Trigger { task_glob, cycle_glob, flow, wait } => {
                let flows = match flow {
                    FlowOption::New => {
                        let n = self.next_flow_number();
                        self.max_flow_num = self.max_flow_num.max(n);
                        report.new_flows.push((n, format!("trigger {task_glob}")));
                        FlowSet::single(n)
                    }
                    FlowOption::None => FlowSet::no_flow(),
                    FlowOption::Existing(n) => FlowSet::single(n),
                };
                self.trigger_matching(&task_glob, cycle_glob.as_deref(), flows, wait)?;
            }
            Command::Set { task_glob, cycle_glob, outputs, prereqs } => {
                let spawned = self.apply_set(&task_glob, cycle_glob.as_deref(), &outputs, &prereqs)?;
                report.spawned.extend(spawned);
            }
            Command::Pause => {
                info!("workflow paused");
                self.paused = true;
            }
            Command::Play => {
                info!("workflow resumed");
                self.paused = false;
            }
            Command::Reload => {
                self.reload_requested = true;
            }
            Command::Stop { mode, kill } => {
                let reason = match mode {
                    crate::commands::StopMode::Graceful => ShutdownReason::Graceful,
                    crate::commands::StopMode::Now => ShutdownReason::Now,
                    crate::commands::StopMode::NowNow => ShutdownReason::NowNow,
                };
                if reason == ShutdownReason::NowNow && self.reload_requested {
                    info!("immediate stop drops pending reload");
                    self.reload_requested = false;
                }
                if kill {
                    let active: Vec<TaskCycleKey> = self
                        .pool
                        .iter()
                        .filter(|(_, p)| p.state.is_active())
                        .map(|(k, _)| *k)
                        .collect();
                    report.kill_requested.extend(active);
                }
                self.request_shutdown(reason);
            }
            Command::BroadcastSet { point, namespace, key, value } => {
                report.events.push((
                    EventKind::BroadcastChange,
                    serde_json::json!({ "change": "set", "point": point, "namespace": namespace, "key": key, "value": value }),
                ));
                self.broadcast.set(
                    crate::broadcast::BroadcastTarget { point, namespace, key },
                    value,
                );
            }
            Command::BroadcastCancel { point, namespace, key } => {
                report.events.push((
                    EventKind::BroadcastChange,
                    serde_json::json!({ "change": "cancel", "point": point, "namespace": namespace, "key": key }),
                ));
                self.broadcast.cancel(&crate::broadcast::BroadcastTarget { point, namespace, key });
            }
            Command::BroadcastClear { point, namespace } => {
                report.events.push((
                    EventKind::BroadcastChange,
                    serde_json::json!({ "change": "clear", "point": point, "namespace": namespace }),
                ));
                self.broadcast.clear(point.as_deref(), namespace.as_deref());
            }
            Command::ExtTrigger { name, id } => {
                let mut satisfied = 0;
                for key in self.all_keys() {
                    if let Some(proxy) = self.pool.get_mut(key) {
                        if proxy.satisfy_ext_trigger(&name) {
                            satisfied += 1;
                        }
                    }
                }
                info!(trigger = %name, id = %id, satisfied, "external trigger received");
                self.xtriggers.insert(name, id);
            }
        }
        Ok(())
    }

    /// `set` with explicit outputs completes them (spawning downstream as
    /// a real completion would) and applies the matching state; `set`
    /// with prerequisites satisfies the named atoms, or all of them for
    /// the literal `all`.
    fn apply_set(
        &mut self,
        task_glob: &str,
        cycle_glob: Option<&str>,
        outputs: &[String],
        prereqs: &[String],
    ) -> Result<Vec<TaskCycleKey>, EngineError> {
        let mut spawned = Vec::new();
        for key in self.matching_keys(task_glob, cycle_glob) {
            for output_name in outputs {
                let output = Output::parse(output_name);
                if let Some(state) = state_for_output(&output) {
                    if let Some(proxy) = self.pool.get_mut(key) {
                        proxy.transition(state);
                    }
                }
                spawned.extend(self.pool.complete_output(key, output, &self.graph, &mut self.arena)?);
            }
            for prereq in prereqs {
                if prereq == "all" {
                    if let Some(proxy) = self.pool.get_mut(key) {
                        proxy.prerequisites = crate::domain::prerequisite::PrereqExpr::All(vec![]);
                    }
                    continue;
                }
                if let Some((task, cycle, output)) = self.parse_prereq(prereq) {
                    let _ = self.pool.satisfy(key, task, cycle, &output);
                } else {
                    warn!(prereq = %prereq, "unparseable prerequisite reference ignored");
                }
            }
        }
        Ok(spawned)
    }

    /// Parse a `cycle/task:output` prerequisite reference; the output
    /// part defaults to `succeeded`.
    fn parse_prereq(&mut self, s: &str) -> Option<(TaskId, crate::domain::CycleId, Output)> {
        let (cycle_str, rest) = s.split_once('/')?;
        let (task_str, output_str) = match rest.split_once(':') {
            Some((t, o)) => (t, o),
            None => (rest, "succeeded"),
        };
        let task = self.names.lookup(task_str)?;
        let point = CyclePoint::parse(cycle_str, None).ok()?;
        let cycle = self.arena.intern(point);
        Some((task, cycle, Output::parse(output_str)))
    }

    fn next_flow_number(&self) -> u32 {
        self.pool
            .iter()
            .flat_map(|(_, p)| p.flows.iter())
            .max()
            .unwrap_or(0)
            .max(self.max_flow_num)
            + 1
    }

    fn all_keys(&self) -> Vec<TaskCycleKey> {
        self.pool.iter().map(|(k, _)| *k).collect()
    }

    fn matching_keys(&self, task_glob: &str, cycle_glob: Option<&str>) -> Vec<TaskCycleKey> {
        let glob = NameGlob::new(task_glob);
        let cycle_glob = cycle_glob.map(NameGlob::new);
        self.pool
            .iter()
            .filter(|(k, _)| {
                self.names.get(k.task).map_or(false, |n| glob.matches(n))
                    && cycle_glob.as_ref().map_or(true, |cg| {
                        self.arena.get(k.cycle).map_or(false, |pt| cg.matches(&pt.to_string()))
                    })
            })
            .map(|(k, _)| *k)
            .collect()
    }

    fn for_matching(&mut self, task_glob: &str, cycle_glob: Option<&str>, mut f: impl FnMut(&mut TaskPool, TaskCycleKey)) {
        for key in self.matching_keys(task_glob, cycle_glob) {
            f(&mut self.pool, key);
        }
    }

    /// An exact (glob-free) hold also marks future spawns of the task,
    /// so instances in cycles not yet in the pool come up held.
    fn hold_future_spawns(&mut self, task_glob: &str, cycle_glob: Option<&str>) {
        if task_glob.contains(['*', '?']) {
            return;
        }
        let Some(task) = self.names.lookup(task_glob) else { return };
        let cycle = match cycle_glob {
            Some(c) if !c.contains(['*', '?']) => match CyclePoint::parse(c, None) {
                Ok(point) => Some(self.arena.intern(point)),
                Err(_) => return,
            },
            Some(_) => None,
            None => None,
        };
        self.pool.hold_on_spawn(task, cycle);
    }

    /// The release-side counterpart of `hold_future_spawns`.
    fn release_future_spawns(&mut self, task_glob: &str, cycle_glob: Option<&str>) {
        if task_glob.contains(['*', '?']) {
            return;
        }
        let Some(task) = self.names.lookup(task_glob) else { return };
        let cycle = match cycle_glob {
            Some(c) if !c.contains(['*', '?']) => match CyclePoint::parse(c, None) {
                Ok(point) => Some(self.arena.intern(point)),
                Err(_) => return,
            },
            _ => None,
        };
        self.pool.clear_hold_on_spawn(task, cycle);
    }

    fn trigger_matching(
        &mut self,
        task_glob: &str,
        cycle_glob: Option<&str>,
        flows: FlowSet,
        wait: bool,
    ) -> Result<(), EngineError> {
        let mut targets = self.matching_keys(task_glob, cycle_glob);
        // A trigger may name a task with no live proxy yet; an exact
        // task/cycle reference spawns one on the spot.
        if targets.is_empty() && !task_glob.contains(['*', '?']) {
            if let (Some(task), Some(cycle_str)) = (self.names.lookup(task_glob), cycle_glob) {
                if let Ok(point) = CyclePoint::parse(cycle_str, None) {
                    let cycle = self.arena.intern(point);
                    targets.push(TaskCycleKey { task, cycle });
                }
            }
        }
        for key in targets {
            self.pool.trigger(key.task, key.cycle, flows.clone(), wait, &self.graph, &mut self.arena)?;
        }
        Ok(())
    }

    /// Apply a batch of task messages: map output-labelled messages to
    /// state transitions and output completions. Messages for unknown
    /// tasks or proxies are logged and skipped; the raw event is still
    /// staged for the audit log.
    fn apply_messages(&mut self, messages: Vec<TaskMessage>, report: &mut IterationReport) -> Result<(), EngineError> {
        for msg in messages {
            let Ok(cycle_point) = CyclePoint::parse(&msg.cycle, None) else {
                warn!(cycle = %msg.cycle, task = %msg.name, "message with unparseable cycle point dropped");
                continue;
            };
            let cycle_id = self.arena.intern(cycle_point);
            let Some(task_id) = self.names.lookup(&msg.name) else {
                warn!(task = %msg.name, "message for unknown task dropped");
                continue;
            };
            let key = TaskCycleKey { task: task_id, cycle: cycle_id };
            if self.pool.get(key).is_none() {
                warn!(task = %msg.name, cycle = %msg.cycle, "message for inactive proxy dropped");
                continue;
            }

            let output = if msg.is_failed_synonym() {
                Output::Predefined(PredefinedOutput::Failed)
            } else {
                Output::parse(&msg.text)
            };

            if let Some(state) = state_for_output(&output) {
                if let Some(proxy) = self.pool.get_mut(key) {
                    if proxy.transition(state) {
                        report.transitions += 1;
                        report.events.push((
                            EventKind::StateTransition,
                            serde_json::json!({ "cycle": msg.cycle, "name": msg.name, "state": state.as_str() }),
                        ));
                    }
                }
            }

            report.events.push((
                EventKind::OutputCompleted,
                serde_json::json!({ "cycle": msg.cycle, "name": msg.name, "output": output.to_string() }),
            ));
            let spawned = self.pool.complete_output(key, output, &self.graph, &mut self.arena)?;
            report.spawned.extend(spawned);
        }
        Ok(())
    }

    /// The runahead horizon: the oldest incomplete cycle plus the
    /// runahead limit. Proxies beyond it are not considered in the
    /// readiness scan, and parentless seeding never crosses it.
    pub fn runahead_horizon(&self) -> Option<CyclePoint> {
        let oldest_id = self.pool.oldest_incomplete_cycle(&self.arena)?;
        let oldest = self.arena.get(oldest_id)?;
        cycle::add(oldest, &self.runahead_limit).ok()
    }

    /// Readiness scan: every `waiting` proxy within the runahead horizon,
    /// not held, retry gate elapsed, external triggers satisfied, and
    /// prerequisites true.
    fn readiness_scan(&self) -> Vec<TaskCycleKey> {
        let horizon = self.runahead_horizon();
        self.pool
            .iter()
            .filter(|(k, p)| {
                p.is_ready()
                    && horizon
                        .and_then(|h| self.arena.get(k.cycle).map(|pt| *pt <= h))
                        .unwrap_or(true)
            })
            .map(|(k, _)| *k)
            .collect()
    }

    /// Run one iteration: drain commands and messages in that priority
    /// order, advance parentless seeding within the runahead window, and
    /// promote ready proxies to `preparing`. Queue caps, submission, and
    /// the snapshot flush are the caller's half of the loop.
    pub fn iterate(
        &mut self,
        commands: Vec<CommandEnvelope>,
        messages: Vec<TaskMessage>,
    ) -> Result<IterationReport, EngineError> {
        self.iteration_seq += 1;
        let mut report = IterationReport::default();
        self.apply_commands(commands, &mut report)?;
        self.apply_messages(messages, &mut report)?;
        self.advance_parentless(&mut report)?;

        if !self.paused {
            for key in self.readiness_scan() {
                if let Some(proxy) = self.pool.get_mut(key) {
                    if proxy.transition(TaskState::Preparing) {
                        report.transitions += 1;
                    }
                }
            }
        }

        if report.transitions > 0 || !report.spawned.is_empty() {
            self.last_transition_at = Instant::now();
        }

        report.stalled = self.check_stall();
        if report.stalled {
            warn!(iteration = self.iteration_seq, "scheduler stalled");
        }
        if self.pool.is_empty() && self.seeding_exhausted() && !self.seed_cursors.is_empty() {
            self.request_shutdown(ShutdownReason::Completed);
        }
        report.reload_requested = std::mem::take(&mut self.reload_requested);
        debug!(iteration = self.iteration_seq, transitions = report.transitions, "iteration complete");
        Ok(report)
    }

    fn check_stall(&self) -> bool {
        let incomplete = self.pool.iter().any(|(_, p)| !p.state.is_terminal());
        incomplete && self.last_transition_at.elapsed() >= self.stall_timeout
    }

    /// Rebuild the live pool from the snapshot's `task_pool` rows after a
    /// restart, re-applying each proxy's recorded outputs
    /// (`task_outputs`) and prerequisite satisfaction
    /// (`task_prerequisites`). Rows naming tasks or cycle points the
    /// current configuration no longer knows are skipped with a warning.
    /// Returns the number of proxies restored.
    pub fn restore_from_snapshot(
        &mut self,
        rows: &[crate::db::TaskPoolRow],
        output_rows: &[crate::db::TaskOutputsRow],
        prereq_rows: &[crate::db::TaskPrereqRow],
    ) -> usize {
        let mut outputs_by_key: HashMap<(&str, &str), &str> = HashMap::new();
        for row in output_rows {
            outputs_by_key.insert((row.cycle.as_str(), row.name.as_str()), row.outputs.as_str());
        }
        let mut prereqs_by_key: HashMap<(&str, &str), Vec<&crate::db::TaskPrereqRow>> = HashMap::new();
        for row in prereq_rows {
            prereqs_by_key
                .entry((row.cycle.as_str(), row.name.as_str()))
                .or_default()
                .push(row);
        }

        let mut restored = 0;
        for row in rows {
            let Some(task) = self.names.lookup(&row.name) else {
                warn!(task = %row.name, "snapshot row for unknown task skipped");
                continue;
            };
            let Ok(point) = CyclePoint::parse(&row.cycle, None) else {
                warn!(cycle = %row.cycle, "snapshot row with unparseable cycle skipped");
                continue;
            };
            let (Some(flows), Some(state)) = (FlowSet::parse(&row.flow_nums), TaskState::parse(&row.status))
            else {
                warn!(task = %row.name, cycle = %row.cycle, "snapshot row with unparseable flows or status skipped");
                continue;
            };
            let cycle = self.arena.intern(point);
            let mut prereqs = self
                .graph
                .parents(task, cycle, &mut self.arena)
                .unwrap_or(crate::domain::prerequisite::PrereqExpr::All(vec![]));
            for prereq in prereqs_by_key.get(&(row.cycle.as_str(), row.name.as_str())).into_iter().flatten() {
                if !prereq.satisfied {
                    continue;
                }
                let Some(upstream) = self.names.lookup(&prereq.prereq_name) else { continue };
                let Ok(upstream_point) = CyclePoint::parse(&prereq.prereq_cycle, None) else { continue };
                let upstream_cycle = self.arena.intern(upstream_point);
                prereqs.satisfy(upstream, upstream_cycle, &Output::parse(&prereq.prereq_output));
            }

            let mut proxy = crate::domain::TaskProxy::new(task, cycle, flows, prereqs);
            proxy.held = row.is_held;
            if let Some(outputs_json) = outputs_by_key.get(&(row.cycle.as_str(), row.name.as_str())) {
                match serde_json::from_str::<Vec<String>>(outputs_json) {
                    Ok(names) => {
                        for output in names {
                            proxy.complete_output(Output::parse(&output));
                        }
                    }
                    Err(e) => {
                        warn!(task = %row.name, cycle = %row.cycle, error = %e, "unparseable outputs row skipped")
                    }
                }
            }
            // An interrupted submission restarts from scratch; everything
            // else resumes where the snapshot left it.
            proxy.state = match state {
                TaskState::Preparing => TaskState::Waiting,
                other => other,
            };
            self.pool.restore(proxy);
            restored += 1;
        }
        // Catch the seed cursors up past every cycle already represented
        // in the pool, so restored instances are not spawned twice.
        let ids: Vec<TaskId> = self.seed_cursors.keys().copied().collect();
        for id in ids {
            let newest = self
                .pool
                .iter()
                .filter(|(k, _)| k.task == id)
                .filter_map(|(k, _)| self.arena.get(k.cycle).copied())
                .fold(None::<CyclePoint>, |acc, p| match acc {
                    Some(a) if a >= p => Some(a),
                    _ => Some(p),
                });
            if let Some(newest) = newest {
                if let Ok(next) = self.next_recurrence_point(id, &newest) {
                    self.seed_cursors.insert(id, next);
                }
            }
        }
        restored
    }

    /// Rebuild the broadcast overlay from the `broadcast_states` table.
    pub fn restore_broadcasts(&mut self, rows: &[crate::db::BroadcastStateRow]) {
        for row in rows {
            let point = if row.point == "*" { None } else { Some(row.point.clone()) };
            self.broadcast.set(
                crate::broadcast::BroadcastTarget {
                    point,
                    namespace: row.namespace.clone(),
                    key: row.key.clone(),
                },
                row.value.clone(),
            );
        }
    }

    /// Re-install hold-on-spawn marks from the `tasks_to_hold` table.
    pub fn restore_holds(&mut self, rows: &[crate::db::HoldRow]) {
        for row in rows {
            let Some(task) = self.names.lookup(&row.name) else { continue };
            let cycle = if row.cycle == "*" {
                None
            } else {
                match CyclePoint::parse(&row.cycle, None) {
                    Ok(point) => Some(self.arena.intern(point)),
                    Err(_) => continue,
                }
            };
            self.pool.hold_on_spawn(task, cycle);
        }
    }

    /// Re-apply external triggers already received: refill the signature
    /// table and satisfy any restored proxy still gated on one.
    pub fn restore_xtriggers(&mut self, rows: &[crate::db::XtriggerRow]) {
        for row in rows {
            self.xtriggers.insert(row.signature.clone(), row.results.clone());
            for key in self.all_keys() {
                if let Some(proxy) = self.pool.get_mut(key) {
                    proxy.satisfy_ext_trigger(&row.signature);
                }
            }
        }
    }

    /// Remember the flow labels of previous runs so freshly allocated
    /// ones never collide.
    pub fn restore_flows(&mut self, rows: &[crate::db::FlowRow]) {
        for row in rows {
            self.max_flow_num = self.max_flow_num.max(row.flow_num.max(0) as u32);
        }
    }

    /// Re-apply one event-log record newer than the snapshot. State and
    /// output events replay onto the restored pool; broadcast events
    /// rebuild the overlay; command records are audit-only (their effects
    /// are captured by the state events they produced).
    pub fn apply_replay(&mut self, record: &crate::db::EventRecord) -> Result<(), EngineError> {
        let payload = &record.payload;
        let lookup = |s: &Self, payload: &serde_json::Value| -> Option<TaskCycleKey> {
            let name = payload.get("name")?.as_str()?;
            let cycle = payload.get("cycle")?.as_str()?;
            let task = s.names.lookup(name)?;
            let point = CyclePoint::parse(cycle, None).ok()?;
            Some(TaskCycleKey { task, cycle: s.arena.lookup(&point)? })
        };
        match record.kind {
            EventKind::StateTransition => {
                if let (Some(key), Some(state)) = (
                    lookup(self, payload),
                    payload.get("state").and_then(|s| s.as_str()).and_then(TaskState::parse),
                ) {
                    if let Some(proxy) = self.pool.get_mut(key) {
                        proxy.transition(state);
                    }
                }
            }
            EventKind::OutputCompleted => {
                if let (Some(key), Some(output)) =
                    (lookup(self, payload), payload.get("output").and_then(|o| o.as_str()))
                {
                    if self.pool.get(key).is_some() {
                        let output = Output::parse(output);
                        self.pool.complete_output(key, output, &self.graph, &mut self.arena)?;
                    }
                }
            }
            EventKind::BroadcastChange => {
                let point = payload.get("point").and_then(|p| p.as_str()).map(str::to_string);
                let namespace = payload.get("namespace").and_then(|n| n.as_str()).map(str::to_string);
                match payload.get("change").and_then(|c| c.as_str()) {
                    Some("set") => {
                        if let (Some(namespace), Some(key), Some(value)) = (
                            namespace,
                            payload.get("key").and_then(|k| k.as_str()),
                            payload.get("value").and_then(|v| v.as_str()),
                        ) {
                            self.broadcast.set(
                                crate::broadcast::BroadcastTarget {
                                    point,
                                    namespace,
                                    key: key.to_string(),
                                },
                                value.to_string(),
                            );
                        }
                    }
                    Some("cancel") => {
                        if let (Some(namespace), Some(key)) =
                            (namespace, payload.get("key").and_then(|k| k.as_str()))
                        {
                            self.broadcast.cancel(&crate::broadcast::BroadcastTarget {
                                point,
                                namespace,
                                key: key.to_string(),
                            });
                        }
                    }
                    Some("clear") => {
                        self.broadcast.clear(point.as_deref(), namespace.as_deref());
                    }
                    _ => {}
                }
            }
            EventKind::Command => {}
        }
        Ok(())
    }
}

fn state_for_output(output: &Output) -> Option<TaskState> {
    match output {
        Output::Predefined(PredefinedOutput::Submitted) => Some(TaskState::Submitted),
        Output::Predefined(PredefinedOutput::Started) => Some(TaskState::Running),
        Output::Predefined(PredefinedOutput::Succeeded) => Some(TaskState::Succeeded),
        Output::Predefined(PredefinedOutput::Failed) => Some(TaskState::Failed),
        Output::Predefined(PredefinedOutput::SubmitFailed) => Some(TaskState::SubmitFailed),
        Output::Predefined(PredefinedOutput::Expired) => Some(TaskState::Expired),
        Output::Custom(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        let graph = Graph::new(None);
        Scheduler::new(graph, CycleDuration::Integer(2), Duration::from_secs(60))
    }

    #[test]
    fn runahead_horizon_tracks_oldest_incomplete_cycle() {
        let mut s = scheduler();
        let foo = s.names.intern("foo");
        let c1 = s.arena.intern(CyclePoint::Integer(1));
        s.pool.spawn(foo, c1, FlowSet::single(1), &s.graph, &mut s.arena).unwrap();
        assert_eq!(s.runahead_horizon(), Some(CyclePoint::Integer(3)));
    }

    #[test]
    fn stall_is_not_reported_when_pool_is_empty_of_incomplete_work() {
        let s = scheduler();
        assert!(!s.check_stall());
    }

    #[test]
    fn stop_now_now_overwrites_any_pending_request() {
        let mut s = scheduler();
        s.request_shutdown(ShutdownReason::Graceful);
        s.request_shutdown(ShutdownReason::NowNow);
        assert_eq!(s.shutdown_reason(), Some(ShutdownReason::NowNow));
    }

    #[test]
    fn hold_command_matches_by_interned_task_name() {
        let mut s = scheduler();
        let foo = s.names.intern("foo");
        let c1 = s.arena.intern(CyclePoint::Integer(1));
        s.pool.spawn(foo, c1, FlowSet::single(1), &s.graph, &mut s.arena).unwrap();

        s.iterate(
            vec![CommandEnvelope {
                idempotency_key: "k1".to_string(),
                command: Command::Hold { task_glob: "foo".to_string(), cycle_glob: None },
            }],
            Vec::new(),
        )
        .unwrap();

        let key = TaskCycleKey { task: foo, cycle: c1 };
        assert!(s.pool.get(key).unwrap().held);
    }

    #[test]
    fn pause_blocks_readiness_until_play() {
        let mut s = scheduler();
        let foo = s.names.intern("foo");
        let c1 = s.arena.intern(CyclePoint::Integer(1));
        s.pool.spawn(foo, c1, FlowSet::single(1), &s.graph, &mut s.arena).unwrap();
        let key = TaskCycleKey { task: foo, cycle: c1 };

        let pause = CommandEnvelope { idempotency_key: "p1".into(), command: Command::Pause };
        s.iterate(vec![pause], Vec::new()).unwrap();
        assert_eq!(s.pool.get(key).unwrap().state, TaskState::Waiting);

        let play = CommandEnvelope { idempotency_key: "p2".into(), command: Command::Play };
        s.iterate(vec![play], Vec::new()).unwrap();
        assert_eq!(s.pool.get(key).unwrap().state, TaskState::Preparing);
    }

    #[test]
    fn immediate_stop_drops_pending_reload() {
        let mut s = scheduler();
        let reload = CommandEnvelope { idempotency_key: "r1".into(), command: Command::Reload };
        let stop = CommandEnvelope {
            idempotency_key: "s1".into(),
            command: Command::Stop { mode: crate::commands::StopMode::NowNow, kill: false },
        };
        let report = s.iterate(vec![reload, stop], Vec::new()).unwrap();
        assert!(!report.reload_requested);
        assert_eq!(s.shutdown_reason(), Some(ShutdownReason::NowNow));
    }

    #[test]
    fn set_output_completes_and_spawns_downstream() {
        let mut graph = Graph::new(None);
        let mut names = NameArena::new();
        let foo = names.intern("foo");
        let bar = names.intern("bar");
        graph.add_edge(crate::graph::Edge {
            lhs: foo,
            lhs_output: Output::Predefined(PredefinedOutput::Succeeded),
            lhs_offset: None,
            lhs_absolute_initial: false,
            rhs: bar,
        });
        let mut s = Scheduler::with_names(graph, names, CycleDuration::Integer(2), Duration::from_secs(60));
        let c1 = s.arena.intern(CyclePoint::Integer(1));
        s.pool.spawn(foo, c1, FlowSet::single(1), &s.graph, &mut s.arena).unwrap();

        let set = CommandEnvelope {
            idempotency_key: "set1".into(),
            command: Command::Set {
                task_glob: "foo".to_string(),
                cycle_glob: Some("1".to_string()),
                outputs: vec!["succeeded".to_string()],
                prereqs: Vec::new(),
            },
        };
        let report = s.iterate(vec![set], Vec::new()).unwrap();

        let foo_key = TaskCycleKey { task: foo, cycle: c1 };
        let bar_key = TaskCycleKey { task: bar, cycle: c1 };
        assert_eq!(s.pool.get(foo_key).unwrap().state, TaskState::Succeeded);
        assert!(report.spawned.contains(&bar_key));
    }

    #[test]
    fn parentless_seeding_respects_runahead_and_stop_point() {
        let graph = Graph::new(None);
        let mut names = NameArena::new();
        let foo = names.intern("foo");
        let mut s = Scheduler::with_names(graph, names, CycleDuration::Integer(2), Duration::from_secs(60));
        s.stop_after = Some(CyclePoint::Integer(20));

        let recurrence = crate::cycle::Recurrence::new(
            CyclePoint::Integer(1),
            CycleDuration::Integer(0),
            CycleDuration::Integer(1),
            None,
        )
        .unwrap();
        let def = TaskDefinition::new("foo", "false", crate::domain::PlatformSelector::Named("localhost".into()))
            .with_recurrence(recurrence);
        s.set_definitions(BTreeMap::from([(foo, def)]));
        s.seed().unwrap();

        // First iteration establishes the horizon with cycle 1; the next
        // fills the window up to 1 + runahead.
        s.iterate(Vec::new(), Vec::new()).unwrap();
        s.iterate(Vec::new(), Vec::new()).unwrap();
        let cycles: Vec<i64> = s
            .pool
            .iter()
            .filter_map(|(k, _)| match s.arena.get(k.cycle) {
                Some(CyclePoint::Integer(n)) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(cycles.iter().max(), Some(&3));
        assert_eq!(s.pool.len(), 3);
    }
}
