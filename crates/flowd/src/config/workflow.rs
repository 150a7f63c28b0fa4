//! Static workflow configuration: the YAML shape users author (task
//! definitions, graph edges, platforms, named queues), and its expansion
//! into the core's runtime structures. Parsing and template expansion of
//! the file itself lives in [`super::loader`]; this module owns only the
//! schema and the build step that turns it into a [`Graph`], [`NameArena`]
//! and task-definition table.

use crate::cycle::{Calendar, CycleDuration, CyclePoint, CycleError, Recurrence};
use crate::domain::{Output, PlatformSelector, TaskDefinition, TaskId};
use crate::engine::QueueConfig;
use crate::graph::{Edge, Graph, GraphError, NameArena};
use crate::jobs::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("graph edge references undefined task {0:?}")]
    UndefinedTask(String),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// One `lhs[offset]:output => rhs` line of the graph section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub lhs: String,
    #[serde(default = "default_output")]
    pub lhs_output: String,
    /// A signed cycle-duration offset on the left-hand side (`-P1D`,
    /// `-P1`, ...), or absent for a same-cycle dependency.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lhs_offset: Option<String>,
    /// Whether `lhs` is an absolute reference to the workflow's initial
    /// cycle point (`foo[^]`) rather than an offset from `rhs`.
    #[serde(default)]
    pub lhs_absolute_initial: bool,
    pub rhs: String,
}

fn default_output() -> String {
    "succeeded".to_string()
}

/// One recurrence of a task definition: `start/offset` step forward by
/// `period` until `stop`, if bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceSpec {
    pub start: String,
    #[serde(default)]
    pub offset: Option<String>,
    pub period: String,
    #[serde(default)]
    pub stop: Option<String>,
}

impl RecurrenceSpec {
    fn build(&self, calendar: Option<Calendar>) -> Result<Recurrence, ConfigError> {
        let initial = CyclePoint::parse(&self.start, calendar)?;
        let offset = match &self.offset {
            Some(s) => CycleDuration::parse(s)?,
            // A zero offset of the same cycling kind as the start point.
            None => match initial {
                CyclePoint::Integer(_) => CycleDuration::Integer(0),
                CyclePoint::DateTime(_) => CycleDuration::Calendar(Default::default()),
            },
        };
        let period = CycleDuration::parse(&self.period)?;
        let stop = self.stop.as_deref().map(|s| CyclePoint::parse(s, calendar)).transpose()?;
        Ok(Recurrence::new(initial, offset, period, stop)?)
    }
}

/// A task definition as authored in configuration, mirroring
/// [`TaskDefinition`] but with durations as ISO-8601-ish strings and no
/// resolved [`TaskId`] yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub platform: PlatformSelector,
    #[serde(default)]
    pub retry_delays: Vec<u64>,
    #[serde(default)]
    pub submission_retry_delays: Vec<u64>,
    #[serde(default)]
    pub execution_time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub submission_time_limit_seconds: Option<u64>,
    #[serde(default)]
    pub event_handlers: BTreeMap<String, Vec<String>>,
    /// Outputs beyond the six predefined ones, and whether each is
    /// required for completion.
    #[serde(default)]
    pub custom_outputs: BTreeMap<String, bool>,
    /// External trigger names instances of this task wait on before
    /// running; satisfied by the `ext-trigger` command.
    #[serde(default)]
    pub ext_triggers: Vec<String>,
    pub recurrences: Vec<RecurrenceSpec>,
}

impl TaskSpec {
    fn build(&self, calendar: Option<Calendar>) -> Result<TaskDefinition, ConfigError> {
        let mut def = TaskDefinition::new(self.name.clone(), self.script.clone(), self.platform.clone());
        def.environment = self.environment.clone();
        def.retry_delays = self.retry_delays.iter().map(|s| Duration::from_secs(*s)).collect();
        def.submission_retry_delays =
            self.submission_retry_delays.iter().map(|s| Duration::from_secs(*s)).collect();
        def.execution_time_limit = self.execution_time_limit_seconds.map(Duration::from_secs);
        def.submission_time_limit = self.submission_time_limit_seconds.map(Duration::from_secs);
        def.event_handlers = self.event_handlers.clone();
        for (name, required) in &self.custom_outputs {
            def.outputs.declare(Output::Custom(name.clone()), *required);
        }
        def.ext_triggers = self.ext_triggers.clone();
        for r in &self.recurrences {
            def.recurrences.push(r.build(calendar)?);
        }
        Ok(def)
    }
}

/// A named queue's member set and concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub members: HashSet<String>,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
}

/// Network-facing settings: the bind address and shared secret installed
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub bind_addr: String,
    pub shared_secret: String,
}

/// The root of a workflow's static configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default)]
    pub initial_cycle_point: Option<String>,
    #[serde(default)]
    pub stop_after_cycle_point: Option<String>,
    pub runahead_limit: String,
    #[serde(default = "default_stall_timeout_seconds")]
    pub stall_timeout_seconds: u64,
    /// Shell templates fired when the workflow stalls.
    #[serde(default)]
    pub stall_handlers: Vec<String>,
    /// Whether a stall shuts the scheduler down after its handlers fire.
    #[serde(default)]
    pub abort_on_stall: bool,
    #[serde(default = "default_bad_host_retention_seconds")]
    pub bad_host_retention_seconds: u64,
    /// Concurrent event handlers allowed at once.
    #[serde(default = "default_process_pool_size")]
    pub process_pool_size: usize,
    /// Per-handler timeout in seconds.
    #[serde(default = "default_process_pool_timeout_seconds")]
    pub process_pool_timeout_seconds: u64,
    pub tasks: Vec<TaskSpec>,
    pub graph: Vec<EdgeSpec>,
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    pub server: ServerSpec,
}

fn default_stall_timeout_seconds() -> u64 {
    3600
}

fn default_bad_host_retention_seconds() -> u64 {
    300
}

fn default_process_pool_size() -> usize {
    8
}

fn default_process_pool_timeout_seconds() -> u64 {
    60
}

/// Everything a [`crate::engine::Scheduler`] needs, expanded from a
/// [`WorkflowConfig`].
pub struct BuiltWorkflow {
    pub graph: Graph,
    pub names: NameArena,
    pub task_definitions: BTreeMap<TaskId, TaskDefinition>,
    pub runahead_limit: CycleDuration,
    pub stall_timeout: Duration,
    pub stall_handlers: Vec<String>,
    pub abort_on_stall: bool,
    pub stop_after: Option<CyclePoint>,
    pub platforms: Vec<Platform>,
    pub queues: Vec<QueueConfig>,
    pub bad_host_retention: Duration,
    pub process_pool_size: usize,
    pub process_pool_timeout: Duration,
    pub server: ServerSpec,
}

impl WorkflowConfig {
    /// Expand this configuration into the structures the scheduler loop
    /// operates on: intern every task name, build the graph's edges, and
    /// resolve each task's recurrences.
    pub fn build(&self) -> Result<BuiltWorkflow, ConfigError> {
        self.build_into(NameArena::new())
    }

    /// Expand against an existing name arena, so a reload keeps every
    /// already-interned `TaskId` stable while new tasks extend the
    /// table.
    pub fn build_into(&self, mut names: NameArena) -> Result<BuiltWorkflow, ConfigError> {
        let calendar = None;
        let initial_point = self.initial_cycle_point.as_deref().map(|s| CyclePoint::parse(s, calendar)).transpose()?;

        for task in &self.tasks {
            names.intern(&task.name);
        }

        let mut graph = Graph::new(initial_point);
        for edge in &self.graph {
            let lhs = names.lookup(&edge.lhs).ok_or_else(|| ConfigError::UndefinedTask(edge.lhs.clone()))?;
            let rhs = names.lookup(&edge.rhs).ok_or_else(|| ConfigError::UndefinedTask(edge.rhs.clone()))?;
            let lhs_offset = edge.lhs_offset.as_deref().map(CycleDuration::parse).transpose()?;
            graph.add_edge(Edge {
                lhs,
                lhs_output: Output::parse(&edge.lhs_output),
                lhs_offset,
                lhs_absolute_initial: edge.lhs_absolute_initial,
                rhs,
            });
        }

        let mut task_definitions = BTreeMap::new();
        for task in &self.tasks {
            let id = names.lookup(&task.name).expect("just interned");
            task_definitions.insert(id, task.build(calendar)?);
        }

        let queues = self
            .queues
            .iter()
            .map(|q| QueueConfig { name: q.name.clone(), members: q.members.clone(), concurrency_limit: q.concurrency_limit })
            .collect();

        let stop_after = self.stop_after_cycle_point.as_deref().map(|s| CyclePoint::parse(s, calendar)).transpose()?;

        Ok(BuiltWorkflow {
            graph,
            names,
            task_definitions,
            runahead_limit: CycleDuration::parse(&self.runahead_limit)?,
            stall_timeout: Duration::from_secs(self.stall_timeout_seconds),
            stall_handlers: self.stall_handlers.clone(),
            abort_on_stall: self.abort_on_stall,
            stop_after,
            platforms: self.platforms.clone(),
            queues,
            bad_host_retention: Duration::from_secs(self.bad_host_retention_seconds),
            process_pool_size: self.process_pool_size,
            process_pool_timeout: Duration::from_secs(self.process_pool_timeout_seconds),
            server: self.server.clone(),
        })
    }
}
