//! The scheduler's data model: task definitions, outputs, prerequisites,
//! flows, and task proxies.

pub mod flow;
pub mod output;
pub mod prerequisite;
pub mod proxy;
pub mod task_def;

pub use flow::FlowSet;
pub use output::{Output, OutputSet, PredefinedOutput};
pub use prerequisite::{PrereqAtom, PrereqExpr};
pub use proxy::{TaskProxy, TaskState};
pub use task_def::{PlatformSelector, TaskDefinition};

/// Interned handle for a task name. The pool and graph key everything by
/// these small integers instead of owned name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TaskId(pub u32);

/// Interned handle for a cycle point (paired with the arena that produced
/// it; stored alongside a `CyclePoint` in the graph's index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CycleId(pub u32);

/// A `(task, cycle)` pair: the key under which a task proxy lives in the
/// pool. Proxies with overlapping flow-sets at the same key are merged,
/// so the key alone identifies at most one live proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskCycleKey {
    pub task: TaskId,
    pub cycle: CycleId,
}
