//! Task pool: the in-memory set of active task proxies, with
//! spawn-on-demand semantics driven by flow-sets.

mod glob;

pub use glob::NameGlob;

use crate::domain::flow::FlowSet;
use crate::domain::output::{Output, OutputSet};
use crate::domain::proxy::{TaskProxy, TaskState};
use crate::domain::{CycleId, TaskCycleKey, TaskId};
use crate::graph::{CycleArena, Graph, GraphError};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no proxy for key {0:?}")]
    NotFound(TaskCycleKey),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Outcome of `spawn`: either a brand-new proxy or a merge into one that
/// already occupied the `(task, cycle)` slot.
pub enum SpawnOutcome {
    Created(TaskCycleKey),
    MergedInto(TaskCycleKey),
}

/// The live set of task proxies, keyed by `(task, cycle)`. No two proxies
/// share a `(task-name, cycle-point, flow-set)` simultaneously — proxies
/// with non-disjoint flow-sets at the same key are merged, so the key
/// alone is a valid map index.
#[derive(Default)]
pub struct TaskPool {
    proxies: HashMap<TaskCycleKey, TaskProxy>,
    /// Task names marked to hold on spawn, independent of any live proxy.
    hold_on_spawn: Vec<(TaskId, Option<CycleId>)>,
    /// External trigger names each task's instances must wait on, loaded
    /// once from the workflow definition.
    ext_trigger_defs: HashMap<TaskId, Vec<String>>,
    /// Each task's declared output set, consulted when evaluating a
    /// proxy's completion expression.
    output_defs: HashMap<TaskId, OutputSet>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the per-task external-trigger declarations consulted on
    /// every spawn.
    pub fn set_ext_trigger_defs(&mut self, defs: HashMap<TaskId, Vec<String>>) {
        self.ext_trigger_defs = defs;
    }

    /// Install the per-task declared output sets used to evaluate
    /// completion.
    pub fn set_output_defs(&mut self, defs: HashMap<TaskId, OutputSet>) {
        self.output_defs = defs;
    }

    /// Whether the proxy's completion expression holds: every required
    /// output of its task's declared set is recorded. Tasks with no
    /// installed declaration fall back to the `succeeded` output.
    pub fn completion_satisfied(&self, key: TaskCycleKey) -> bool {
        let Some(proxy) = self.proxies.get(&key) else { return false };
        match self.output_defs.get(&key.task) {
            Some(set) => set.is_complete(&proxy.outputs_completed),
            None => proxy
                .outputs_completed
                .contains(&Output::Predefined(crate::domain::output::PredefinedOutput::Succeeded)),
        }
    }

    pub fn get(&self, key: TaskCycleKey) -> Option<&TaskProxy> {
        self.proxies.get(&key)
    }

    pub fn get_mut(&mut self, key: TaskCycleKey) -> Option<&mut TaskProxy> {
        self.proxies.get_mut(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskCycleKey, &TaskProxy)> {
        self.proxies.iter()
    }

    pub fn iter_by_state<'a>(
        &'a self,
        state: TaskState,
    ) -> impl Iterator<Item = (&'a TaskCycleKey, &'a TaskProxy)> {
        self.proxies.iter().filter(move |(_, p)| p.state == state)
    }

    /// Spawn a proxy for `(task, cycle)` under `flows`, or merge into one
    /// that already occupies the slot. Idempotent: an existing proxy
    /// absorbs the new flow-set by union; otherwise a fresh proxy is
    /// created with its prerequisites resolved from the graph.
    pub fn spawn(
        &mut self,
        task: TaskId,
        cycle: CycleId,
        flows: FlowSet,
        graph: &Graph,
        arena: &mut CycleArena,
    ) -> Result<SpawnOutcome, PoolError> {
        let key = TaskCycleKey { task, cycle };
        let held = self.should_hold(task, cycle);

        if let Some(existing) = self.proxies.get_mut(&key) {
            existing.flows.merge(&flows);
            return Ok(SpawnOutcome::MergedInto(key));
        }

        let prereqs = graph.parents(task, cycle, arena)?;
        let mut proxy = TaskProxy::new(task, cycle, flows, prereqs);
        proxy.held = held;
        if let Some(triggers) = self.ext_trigger_defs.get(&task) {
            for name in triggers {
                proxy.ext_triggers.insert(name.clone(), false);
            }
        }
        self.proxies.insert(key, proxy);
        Ok(SpawnOutcome::Created(key))
    }

    /// Re-insert a proxy reconstructed from the snapshot tables during
    /// restart, bypassing the graph lookup its original spawn performed.
    pub fn restore(&mut self, proxy: TaskProxy) {
        let key = TaskCycleKey { task: proxy.task, cycle: proxy.cycle };
        self.proxies.insert(key, proxy);
    }

    fn should_hold(&self, task: TaskId, cycle: CycleId) -> bool {
        self.hold_on_spawn.iter().any(|(t, c)| *t == task && c.map_or(true, |c| c == cycle))
    }

    /// Set one prerequisite atom satisfied; returns true if the proxy's
    /// full prerequisite now holds.
    pub fn satisfy(
        &mut self,
        key: TaskCycleKey,
        source: TaskId,
        source_cycle: CycleId,
        output: &Output,
    ) -> Result<bool, PoolError> {
        let proxy = self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?;
        proxy.prerequisites.satisfy(source, source_cycle, output);
        Ok(proxy.prerequisites.is_satisfied())
    }

    /// Mark an output complete, spawn downstream children that become
    /// reachable, and satisfy their matching prerequisite atoms. A proxy
    /// triggered with `--wait` records the output but defers the spawning
    /// half until `spawn_deferred` runs at release time.
    pub fn complete_output(
        &mut self,
        key: TaskCycleKey,
        output: Output,
        graph: &Graph,
        arena: &mut CycleArena,
    ) -> Result<Vec<TaskCycleKey>, PoolError> {
        let (deferred, newly_recorded) = {
            let proxy = self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?;
            (proxy.defer_downstream, proxy.complete_output(output.clone()))
        };
        if !newly_recorded || deferred {
            return Ok(Vec::new());
        }
        self.spawn_children_for(key, &output, graph, arena)
    }

    fn spawn_children_for(
        &mut self,
        key: TaskCycleKey,
        output: &Output,
        graph: &Graph,
        arena: &mut CycleArena,
    ) -> Result<Vec<TaskCycleKey>, PoolError> {
        let flows = self.proxies.get(&key).ok_or(PoolError::NotFound(key))?.flows.clone();
        let mut spawned = Vec::new();
        for (child_task, child_cycle, child_output) in graph.children(key.task, key.cycle, arena)? {
            let fires = self
                .proxies
                .get(&key)
                .map(|p| p.fires_trigger(output, &child_output))
                .unwrap_or(false);
            if !fires {
                continue;
            }
            match self.spawn(child_task, child_cycle, flows.clone(), graph, arena)? {
                SpawnOutcome::Created(k) => spawned.push(k),
                SpawnOutcome::MergedInto(k) => spawned.push(k),
            }
            let child_key = TaskCycleKey { task: child_task, cycle: child_cycle };
            self.satisfy(child_key, key.task, key.cycle, &child_output)?;
        }
        Ok(spawned)
    }

    /// Spawn the downstream children deferred by a `--wait` trigger, one
    /// pass over every output the proxy recorded while deferred. Clears
    /// the defer flag.
    pub fn spawn_deferred(
        &mut self,
        key: TaskCycleKey,
        graph: &Graph,
        arena: &mut CycleArena,
    ) -> Result<Vec<TaskCycleKey>, PoolError> {
        let outputs = {
            let proxy = self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?;
            if !proxy.defer_downstream {
                return Ok(Vec::new());
            }
            proxy.defer_downstream = false;
            proxy.outputs_completed.iter().cloned().collect::<Vec<_>>()
        };
        let mut spawned = Vec::new();
        for output in outputs {
            spawned.extend(self.spawn_children_for(key, &output, graph, arena)?);
        }
        Ok(spawned)
    }

    /// Whether the proxy at `key` is safe to drop from the live window:
    /// its state is terminal, it is not still holding deferred downstream
    /// spawns, and its completion expression holds (an `expired` proxy is
    /// removable without it, since it never ran). A terminal proxy whose
    /// required outputs are missing is retained as incomplete, which is
    /// what the stall detector keys on. Downstream-consumption
    /// bookkeeping lives in the scheduler loop, which calls `remove` once
    /// it has confirmed no pending consumer remains.
    pub fn is_removable(&self, key: TaskCycleKey) -> bool {
        let Some(proxy) = self.proxies.get(&key) else { return false };
        if !proxy.state.is_terminal() || proxy.defer_downstream {
            return false;
        }
        proxy.state == TaskState::Expired || self.completion_satisfied(key)
    }

    pub fn remove(&mut self, key: TaskCycleKey) -> Option<TaskProxy> {
        self.proxies.remove(&key)
    }

    /// Remove semantics: set flow-set to `{}`, clear unsatisfied
    /// prerequisites of the target itself, and remove it. Clearing
    /// dependents' prerequisites is the caller's responsibility, since it
    /// requires walking the graph's children.
    pub fn remove_with_flow_clear(&mut self, key: TaskCycleKey) -> Option<TaskProxy> {
        if let Some(proxy) = self.proxies.get_mut(&key) {
            proxy.flows.clear_to_no_flow();
        }
        self.proxies.remove(&key)
    }

    pub fn hold(&mut self, key: TaskCycleKey) -> Result<(), PoolError> {
        self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?.held = true;
        Ok(())
    }

    pub fn release(&mut self, key: TaskCycleKey) -> Result<(), PoolError> {
        self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?.held = false;
        Ok(())
    }

    pub fn hold_on_spawn(&mut self, task: TaskId, cycle: Option<CycleId>) {
        if !self.hold_on_spawn.contains(&(task, cycle)) {
            self.hold_on_spawn.push((task, cycle));
        }
    }

    /// Drop any hold-on-spawn mark covering `(task, cycle)`; a `None`
    /// cycle drops every mark for the task.
    pub fn clear_hold_on_spawn(&mut self, task: TaskId, cycle: Option<CycleId>) {
        self.hold_on_spawn.retain(|(t, c)| {
            *t != task || cycle.map_or(false, |cycle| c.map_or(true, |c| c != cycle))
        });
    }

    /// The current hold-on-spawn marks, for the snapshot flush.
    pub fn hold_marks(&self) -> &[(TaskId, Option<CycleId>)] {
        &self.hold_on_spawn
    }

    /// Force the proxy ready regardless of prerequisites. Creates the
    /// proxy first via `spawn` if it does not exist, then clears its
    /// prerequisite expression. With `wait`, downstream spawning is
    /// deferred until an explicit release.
    pub fn trigger(
        &mut self,
        task: TaskId,
        cycle: CycleId,
        flows: FlowSet,
        wait: bool,
        graph: &Graph,
        arena: &mut CycleArena,
    ) -> Result<TaskCycleKey, PoolError> {
        let outcome = self.spawn(task, cycle, flows, graph, arena)?;
        let key = match outcome {
            SpawnOutcome::Created(k) | SpawnOutcome::MergedInto(k) => k,
        };
        if let Some(proxy) = self.proxies.get_mut(&key) {
            proxy.prerequisites = crate::domain::prerequisite::PrereqExpr::All(vec![]);
            if wait {
                proxy.defer_downstream = true;
            }
        }
        Ok(key)
    }

    /// Record a submission or execution retry: bump `submit_num`, gate
    /// the proxy behind the configured delay, and return it to `waiting`
    /// so a later readiness scan requeues it. The flow-set is left
    /// untouched, so a no-flow proxy's retry stays in no-flow rather than
    /// joining a new one.
    pub fn record_retry(&mut self, key: TaskCycleKey, delay: Option<Duration>) -> Result<(), PoolError> {
        let proxy = self.proxies.get_mut(&key).ok_or(PoolError::NotFound(key))?;
        proxy.submit_num += 1;
        proxy.gated_until = delay.map(|d| Instant::now() + d);
        proxy.transition(TaskState::Waiting);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// The oldest cycle among proxies not yet succeeded/expired, used to
    /// compute the runahead horizon. Cycle ordering is delegated to the
    /// caller via `arena` since `CycleId` alone carries no order.
    pub fn oldest_incomplete_cycle(&self, arena: &CycleArena) -> Option<CycleId> {
        self.proxies
            .iter()
            .filter(|(_, p)| !matches!(p.state, TaskState::Succeeded | TaskState::Expired))
            .filter_map(|(k, _)| arena.get(k.cycle).map(|pt| (k.cycle, *pt)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }
}
