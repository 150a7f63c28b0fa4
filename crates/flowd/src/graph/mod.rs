//! Graph expansion: turning a finite, repeating graph definition into the
//! two hot-path queries the scheduler loop needs — `children(task,
//! cycle)` and `parents(task, cycle)`.

use crate::cycle::{self, CycleDuration, CyclePoint};
use crate::domain::output::{Output, PredefinedOutput};
use crate::domain::prerequisite::{PrereqAtom, PrereqExpr};
use crate::domain::{CycleId, TaskId};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown task in graph edge: {0}")]
    UnknownTask(String),
    #[error("cycle point arena has no entry for id {0:?}")]
    UnknownCycle(CycleId),
    #[error(transparent)]
    Cycle(#[from] cycle::CycleError),
}

/// One edge of the graph: `lhs:output => rhs`, with an optional cross-cycle
/// offset on the left-hand side, e.g. `A[-P1D]`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub lhs: TaskId,
    pub lhs_output: Output,
    pub lhs_offset: Option<CycleDuration>,
    /// Whether `lhs` refers to the workflow's initial cycle point rather
    /// than an offset from `rhs`'s cycle (`A[^]`, materialised once).
    pub lhs_absolute_initial: bool,
    pub rhs: TaskId,
}

/// Interns `CyclePoint` values behind a stable `CycleId`, so the pool and
/// graph can key state by small integers instead of repeatedly formatting
/// and comparing points.
#[derive(Debug, Default)]
pub struct CycleArena {
    points: Vec<CyclePoint>,
    index: HashMap<String, CycleId>,
}

impl CycleArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, point: CyclePoint) -> CycleId {
        let key = point.to_string();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = CycleId(self.points.len() as u32);
        self.points.push(point);
        self.index.insert(key, id);
        id
    }

    pub fn get(&self, id: CycleId) -> Option<&CyclePoint> {
        self.points.get(id.0 as usize)
    }

    /// The id a point was previously interned under, if any.
    pub fn lookup(&self, point: &CyclePoint) -> Option<CycleId> {
        self.index.get(&point.to_string()).copied()
    }
}

/// Interns task names behind a stable `TaskId`, mirroring `CycleArena`.
/// Config loading interns every defined task name up front; glob matching
/// and message ingress look names back up through the same table.
#[derive(Debug, Default)]
pub struct NameArena {
    names: Vec<String>,
    index: HashMap<String, TaskId>,
}

impl NameArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> TaskId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = TaskId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.index.get(name).copied()
    }
}

/// The expanded graph: edges grouped by their right-hand-side task, plus
/// the initial cycle point used to resolve `A[^]` references.
#[derive(Debug, Default)]
pub struct Graph {
    edges_by_rhs: HashMap<TaskId, Vec<Edge>>,
    edges_by_lhs: HashMap<TaskId, Vec<Edge>>,
    initial_point: Option<CyclePoint>,
}

impl Graph {
    pub fn new(initial_point: Option<CyclePoint>) -> Self {
        Self { edges_by_rhs: HashMap::new(), edges_by_lhs: HashMap::new(), initial_point }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges_by_lhs.entry(edge.lhs).or_default().push(edge.clone());
        self.edges_by_rhs.entry(edge.rhs).or_default().push(edge);
    }

    /// Whether any edge feeds into `task`. Parentless tasks are seeded
    /// from their recurrences rather than spawned by an upstream output.
    pub fn has_parents(&self, task: TaskId) -> bool {
        self.edges_by_rhs.get(&task).map_or(false, |edges| !edges.is_empty())
    }

    /// `parents(task, cycle) → prerequisite-expression`. Builds a
    /// conjunction of every incoming edge, resolving cross-cycle offsets
    /// and the absolute-initial-cycle reference. An edge's offset is
    /// stored as written on its left-hand side (`A[-P1]` is -1), so the
    /// upstream cycle is the dependent's cycle plus that offset.
    pub fn parents(
        &self,
        task: TaskId,
        cycle: CycleId,
        arena: &mut CycleArena,
    ) -> Result<PrereqExpr, GraphError> {
        let point = arena.get(cycle).copied().ok_or(GraphError::UnknownCycle(cycle))?;
        let mut atoms = Vec::new();
        for edge in self.edges_by_rhs.get(&task).into_iter().flatten() {
            let lhs_point = if edge.lhs_absolute_initial {
                self.initial_point.ok_or(GraphError::UnknownCycle(cycle))?
            } else if let Some(offset) = &edge.lhs_offset {
                cycle::add(&point, offset)?
            } else {
                point
            };
            let lhs_cycle = arena.intern(lhs_point);
            atoms.push(PrereqExpr::Atom(PrereqAtom::new(edge.lhs, lhs_cycle, edge.lhs_output.clone())));
        }
        Ok(PrereqExpr::All(atoms))
    }

    /// `children(task, cycle) → iterable<(task, cycle, output)>`: every
    /// downstream `(task, cycle)` reachable from an output of `task` at
    /// `cycle`. Inverts the edge's left-hand offset: if B at cycle c
    /// depends on A at c + offset, then A at cycle p feeds B at
    /// p - offset.
    pub fn children(
        &self,
        task: TaskId,
        cycle: CycleId,
        arena: &mut CycleArena,
    ) -> Result<Vec<(TaskId, CycleId, Output)>, GraphError> {
        let point = arena.get(cycle).copied().ok_or(GraphError::UnknownCycle(cycle))?;
        let mut out = Vec::new();
        for edge in self.edges_by_lhs.get(&task).into_iter().flatten() {
            if edge.lhs_absolute_initial {
                continue;
            }
            let rhs_point = if let Some(offset) = &edge.lhs_offset {
                cycle::add(&point, &negate(offset))?
            } else {
                point
            };
            let rhs_cycle = arena.intern(rhs_point);
            out.push((edge.rhs, rhs_cycle, edge.lhs_output.clone()));
        }
        Ok(out)
    }
}

fn negate(d: &CycleDuration) -> CycleDuration {
    match d {
        CycleDuration::Integer(n) => CycleDuration::Integer(-n),
        CycleDuration::Calendar(c) => CycleDuration::Calendar(crate::cycle::negate_calendar(*c)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn succeeded() -> Output {
        Output::Predefined(PredefinedOutput::Succeeded)
    }

    #[test]
    fn linear_chain_children_and_parents_resolve() {
        let mut arena = CycleArena::new();
        let c1 = arena.intern(CyclePoint::Integer(1));
        let foo = TaskId(0);
        let bar = TaskId(1);

        let mut g = Graph::new(None);
        g.add_edge(Edge { lhs: foo, lhs_output: succeeded(), lhs_offset: None, lhs_absolute_initial: false, rhs: bar });

        let kids = g.children(foo, c1, &mut arena).unwrap();
        assert_eq!(kids, vec![(bar, c1, succeeded())]);

        let parents = g.parents(bar, c1, &mut arena).unwrap();
        assert!(!parents.is_satisfied());
    }

    #[test]
    fn cross_cycle_offset_resolves_to_earlier_point() {
        let mut arena = CycleArena::new();
        let c2 = arena.intern(CyclePoint::Integer(2));
        let foo = TaskId(0);
        let bar = TaskId(1);

        let mut g = Graph::new(None);
        g.add_edge(Edge {
            lhs: foo,
            lhs_output: succeeded(),
            lhs_offset: Some(CycleDuration::Integer(-1)),
            lhs_absolute_initial: false,
            rhs: bar,
        });

        let parents = g.parents(bar, c2, &mut arena).unwrap();
        let atoms = parents.atoms();
        assert_eq!(atoms.len(), 1);
        let expected_cycle = arena.intern(CyclePoint::Integer(1));
        assert_eq!(atoms[0].cycle, expected_cycle);

        // The inverse direction: foo at cycle 1 feeds bar at cycle 2.
        let kids = g.children(foo, expected_cycle, &mut arena).unwrap();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].1, c2);
    }

    #[test]
    fn name_arena_interns_idempotently_and_roundtrips() {
        let mut names = NameArena::new();
        let foo = names.intern("foo");
        let foo2 = names.intern("foo");
        let bar = names.intern("bar");
        assert_eq!(foo, foo2);
        assert_ne!(foo, bar);
        assert_eq!(names.get(foo), Some("foo"));
        assert_eq!(names.lookup("bar"), Some(bar));
        assert_eq!(names.lookup("missing"), None);
    }
}
