//! Prerequisites: boolean expressions over `(task, cycle, output)` triples
//! that gate when a task proxy becomes ready to run.

use super::output::Output;
use super::{CycleId, TaskId};
use serde::{Deserialize, Serialize};

/// A single `task[cycle-offset]:output` reference inside a prerequisite
/// expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqAtom {
    pub task: TaskId,
    pub cycle: CycleId,
    pub output: Output,
    satisfied: bool,
}

impl PrereqAtom {
    pub fn new(task: TaskId, cycle: CycleId, output: Output) -> Self {
        Self { task, cycle, output, satisfied: false }
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    /// Mark this atom satisfied if it matches the given `(task, cycle,
    /// output)` triple. Returns whether a match occurred.
    pub fn satisfy_if_matches(&mut self, task: TaskId, cycle: CycleId, output: &Output) -> bool {
        if self.task == task && self.cycle == cycle && &self.output == output {
            self.satisfied = true;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.satisfied = false;
    }
}

/// A boolean expression tree over prerequisite atoms; graph trigger
/// expressions combine atoms with `&` and `|`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrereqExpr {
    Atom(PrereqAtom),
    All(Vec<PrereqExpr>),
    Any(Vec<PrereqExpr>),
}

impl PrereqExpr {
    /// Whether this expression currently evaluates true.
    pub fn is_satisfied(&self) -> bool {
        match self {
            PrereqExpr::Atom(a) => a.is_satisfied(),
            PrereqExpr::All(xs) => xs.iter().all(PrereqExpr::is_satisfied),
            PrereqExpr::Any(xs) => xs.iter().any(PrereqExpr::is_satisfied),
        }
    }

    /// Propagate a completed `(task, cycle, output)` event into every
    /// matching atom in the tree. Returns whether any atom changed state.
    pub fn satisfy(&mut self, task: TaskId, cycle: CycleId, output: &Output) -> bool {
        match self {
            PrereqExpr::Atom(a) => a.satisfy_if_matches(task, cycle, output),
            PrereqExpr::All(xs) | PrereqExpr::Any(xs) => {
                xs.iter_mut().fold(false, |acc, x| x.satisfy(task, cycle, output) || acc)
            }
        }
    }

    /// Reset every atom in the tree to unsatisfied (used when re-running a
    /// proxy, e.g. after a new flow number triggers it).
    pub fn reset(&mut self) {
        match self {
            PrereqExpr::Atom(a) => a.reset(),
            PrereqExpr::All(xs) | PrereqExpr::Any(xs) => xs.iter_mut().for_each(PrereqExpr::reset),
        }
    }

    /// Collect every atom referenced by this expression.
    pub fn atoms(&self) -> Vec<&PrereqAtom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a PrereqAtom>) {
        match self {
            PrereqExpr::Atom(a) => out.push(a),
            PrereqExpr::All(xs) | PrereqExpr::Any(xs) => {
                xs.iter().for_each(|x| x.collect_atoms(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::output::PredefinedOutput;

    fn atom(task: u32, cycle: u32) -> PrereqExpr {
        PrereqExpr::Atom(PrereqAtom::new(
            TaskId(task),
            CycleId(cycle),
            Output::Predefined(PredefinedOutput::Succeeded),
        ))
    }

    #[test]
    fn all_requires_every_atom() {
        let mut expr = PrereqExpr::All(vec![atom(1, 1), atom(2, 1)]);
        assert!(!expr.is_satisfied());
        expr.satisfy(TaskId(1), CycleId(1), &Output::Predefined(PredefinedOutput::Succeeded));
        assert!(!expr.is_satisfied());
        expr.satisfy(TaskId(2), CycleId(1), &Output::Predefined(PredefinedOutput::Succeeded));
        assert!(expr.is_satisfied());
    }

    #[test]
    fn any_requires_one_atom() {
        let mut expr = PrereqExpr::Any(vec![atom(1, 1), atom(2, 1)]);
        expr.satisfy(TaskId(2), CycleId(1), &Output::Predefined(PredefinedOutput::Succeeded));
        assert!(expr.is_satisfied());
    }

    #[test]
    fn reset_clears_all_atoms() {
        let mut expr = PrereqExpr::All(vec![atom(1, 1)]);
        expr.satisfy(TaskId(1), CycleId(1), &Output::Predefined(PredefinedOutput::Succeeded));
        assert!(expr.is_satisfied());
        expr.reset();
        assert!(!expr.is_satisfied());
    }
}
