//! Task outputs: predefined lifecycle signals plus custom, user-declared
//! outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The fixed set of outputs every task carries regardless of definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PredefinedOutput {
    Submitted,
    Started,
    Succeeded,
    Failed,
    SubmitFailed,
    Expired,
}

impl PredefinedOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredefinedOutput::Submitted => "submitted",
            PredefinedOutput::Started => "started",
            PredefinedOutput::Succeeded => "succeeded",
            PredefinedOutput::Failed => "failed",
            PredefinedOutput::SubmitFailed => "submit-failed",
            PredefinedOutput::Expired => "expired",
        }
    }

    /// Whether this predefined output counts as one of the two "finished"
    /// terminal outputs that satisfy an implicit `:finish` trigger.
    pub fn satisfies_finish(&self) -> bool {
        matches!(self, PredefinedOutput::Succeeded | PredefinedOutput::Failed)
    }
}

impl fmt::Display for PredefinedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An output a task can complete: one of the predefined lifecycle signals,
/// or a custom message registered by the task definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Output {
    Predefined(PredefinedOutput),
    Custom(String),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Predefined(p) => write!(f, "{p}"),
            Output::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl Output {
    /// Parse a trigger name as it appears in graph edges, task messages,
    /// or configuration (`succeeded`, `failed`, or any custom output a
    /// task definition has declared).
    pub fn parse(s: &str) -> Output {
        match s {
            "submitted" => Output::Predefined(PredefinedOutput::Submitted),
            "started" => Output::Predefined(PredefinedOutput::Started),
            "succeeded" => Output::Predefined(PredefinedOutput::Succeeded),
            "failed" => Output::Predefined(PredefinedOutput::Failed),
            "submit-failed" => Output::Predefined(PredefinedOutput::SubmitFailed),
            "expired" => Output::Predefined(PredefinedOutput::Expired),
            other => Output::Custom(other.to_string()),
        }
    }
}

/// The outputs a task definition declares and whether each is required for
/// the task to be considered complete: a task is complete when all of its
/// required outputs are satisfied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSet {
    required: BTreeSet<Output>,
    optional: BTreeSet<Output>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, output: Output, required: bool) {
        if required {
            self.optional.remove(&output);
            self.required.insert(output);
        } else {
            self.required.remove(&output);
            self.optional.insert(output);
        }
    }

    pub fn is_declared(&self, output: &Output) -> bool {
        self.required.contains(output) || self.optional.contains(output)
    }

    pub fn required(&self) -> impl Iterator<Item = &Output> {
        self.required.iter()
    }

    /// Whether `completed` satisfies every required output of this set.
    pub fn is_complete(&self, completed: &BTreeSet<Output>) -> bool {
        self.required.iter().all(|o| completed.contains(o))
    }
}
