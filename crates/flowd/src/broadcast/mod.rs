//! Broadcast & runtime overlay: settings pushed onto running tasks,
//! resolved by specificity at job submission time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The target of a broadcast: a cycle-point selector and a namespace
/// (task name or family name) plus the setting key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastTarget {
    /// `None` denotes the `*` wildcard cycle-point selector.
    pub point: Option<String>,
    pub namespace: String,
    pub key: String,
}

impl BroadcastTarget {
    /// Cycle-axis specificity: a cycle-specific target outranks `*`.
    /// Namespace specificity comes from the task chain the caller passes
    /// to `effective`, ranked most-derived to root.
    fn cycle_rank(&self) -> u8 {
        if self.point.is_some() {
            1
        } else {
            0
        }
    }
}

/// The current broadcast state: a mapping from `(point, namespace, key)`
/// to value. Every change is also recorded in the durable event log by
/// the scheduler loop, which is what rebuilds this map on restart.
#[derive(Debug, Default)]
pub struct BroadcastOverlay {
    settings: BTreeMap<BroadcastTarget, String>,
}

impl BroadcastOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, target: BroadcastTarget, value: String) {
        self.settings.insert(target, value);
    }

    pub fn cancel(&mut self, target: &BroadcastTarget) {
        self.settings.remove(target);
    }

    /// `broadcast clear`: remove every setting matching the given
    /// point/namespace selector (either may be `None` to match anything).
    pub fn clear(&mut self, point: Option<&str>, namespace: Option<&str>) {
        self.settings.retain(|t, _| {
            let point_matches = point.map_or(true, |p| t.point.as_deref() == Some(p));
            let ns_matches = namespace.map_or(true, |n| t.namespace == n);
            !(point_matches && ns_matches)
        });
    }

    /// Resolve the effective overlay for a task instance: every setting
    /// whose target matches `point`/`task_chain` (the task's own name
    /// first, then each ancestor family in order), with cycle-specific
    /// beating `*` and more-derived namespaces beating less-derived ones.
    pub fn effective(&self, point: &str, task_chain: &[String]) -> BTreeMap<String, String> {
        let mut ranked: Vec<(u8, u8, &str, &str)> = Vec::new();
        for (target, value) in &self.settings {
            let point_matches = target.point.as_deref().map_or(true, |p| p == point);
            if !point_matches {
                continue;
            }
            let Some(ns_rank) = task_chain.iter().position(|n| n == &target.namespace) else {
                continue;
            };
            // lower ns_rank (closer to the task itself) should win; invert
            // so higher score == more specific, matching cycle_rank's sense.
            let ns_score = u8::MAX - ns_rank.min(u8::MAX as usize) as u8;
            ranked.push((target.cycle_rank(), ns_score, target.key.as_str(), value.as_str()));
        }
        ranked.sort_by_key(|(cycle_rank, ns_score, _, _)| (*cycle_rank, *ns_score));

        let mut out = BTreeMap::new();
        for (_, _, key, value) in ranked {
            out.insert(key.to_string(), value.to_string());
        }
        out
    }
}
