//! Flow labels: numbered propagation wavefronts through the graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A set of flow numbers attached to a task proxy. The empty set is the
/// "no-flow" sentinel: a triggered instance that neither consumes nor
/// produces flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSet(BTreeSet<u32>);

impl FlowSet {
    /// The no-flow sentinel: an empty set.
    pub fn no_flow() -> Self {
        FlowSet(BTreeSet::new())
    }

    /// A set containing a single flow number.
    pub fn single(n: u32) -> Self {
        FlowSet(BTreeSet::from([n]))
    }

    /// Whether this is the no-flow sentinel.
    pub fn is_no_flow(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` and `other` share at least one flow number.
    ///
    /// Two no-flow sets are never considered non-disjoint by this check;
    /// merging is about flow propagation, which no-flow proxies opt out
    /// of.
    pub fn intersects(&self, other: &FlowSet) -> bool {
        !self.is_no_flow() && !other.is_no_flow() && self.0.intersection(&other.0).next().is_some()
    }

    /// Union this flow-set with another, in place.
    pub fn merge(&mut self, other: &FlowSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Clear this flow-set to the no-flow sentinel, as `remove` does
    /// before dropping a proxy.
    pub fn clear_to_no_flow(&mut self) {
        self.0.clear();
    }

    /// Iterate the flow numbers in this set.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Parse the `{1,2}` form written to the snapshot tables. `{}` is
    /// the no-flow sentinel.
    pub fn parse(s: &str) -> Option<FlowSet> {
        let inner = s.trim().strip_prefix('{')?.strip_suffix('}')?;
        if inner.is_empty() {
            return Some(FlowSet::no_flow());
        }
        let mut set = BTreeSet::new();
        for part in inner.split(',') {
            set.insert(part.trim().parse().ok()?);
        }
        Some(FlowSet(set))
    }
}

impl fmt::Display for FlowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{")?;
        for (i, n) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{n}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flow_never_intersects() {
        let a = FlowSet::no_flow();
        let b = FlowSet::no_flow();
        assert!(!a.intersects(&b));
    }

    #[test]
    fn shared_flow_intersects() {
        let a = FlowSet::single(1);
        let mut b = FlowSet::single(1);
        b.merge(&FlowSet::single(2));
        assert!(a.intersects(&b));
    }

    #[test]
    fn merge_unions_labels() {
        let mut a = FlowSet::single(1);
        a.merge(&FlowSet::single(2));
        assert_eq!(a.to_string(), "{1,2}");
    }

    #[test]
    fn display_round_trips_through_parse() {
        let mut a = FlowSet::single(1);
        a.merge(&FlowSet::single(3));
        assert_eq!(FlowSet::parse(&a.to_string()), Some(a));
        assert_eq!(FlowSet::parse("{}"), Some(FlowSet::no_flow()));
        assert_eq!(FlowSet::parse("1,2"), None);
    }
}
