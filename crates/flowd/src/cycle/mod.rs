//! Cycle & sequence algebra.
//!
//! Cycle points are either a plain integer or a timestamp in one of three
//! calendars. Arithmetic, comparison, and formatting are exact: two cycle
//! points compare equal only if they denote the same instant in the same
//! calendar family.

mod duration;
mod point;
mod recurrence;

pub use duration::{negate_calendar, CalendarDuration, CycleDuration};
pub use point::{Calendar, CyclePoint, DateTimePoint};
pub use recurrence::Recurrence;

use thiserror::Error;

/// Errors from cycle-point parsing and arithmetic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleError {
    /// The input string could not be parsed as a cycle point.
    #[error("invalid cycle point: {0}")]
    InvalidCyclePoint(String),

    /// The input string could not be parsed as a duration.
    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    /// An operation mixed integer and date-time cycling.
    #[error("cannot mix integer and date-time cycling")]
    MixedCycling,

    /// A recurrence expression was malformed.
    #[error("invalid recurrence: {0}")]
    InvalidRecurrence(String),
}

/// Add a duration to a cycle point.
pub fn add(p: &CyclePoint, d: &CycleDuration) -> Result<CyclePoint, CycleError> {
    p.checked_add(d)
}

/// Subtract two cycle points, yielding the duration between them (`a - b`).
pub fn sub(a: &CyclePoint, b: &CyclePoint) -> Result<CycleDuration, CycleError> {
    a.checked_sub(b)
}
