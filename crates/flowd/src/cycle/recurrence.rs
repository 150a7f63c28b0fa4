//! Recurrence expressions: lazy, possibly-infinite cycle-point sequences.
//!
//! A recurrence is `(offset, period, bounds)`. `first = initial + offset`,
//! then `first + k·period` for `k ≥ 0`, intersected with `[initial,
//! final]` if `final` is set.

use super::{CycleDuration, CycleError, CyclePoint};
use serde::{Deserialize, Serialize};

/// A lazily-enumerated sequence of cycle points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurrence {
    initial: CyclePoint,
    offset: CycleDuration,
    period: CycleDuration,
    final_point: Option<CyclePoint>,
}

impl Recurrence {
    /// Build a recurrence. Fails if `period` does not strictly advance a
    /// point forward (zero or negative step), since that would enumerate
    /// forever without progress.
    pub fn new(
        initial: CyclePoint,
        offset: CycleDuration,
        period: CycleDuration,
        final_point: Option<CyclePoint>,
    ) -> Result<Self, CycleError> {
        if !is_positive_step(&period) {
            return Err(CycleError::InvalidRecurrence(
                "period must be a strictly positive step".to_string(),
            ));
        }
        Ok(Self { initial, offset, period, final_point })
    }

    /// Whether this recurrence is finite (a `final` bound is set).
    pub fn is_finite(&self) -> bool {
        self.final_point.is_some()
    }

    /// The first point in the sequence, ignoring the `[initial, final]`
    /// bounds (`initial + offset`).
    pub fn unbounded_first(&self) -> Result<CyclePoint, CycleError> {
        super::add(&self.initial, &self.offset)
    }

    /// The next point strictly after `after` (or the first point if
    /// `after` is `None`), intersected with `[initial, final]`. Returns
    /// `None` once the sequence is exhausted.
    pub fn next(&self, after: Option<&CyclePoint>) -> Result<Option<CyclePoint>, CycleError> {
        let mut current = self.unbounded_first()?;

        if let Some(after) = after {
            let mut guard = 0u32;
            while current <= *after {
                current = super::add(&current, &self.period)?;
                guard += 1;
                if guard > 1_000_000 {
                    return Err(CycleError::InvalidRecurrence(
                        "recurrence failed to converge".to_string(),
                    ));
                }
            }
        }

        let mut guard = 0u32;
        while current < self.initial {
            current = super::add(&current, &self.period)?;
            guard += 1;
            if guard > 1_000_000 {
                return Err(CycleError::InvalidRecurrence(
                    "recurrence failed to converge".to_string(),
                ));
            }
        }

        if let Some(final_point) = &self.final_point {
            if &current > final_point {
                return Ok(None);
            }
        }
        Ok(Some(current))
    }

    /// Collect up to `limit` points starting from the beginning of the
    /// sequence. Intended for tests and bounded preview, not hot-path use.
    pub fn take(&self, limit: usize) -> Result<Vec<CyclePoint>, CycleError> {
        let mut out = Vec::new();
        let mut cursor = None;
        while out.len() < limit {
            match self.next(cursor.as_ref())? {
                Some(p) => {
                    cursor = Some(p);
                    out.push(p);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

fn is_positive_step(d: &CycleDuration) -> bool {
    match d {
        CycleDuration::Integer(n) => *n > 0,
        CycleDuration::Calendar(c) => {
            c.years > 0
                || c.months > 0
                || (c.years == 0 && c.months == 0 && (c.days > 0 || c.seconds > 0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::Calendar;

    #[test]
    fn integer_recurrence_enumerates() {
        let r = Recurrence::new(
            CyclePoint::Integer(1),
            CycleDuration::Integer(0),
            CycleDuration::Integer(1),
            Some(CyclePoint::Integer(5)),
        )
        .unwrap();
        assert_eq!(
            r.take(10).unwrap(),
            vec![1, 2, 3, 4, 5].into_iter().map(CyclePoint::Integer).collect::<Vec<_>>()
        );
    }

    #[test]
    fn infinite_recurrence_has_no_final_bound() {
        let r = Recurrence::new(
            CyclePoint::Integer(1),
            CycleDuration::Integer(0),
            CycleDuration::Integer(1),
            None,
        )
        .unwrap();
        assert!(!r.is_finite());
        assert_eq!(r.take(3).unwrap().len(), 3);
    }

    #[test]
    fn zero_period_is_rejected() {
        let err = Recurrence::new(
            CyclePoint::Integer(1),
            CycleDuration::Integer(0),
            CycleDuration::Integer(0),
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn monthly_recurrence_over_datetime() {
        let initial = CyclePoint::parse("2021-01-31T00:00:00Z", Some(Calendar::Gregorian)).unwrap();
        let r = Recurrence::new(
            initial,
            CycleDuration::days(0),
            CycleDuration::months(1),
            None,
        )
        .unwrap();
        let points = r.take(3).unwrap();
        assert_eq!(points[0].format("%Y-%m-%d"), "2021-01-31");
        assert_eq!(points[1].format("%Y-%m-%d"), "2021-02-28");
        assert_eq!(points[2].format("%Y-%m-%d"), "2021-03-28");
    }
}
