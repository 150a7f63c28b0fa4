//! Cycle point representation and arithmetic.

use super::{CycleDuration, CycleError};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Calendar family used to interpret date-time cycle points.
///
/// Comparison is always on the absolute instant; the calendar only
/// governs how calendrical (month/year) offsets are applied and how
/// points are formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Calendar {
    /// Standard Gregorian calendar with leap years.
    Gregorian,
    /// Every month has exactly 30 days.
    Days360,
    /// Every year has exactly 365 days; no leap years.
    Days365,
}

/// A date-time cycle point: an absolute instant plus the calendar used for
/// calendrical (month/year) arithmetic and an optional display offset used
/// only for formatting. Individual cycle points may carry explicit
/// offsets; comparison is always on the absolute instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateTimePoint {
    /// The absolute instant this cycle point denotes.
    pub instant: DateTime<Utc>,
    /// Calendar used for calendrical arithmetic and formatting.
    pub calendar: Calendar,
    /// Offset (seconds east of UTC) used only when formatting this point;
    /// does not affect comparison or arithmetic correctness.
    pub display_offset_secs: i32,
}

impl PartialEq for DateTimePoint {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant && self.calendar == other.calendar
    }
}
impl Eq for DateTimePoint {}

impl PartialOrd for DateTimePoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DateTimePoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant.cmp(&other.instant)
    }
}

/// A cycle point: either an integer index or a calendar date-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CyclePoint {
    /// An integer cycle point (e.g. a plain run counter).
    Integer(i64),
    /// A calendar date-time cycle point.
    DateTime(DateTimePoint),
}

impl fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePoint::Integer(n) => write!(f, "{n}"),
            CyclePoint::DateTime(dt) => write!(f, "{}", dt.instant.format("%Y-%m-%dT%H:%M:%SZ")),
        }
    }
}

impl PartialOrd for CyclePoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => a.partial_cmp(b),
            (CyclePoint::DateTime(a), CyclePoint::DateTime(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl CyclePoint {
    /// Parse a cycle point from a string.
    ///
    /// Integer cycling accepts a bare (optionally signed) integer.
    /// Date-time cycling accepts `YYYY-MM-DDTHH:MM:SS[Z|+HH:MM]`.
    pub fn parse(s: &str, calendar: Option<Calendar>) -> Result<Self, CycleError> {
        if let Some(calendar) = calendar {
            let (instant, offset) = parse_datetime(s)
                .ok_or_else(|| CycleError::InvalidCyclePoint(s.to_string()))?;
            return Ok(CyclePoint::DateTime(DateTimePoint {
                instant,
                calendar,
                display_offset_secs: offset,
            }));
        }
        if let Ok(n) = s.trim().parse::<i64>() {
            return Ok(CyclePoint::Integer(n));
        }
        if let Some((instant, offset)) = parse_datetime(s) {
            return Ok(CyclePoint::DateTime(DateTimePoint {
                instant,
                calendar: Calendar::Gregorian,
                display_offset_secs: offset,
            }));
        }
        Err(CycleError::InvalidCyclePoint(s.to_string()))
    }

    /// Format this cycle point using a `strftime`-style pattern for
    /// date-time points; integer points ignore the pattern.
    pub fn format(&self, pattern: &str) -> String {
        match self {
            CyclePoint::Integer(n) => n.to_string(),
            CyclePoint::DateTime(dt) => {
                let local = dt.instant + ChronoDuration::seconds(dt.display_offset_secs as i64);
                local.format(pattern).to_string()
            }
        }
    }

    pub(super) fn checked_add(&self, d: &CycleDuration) -> Result<CyclePoint, CycleError> {
        match (self, d) {
            (CyclePoint::Integer(p), CycleDuration::Integer(n)) => Ok(CyclePoint::Integer(p + n)),
            (CyclePoint::DateTime(p), CycleDuration::Calendar(cd)) => {
                Ok(CyclePoint::DateTime(add_calendar(p, cd)))
            }
            _ => Err(CycleError::MixedCycling),
        }
    }

    pub(super) fn checked_sub(&self, other: &CyclePoint) -> Result<CycleDuration, CycleError> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => {
                Ok(CycleDuration::Integer(a - b))
            }
            (CyclePoint::DateTime(a), CyclePoint::DateTime(b)) => {
                let secs = (a.instant - b.instant).num_seconds();
                Ok(CycleDuration::from_seconds(secs))
            }
            _ => Err(CycleError::MixedCycling),
        }
    }
}

/// Parse `YYYY-MM-DDTHH:MM:SS` with an optional `Z` or `+HH:MM`/`-HH:MM`
/// suffix, returning the absolute UTC instant and the offset (seconds east
/// of UTC) that was present in the source string (0 if `Z` or absent).
fn parse_datetime(s: &str) -> Option<(DateTime<Utc>, i32)> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(rest, "%Y-%m-%dT%H:%M:%S").ok()?;
        return Some((DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc), 0));
    }
    for (sign, idx) in [('+', s.rfind('+')), ('-', s.rfind('-').filter(|&i| i > 10))] {
        if let Some(idx) = idx {
            let (base, off) = s.split_at(idx);
            let naive = NaiveDateTime::parse_from_str(base, "%Y-%m-%dT%H:%M:%S").ok()?;
            let off = off.trim_start_matches(['+', '-']);
            let mut parts = off.splitn(2, ':');
            let hh: i32 = parts.next()?.parse().ok()?;
            let mm: i32 = parts.next().unwrap_or("0").parse().ok()?;
            let offset_secs = (hh * 3600 + mm * 60) * if sign == '+' { 1 } else { -1 };
            let instant = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
                - ChronoDuration::seconds(offset_secs as i64);
            return Some((instant, offset_secs));
        }
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some((DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc), 0))
}

/// Apply a calendrical duration to a date-time point.
///
/// Month/year offsets apply first, in the point's own calendar, with
/// end-of-month clamping when the target month is shorter; day/second
/// offsets apply afterwards as exact elapsed time.
fn add_calendar(p: &DateTimePoint, d: &super::duration::CalendarDuration) -> DateTimePoint {
    let local = p.instant + ChronoDuration::seconds(p.display_offset_secs as i64);
    let shifted_date = match p.calendar {
        Calendar::Gregorian => add_months_gregorian(local.date_naive(), d.months_total()),
        Calendar::Days360 => add_months_360(local.date_naive(), d.months_total()),
        Calendar::Days365 => add_months_365(local.date_naive(), d.months_total()),
    };
    let shifted = NaiveDateTime::new(shifted_date, local.time());
    let with_time = shifted + ChronoDuration::days(d.days) + ChronoDuration::seconds(d.seconds);
    let instant = DateTime::<Utc>::from_naive_utc_and_offset(with_time, Utc)
        - ChronoDuration::seconds(p.display_offset_secs as i64);
    DateTimePoint {
        instant,
        calendar: p.calendar,
        display_offset_secs: p.display_offset_secs,
    }
}

/// Add whole months to a Gregorian date, clamping the day-of-month down to
/// the last valid day of the target month when the addition lands on an
/// ambiguous date.
fn add_months_gregorian(date: NaiveDate, months: i64) -> NaiveDate {
    let total = date.year() as i64 * 12 + (date.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let mut day = date.day();
    loop {
        if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
            return d;
        }
        day -= 1;
    }
}

/// 360-day calendar: every month has exactly 30 days, represented as a
/// straight day-count offset from the epoch-normalised (year, month, day).
fn add_months_360(date: NaiveDate, months: i64) -> NaiveDate {
    let day = date.day().min(30);
    let total = date.year() as i64 * 12 + (date.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .expect("valid fallback date")
}

/// 365-day calendar: like Gregorian but February always has 28 days.
fn add_months_365(date: NaiveDate, months: i64) -> NaiveDate {
    let day = if date.month() == 2 { date.day().min(28) } else { date.day() };
    let total = date.year() as i64 * 12 + (date.month() as i64 - 1) + months;
    let year = total.div_euclid(12) as i32;
    let month = (total.rem_euclid(12) + 1) as u32;
    let clamped_day = if month == 2 { day.min(28) } else { day };
    NaiveDate::from_ymd_opt(year, month, clamped_day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .expect("valid fallback date")
}
