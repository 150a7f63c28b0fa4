//! Cycle durations: the result of subtracting two cycle points, and the
//! operand of adding a duration to a point.

use serde::{Deserialize, Serialize};
use std::ops::Add;

/// A calendrical duration: a whole number of years/months plus an exact
/// elapsed time. Years and months apply first (per the point's calendar,
/// with end-of-month clamping); days and seconds apply as exact elapsed
/// time afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDuration {
    /// Whole years.
    pub years: i64,
    /// Whole months (in addition to `years`).
    pub months: i64,
    /// Whole days, applied as exact elapsed time.
    pub days: i64,
    /// Whole seconds, applied as exact elapsed time.
    pub seconds: i64,
}

impl CalendarDuration {
    pub(super) fn months_total(&self) -> i64 {
        self.years * 12 + self.months
    }
}

/// A cycle duration: either a plain integer step or a calendrical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleDuration {
    /// An integer step (for integer cycling).
    Integer(i64),
    /// A calendrical offset (for date-time cycling).
    Calendar(CalendarDuration),
}

impl CycleDuration {
    /// A duration of whole months.
    pub fn months(n: i64) -> Self {
        CycleDuration::Calendar(CalendarDuration { months: n, ..Default::default() })
    }

    /// A duration of whole years.
    pub fn years(n: i64) -> Self {
        CycleDuration::Calendar(CalendarDuration { years: n, ..Default::default() })
    }

    /// A duration of whole days.
    pub fn days(n: i64) -> Self {
        CycleDuration::Calendar(CalendarDuration { days: n, ..Default::default() })
    }

    /// A calendrical duration built from an exact number of seconds
    /// (used when subtracting two date-time points).
    pub fn from_seconds(secs: i64) -> Self {
        CycleDuration::Calendar(CalendarDuration { seconds: secs, ..Default::default() })
    }

    /// Parse a duration. Integer cycling accepts a bare integer or the
    /// `P<n>` cycle-count form; date-time cycling accepts an ISO-8601
    /// duration such as `P1D`, `PT1H`, or `P1Y2M3D`. A leading `-`
    /// negates either form, as in the cross-cycle offset `-P1D`.
    pub fn parse(s: &str) -> Result<Self, super::CycleError> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Ok(CycleDuration::Integer(n));
        }
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let parsed = parse_unsigned(body)
            .ok_or_else(|| super::CycleError::InvalidDuration(s.to_string()))?;
        Ok(if negative { negate(parsed) } else { parsed })
    }
}

fn parse_unsigned(s: &str) -> Option<CycleDuration> {
    let rest = s.strip_prefix('P')?;
    if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
        return rest.parse().ok().map(CycleDuration::Integer);
    }
    parse_iso8601_duration(s).map(CycleDuration::Calendar)
}

fn negate(d: CycleDuration) -> CycleDuration {
    match d {
        CycleDuration::Integer(n) => CycleDuration::Integer(-n),
        CycleDuration::Calendar(c) => CycleDuration::Calendar(negate_calendar(c)),
    }
}

/// Negate every component of a calendrical duration (used to resolve a
/// cross-cycle offset like `A[-P1D]` into a forward `add`).
pub fn negate_calendar(d: CalendarDuration) -> CalendarDuration {
    CalendarDuration { years: -d.years, months: -d.months, days: -d.days, seconds: -d.seconds }
}

impl Add for CalendarDuration {
    type Output = CalendarDuration;
    fn add(self, rhs: CalendarDuration) -> CalendarDuration {
        CalendarDuration {
            years: self.years + rhs.years,
            months: self.months + rhs.months,
            days: self.days + rhs.days,
            seconds: self.seconds + rhs.seconds,
        }
    }
}

fn parse_iso8601_duration(s: &str) -> Option<CalendarDuration> {
    let s = s.trim();
    let rest = s.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut out = CalendarDuration::default();
    let mut num = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: i64 = num.parse().ok()?;
        num.clear();
        match c {
            'Y' => out.years += n,
            'M' => out.months += n,
            'W' => out.days += n * 7,
            'D' => out.days += n,
            _ => return None,
        }
    }
    if !num.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        for c in time_part.chars() {
            if c.is_ascii_digit() {
                num.push(c);
                continue;
            }
            let n: i64 = num.parse().ok()?;
            num.clear();
            match c {
                'H' => out.seconds += n * 3600,
                'M' => out.seconds += n * 60,
                'S' => out.seconds += n,
                _ => return None,
            }
        }
        if !num.is_empty() {
            return None;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_duration() {
        let d = CycleDuration::parse("P1Y2M3DT4H5M6S").unwrap();
        assert_eq!(
            d,
            CycleDuration::Calendar(CalendarDuration {
                years: 1,
                months: 2,
                days: 3,
                seconds: 4 * 3600 + 5 * 60 + 6,
            })
        );
    }

    #[test]
    fn parses_integer_step() {
        assert_eq!(CycleDuration::parse("3").unwrap(), CycleDuration::Integer(3));
        assert_eq!(CycleDuration::parse("P2").unwrap(), CycleDuration::Integer(2));
    }

    #[test]
    fn parses_negative_cross_cycle_offsets() {
        assert_eq!(CycleDuration::parse("-P1").unwrap(), CycleDuration::Integer(-1));
        assert_eq!(
            CycleDuration::parse("-P1D").unwrap(),
            CycleDuration::Calendar(CalendarDuration { days: -1, ..Default::default() })
        );
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(CycleDuration::parse("PXD").is_err());
    }
}
