//! 5-field cron parser and evaluator.
//!
//! Grammar: `minute hour day-of-month month day-of-week`, whitespace
//! separated, all fields required. Per field: `*`, `a`, `a-b`, comma lists,
//! and a `/n` step applied to `*` or a range. `?` is an alias for `*`.
//! No seconds field, no `@macros`, no named months or days.
//!
//! Evaluation is an incremental minute scan: [`CronSpec::next`] walks minute
//! boundaries after the reference instant and returns the first one whose
//! minute, hour, day-of-month, month and day-of-week all belong to their
//! sets, giving up after one year (`None` means "never fires").

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::types::CronError;

/// Scan bound: expressions with no firing inside a year never fire.
const SCAN_BOUND_SECS: i64 = 366 * 86_400;

/// A parsed cron expression: one value set per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minute: BTreeSet<u8>,
    hour: BTreeSet<u8>,
    day_of_month: BTreeSet<u8>,
    month: BTreeSet<u8>,
    day_of_week: BTreeSet<u8>,
}

impl CronSpec {
    /// Parse a 5-field expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_field(fields[4], "day-of-week", 0, 6)?,
        })
    }

    /// The earliest instant strictly after `after` matching this spec, in
    /// `after`'s timezone. Minute granularity; `None` when nothing matches
    /// within one year.
    pub fn next<Tz: TimeZone>(&self, after: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.with_timezone(&Utc).timestamp();
        let bound = start + SCAN_BOUND_SECS;
        // First minute boundary strictly after `after`.
        let mut ts = start - start.rem_euclid(60) + 60;
        while ts <= bound {
            let utc = DateTime::<Utc>::from_timestamp(ts, 0)?;
            let local = utc.with_timezone(&tz);
            if self.matches(&local) {
                return Some(local);
            }
            ts += 60;
        }
        None
    }

    /// Whether the instant's local fields all belong to their sets.
    /// Day-of-week uses Sunday=0.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minute.contains(&(at.minute() as u8))
            && self.hour.contains(&(at.hour() as u8))
            && self.day_of_month.contains(&(at.day() as u8))
            && self.month.contains(&(at.month() as u8))
            && self
                .day_of_week
                .contains(&(at.weekday().num_days_from_sunday() as u8))
    }
}

impl fmt::Display for CronSpec {
    /// Canonical 5-field form: `*` for full fields, collapsed ranges
    /// otherwise. `parse(format!("{spec}"))` round-trips.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            render_field(&self.minute, 0, 59),
            render_field(&self.hour, 0, 23),
            render_field(&self.day_of_month, 1, 31),
            render_field(&self.month, 1, 12),
            render_field(&self.day_of_week, 0, 6),
        )
    }
}

fn parse_field(
    token: &str,
    field: &'static str,
    min: u8,
    max: u8,
) -> Result<BTreeSet<u8>, CronError> {
    if token.is_empty() {
        return Err(CronError::EmptyToken { field });
    }
    let mut set = BTreeSet::new();
    for part in token.split(',') {
        if part.is_empty() {
            return Err(CronError::EmptyToken { field });
        }
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CronError::InvalidStep { field })?;
                if step == 0 {
                    return Err(CronError::InvalidStep { field });
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if base == "*" || base == "?" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let a = parse_value(a, field, part, min, max)?;
            let b = parse_value(b, field, part, min, max)?;
            // Reversed ranges are valid and read as min(a,b)..max(a,b).
            (a.min(b), a.max(b))
        } else {
            if step.is_some() {
                return Err(CronError::InvalidStep { field });
            }
            let v = parse_value(base, field, part, min, max)?;
            (v, v)
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            set.insert(v);
        }
    }
    if set.is_empty() {
        return Err(CronError::EmptySet { field });
    }
    Ok(set)
}

fn parse_value(
    raw: &str,
    field: &'static str,
    part: &str,
    min: u8,
    max: u8,
) -> Result<u8, CronError> {
    let value: u32 = raw.parse().map_err(|_| CronError::InvalidToken {
        field,
        token: part.to_string(),
    })?;
    if value < min as u32 || value > max as u32 {
        return Err(CronError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value as u8)
}

fn render_field(set: &BTreeSet<u8>, min: u8, max: u8) -> String {
    if set.len() == (max - min + 1) as usize {
        return "*".to_string();
    }
    let mut parts = Vec::new();
    let mut iter = set.iter().copied();
    let mut run_start = match iter.next() {
        Some(v) => v,
        None => return "*".to_string(),
    };
    let mut run_end = run_start;
    for v in iter {
        if v == run_end + 1 {
            run_end = v;
        } else {
            parts.push(render_run(run_start, run_end));
            run_start = v;
            run_end = v;
        }
    }
    parts.push(render_run(run_start, run_end));
    parts.join(",")
}

fn render_run(start: u8, end: u8) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}
