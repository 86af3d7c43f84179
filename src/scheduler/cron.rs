//! Cron evaluation: parsing, due-checks, previews and descriptions.
//!
//! Expressions use the standard 5-field Unix layout
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects
//! seconds and years as well, so a parsed expression is converted to the
//! 7-field form with second `0` and any year. Day-of-week follows Unix
//! numbering (`0` and `7` are Sunday) and is rewritten to day names so the
//! crate's 1-based numbering never leaks through.
//!
//! No timezone conversion happens here. Fields are matched against the UTC
//! instants the caller passes in.
//!
//! When both day-of-month and day-of-week are restricted, a time matches if
//! either day field matches, as in Vixie cron. The `cron` crate would require
//! both, so such expressions are split into two schedules and their fire
//! times merged.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{CoreError, Result};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const DAY_WORDS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];
const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const MONTH_WORDS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// A validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    fields: Vec<String>,
    /// One schedule, or two when the day fields combine with OR.
    schedules: Vec<CronSchedule>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: String| CoreError::InvalidCronExpression {
            expression: expr.to_string(),
            reason,
        };

        let fields: Vec<String> = expr.split_whitespace().map(str::to_string).collect();
        if fields.len() != 5 {
            return Err(invalid(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), found {}",
                fields.len()
            )));
        }

        let dow = translate_day_of_week(&fields[4]).map_err(invalid)?;
        let day_pairs = if !is_wild(&fields[2]) && !is_wild(&fields[4]) {
            vec![(fields[2].as_str(), "*"), ("*", dow.as_str())]
        } else {
            vec![(fields[2].as_str(), dow.as_str())]
        };

        let schedules = day_pairs
            .into_iter()
            .map(|(dom, dow)| {
                let extended = format!("0 {} {} {} {} {} *", fields[0], fields[1], dom, fields[3], dow);
                CronSchedule::from_str(&extended).map_err(|e| invalid(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source: fields.join(" "),
            fields,
            schedules,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(after).next())
            .min()
    }

    /// True iff a fire time lies in `(last_evaluated_at, now]`.
    pub fn is_due(&self, last_evaluated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(&last_evaluated_at)
            .is_some_and(|next| next <= now)
    }

    /// Fire times in `(from, until]`.
    pub fn upcoming(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let fires: BTreeSet<DateTime<Utc>> = self
            .schedules
            .iter()
            .flat_map(|s| s.after(&from).take_while(|t| *t <= until))
            .collect();
        fires.into_iter().collect()
    }

    /// Human-readable rendering, e.g. "At 09:00, Monday through Friday".
    pub fn describe(&self) -> String {
        let f = &self.fields;
        let mut out = describe_time(&f[0], &f[1]);

        if !is_wild(&f[2]) {
            match step_of(&f[2]) {
                Some(n) => out.push_str(&format!(", every {n} days")),
                None => out.push_str(&format!(", on day {} of the month", list_desc(&f[2]))),
            }
        }

        if !is_wild(&f[3]) {
            match expand(&f[3], 1, 12, &MONTH_NAMES) {
                Ok(months) => {
                    let words: Vec<String> = months
                        .iter()
                        .map(|m| MONTH_WORDS[(*m - 1) as usize].to_string())
                        .collect();
                    out.push_str(&format!(", only in {}", join_words(&words)));
                }
                Err(_) => out.push_str(&format!(", in month {}", list_desc(&f[3]))),
            }
        }

        if !is_wild(&f[4]) {
            let days = describe_day_of_week(&f[4]);
            match days.strip_prefix(',') {
                Some(rest) if !is_wild(&f[2]) => out.push_str(&format!(", or{rest}")),
                _ => out.push_str(&days),
            }
        }

        out
    }
}

impl FromStr for CronExpr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expr` and check whether it fires in `(last_evaluated_at, now]`.
pub fn is_due(expr: &str, last_evaluated_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
    Ok(CronExpr::parse(expr)?.is_due(last_evaluated_at, now))
}

pub fn describe(expr: &str) -> Result<String> {
    Ok(CronExpr::parse(expr)?.describe())
}

pub fn validate(expr: &str) -> Result<()> {
    CronExpr::parse(expr).map(|_| ())
}

fn translate_day_of_week(field: &str) -> std::result::Result<String, String> {
    if is_wild(field) {
        return Ok("*".to_string());
    }
    let days = expand(field, 0, 7, &DAY_NAMES)?;
    let days: BTreeSet<u32> = days.into_iter().map(|d| d % 7).collect();
    if days.len() == 7 {
        return Ok("*".to_string());
    }
    let names: Vec<&str> = days
        .iter()
        .map(|d| match d {
            0 => "Sun",
            1 => "Mon",
            2 => "Tue",
            3 => "Wed",
            4 => "Thu",
            5 => "Fri",
            _ => "Sat",
        })
        .collect();
    Ok(names.join(","))
}

/// Expand a single cron field into the set of values it matches.
fn expand(field: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<BTreeSet<u32>, String> {
    let mut out = BTreeSet::new();

    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((b, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| format!("invalid step '{s}' in '{field}'"))?;
                if step == 0 {
                    return Err(format!("step must be positive in '{field}'"));
                }
                (b, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if base == "*" || base == "?" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            (value(a, min, max, names)?, value(b, min, max, names)?)
        } else {
            let v = value(base, min, max, names)?;
            (v, if step.is_some() { max } else { v })
        };

        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed in '{field}'"));
        }

        let step = step.unwrap_or(1) as usize;
        out.extend((lo..=hi).step_by(step));
    }

    Ok(out)
}

fn value(token: &str, min: u32, max: u32, names: &[&str]) -> std::result::Result<u32, String> {
    let upper = token.to_ascii_uppercase();
    if let Some(pos) = names.iter().position(|n| *n == upper) {
        return Ok(pos as u32 + min);
    }
    let v: u32 = token
        .parse()
        .map_err(|_| format!("unrecognised value '{token}'"))?;
    if v < min || v > max {
        return Err(format!("value {v} outside {min}-{max}"));
    }
    Ok(v)
}

fn is_wild(field: &str) -> bool {
    field == "*" || field == "?"
}

fn step_of(field: &str) -> Option<&str> {
    field.strip_prefix("*/")
}

fn as_number(field: &str) -> Option<u32> {
    field.parse().ok()
}

fn describe_time(minute: &str, hour: &str) -> String {
    if is_wild(minute) && is_wild(hour) {
        return "Every minute".to_string();
    }
    if let (Some(n), true) = (step_of(minute), is_wild(hour)) {
        return format!("Every {n} minutes");
    }
    if let Some(m) = as_number(minute) {
        if is_wild(hour) {
            return if m == 0 {
                "Every hour".to_string()
            } else {
                format!("At {m} minutes past the hour")
            };
        }
        if let Some(n) = step_of(hour) {
            return if m == 0 {
                format!("Every {n} hours")
            } else {
                format!("At {m} minutes past the hour, every {n} hours")
            };
        }
        let hours: Option<Vec<u32>> = hour.split(',').map(as_number).collect();
        if let Some(hours) = hours {
            let times: Vec<String> = hours.iter().map(|h| format!("{h:02}:{m:02}")).collect();
            return format!("At {}", join_words(&times));
        }
    }
    format!("At minute {}, hour {}", list_desc(minute), list_desc(hour))
}

fn describe_day_of_week(field: &str) -> String {
    if let Some((a, b)) = field.split_once('-') {
        if !b.contains('/') && !field.contains(',') {
            if let (Ok(a), Ok(b)) = (value(a, 0, 7, &DAY_NAMES), value(b, 0, 7, &DAY_NAMES)) {
                return format!(
                    ", {} through {}",
                    DAY_WORDS[(a % 7) as usize],
                    DAY_WORDS[(b % 7) as usize]
                );
            }
        }
    }
    match expand(field, 0, 7, &DAY_NAMES) {
        Ok(days) => {
            let mut seen = BTreeSet::new();
            let words: Vec<String> = days
                .iter()
                .map(|d| d % 7)
                .filter(|d| seen.insert(*d))
                .map(|d| DAY_WORDS[d as usize].to_string())
                .collect();
            format!(", only on {}", join_words(&words))
        }
        Err(_) => format!(", on day-of-week {field}"),
    }
}

fn list_desc(field: &str) -> String {
    let parts: Vec<String> = field
        .split(',')
        .map(|part| match part.split_once('/') {
            Some(("*", n)) => format!("every {n}"),
            Some((base, n)) => format!("every {n} starting at {}", base.replace('-', " through ")),
            None => part.replace('-', " through "),
        })
        .collect();
    join_words(&parts)
}

fn join_words(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}
