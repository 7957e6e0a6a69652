//! Six-field cron expression validation and next-fire computation.
//!
//! Expressions carry second granularity:
//! `second minute hour day-of-month month day-of-week`.
//! The common five-field form is rejected rather than guessed at.
//!
//! Numeric days of the week run 0-6 from Sunday, with 7 also meaning
//! Sunday. The `cron` crate counts 1-7 from Sunday, so numeric day-of-week
//! items are rewritten before parsing. Named days pass through untouched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use thiserror::Error;

/// Number of whitespace-separated fields a schedule must have.
pub const FIELD_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidScheduleError {
    #[error("invalid cron expression '{expression}': expected 6 fields (second minute hour day-of-month month day-of-week), got {found}")]
    FieldCount { expression: String, found: usize },

    #[error("invalid cron expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("cron expression '{expression}' never fires")]
    NeverFires { expression: String },
}

/// A validated schedule.
#[derive(Debug, Clone)]
pub struct ParsedSchedule {
    expression: String,
    schedule: CronSchedule,
}

impl ParsedSchedule {
    /// The expression as submitted (trimmed).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire instant strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// Fire instants strictly after `from`, up to and including `until`.
    pub fn fires_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&from)
            .take_while(|t| *t <= until)
            .collect()
    }
}

impl fmt::Display for ParsedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for ParsedSchedule {
    type Err = InvalidScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Validate and parse a six-field expression.
pub fn parse(expression: &str) -> Result<ParsedSchedule, InvalidScheduleError> {
    let trimmed = expression.trim();
    let found = trimmed.split_whitespace().count();
    if found != FIELD_COUNT {
        return Err(InvalidScheduleError::FieldCount {
            expression: expression.to_string(),
            found,
        });
    }

    let syntax = |reason: String| InvalidScheduleError::Syntax {
        expression: expression.to_string(),
        reason,
    };
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let (leading, day_of_week) = fields.split_at(FIELD_COUNT - 1);
    let day_of_week = day_of_week_for_crate(day_of_week[0]).map_err(syntax)?;
    let rewritten = format!("{} {}", leading.join(" "), day_of_week);

    let schedule = CronSchedule::from_str(&rewritten).map_err(|e| syntax(e.to_string()))?;

    // Expressions like "0 0 0 30 2 *" parse but can never match.
    if schedule.upcoming(Utc).next().is_none() {
        return Err(InvalidScheduleError::NeverFires {
            expression: expression.to_string(),
        });
    }

    Ok(ParsedSchedule {
        expression: trimmed.to_string(),
        schedule,
    })
}

/// Rewrite a day-of-week field from Sunday-is-0 numbering into the crate's
/// Sunday-is-1 numbering. Numeric items expand to explicit day lists.
fn day_of_week_for_crate(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut items = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            items.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (start, end) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (day_number(start)?, day_number(end)?),
                None => {
                    let day = day_number(range)?;
                    (day, if step.is_some() { 6 } else { day })
                }
            },
        };
        if start > end {
            return Err(format!("invalid day-of-week range '{}'", range));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            items.push((day % 7 + 1).to_string());
        }
    }
    Ok(items.join(","))
}

fn day_number(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day-of-week '{}' is outside 0-7", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_accepts_six_fields() {
        let parsed = parse("0 0 * * * *").unwrap();
        assert_eq!(parsed.expression(), "0 0 * * * *");
        assert!(parse("*/30 * * * * *").is_ok());
        assert!(parse("0 30 2 * * Mon-Fri").is_ok());
    }

    #[test]
    fn test_rejects_five_field_form() {
        let err = parse("0 * * * *").unwrap_err();
        assert_eq!(
            err,
            InvalidScheduleError::FieldCount {
                expression: "0 * * * *".to_string(),
                found: 5
            }
        );
        assert!(err.to_string().contains("'0 * * * *'"));
    }

    #[test]
    fn test_rejects_seven_fields_and_garbage() {
        assert!(matches!(
            parse("0 0 0 1 1 * 2030"),
            Err(InvalidScheduleError::FieldCount { found: 7, .. })
        ));
        assert!(matches!(parse(""), Err(InvalidScheduleError::FieldCount { found: 0, .. })));
        assert!(matches!(
            parse("a b c d e f"),
            Err(InvalidScheduleError::Syntax { .. })
        ));
        assert!(matches!(
            parse("0 0 25 * * *"),
            Err(InvalidScheduleError::Syntax { .. })
        ));
    }

    #[test]
    fn test_next_after_is_top_of_hour() {
        let parsed = parse("0 0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap();
        let next = parsed.next_after(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_next_after_is_strict_and_deterministic() {
        let parsed = parse("0 0 * * * *").unwrap();
        let on_boundary = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let next = parsed.next_after(on_boundary).unwrap();
        assert!(next > on_boundary);
        assert_eq!(next.hour(), 14);
        assert_eq!(parsed.next_after(on_boundary), Some(next));
    }

    #[test]
    fn test_day_of_week_counts_sunday_as_zero() {
        // 2024-06-01 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let sunday = parse("0 0 0 * * 0").unwrap();
        assert_eq!(
            sunday.next_after(saturday),
            Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap())
        );
        let also_sunday = parse("0 0 0 * * 7").unwrap();
        assert_eq!(also_sunday.next_after(saturday), sunday.next_after(saturday));

        let monday = parse("0 0 12 * * 1").unwrap();
        assert_eq!(
            monday.next_after(saturday),
            Some(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_day_of_week_ranges_and_steps() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let weekdays = parse("0 0 2 * * 1-5").unwrap();
        let fires: Vec<_> = weekdays
            .fires_between(saturday, saturday + chrono::Duration::days(7))
            .into_iter()
            .map(|t| t.weekday())
            .collect();
        assert_eq!(
            fires,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
        );

        let weekend = parse("0 0 2 * * 6,0").unwrap();
        assert_eq!(
            weekend.next_after(saturday),
            Some(Utc.with_ymd_and_hms(2024, 6, 2, 2, 0, 0).unwrap())
        );

        // Sunday, Tuesday, Thursday, Saturday.
        let every_other = parse("0 0 2 * * */2").unwrap();
        let fires: Vec<_> = every_other
            .fires_between(saturday, saturday + chrono::Duration::days(7))
            .into_iter()
            .map(|t| t.weekday())
            .collect();
        assert_eq!(
            fires,
            vec![Weekday::Sun, Weekday::Tue, Weekday::Thu, Weekday::Sat]
        );

        // Named days keep their meaning.
        let named = parse("0 0 2 * * Mon-Fri").unwrap();
        assert_eq!(named.next_after(saturday), weekdays.next_after(saturday));
        assert_eq!(named.expression(), "0 0 2 * * Mon-Fri");
    }

    #[test]
    fn test_day_of_week_out_of_range() {
        assert!(matches!(
            parse("0 0 0 * * 8"),
            Err(InvalidScheduleError::Syntax { .. })
        ));
        assert!(matches!(
            parse("0 0 0 * * 5-1"),
            Err(InvalidScheduleError::Syntax { .. })
        ));
        assert!(matches!(
            parse("0 0 0 * * */0"),
            Err(InvalidScheduleError::Syntax { .. })
        ));
    }

    #[test]
    fn test_fires_between_window() {
        let parsed = parse("0 */15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let until = from + chrono::Duration::hours(1);
        let fires = parsed.fires_between(from, until);
        assert_eq!(fires.len(), 4);
        assert_eq!(fires.last().copied(), Some(until));
    }
}
