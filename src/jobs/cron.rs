//! Cron expression parsing and next-fire computation.
//!
//! Grounded on the teacher's `ScheduleType::Cron` stub
//! (`enterprise::workflow::scheduler`), which declared the variant but left
//! `next_execution` returning `None` ("simplified cron parsing ... in
//! production would use a cron library"). This makes it functional.
//!
//! The next-fire search is intentionally a brute-force minute walk rather
//! than a closed-form calculation: starting at `now + 1 minute` aligned to
//! `:00` seconds, it steps minute by minute, testing the five fields
//! against each candidate, for up to one year before giving up. A 6-field
//! expression is accepted with a leading seconds field, which is parsed
//! for validation but discarded before matching — this engine fires at
//! minute granularity only, never sub-minute. Both quirks are deliberate
//! behavior carried over from the system this was modeled on rather than
//! a true implementation of full cron semantics, and are called out as an
//! open question for a future redesign.

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

const MAX_LOOKAHEAD_MINUTES: i64 = 60 * 24 * 366;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
}

pub type CronResult<T> = Result<T, CronError>;

#[derive(Debug, Clone)]
struct Field {
    allowed: Vec<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.allowed.contains(&value)
    }

    fn parse(expr: &str, min: u32, max: u32) -> CronResult<Self> {
        let mut allowed = Vec::new();
        for part in expr.split(',') {
            allowed.extend(Self::parse_part(part, min, max)?);
        }
        allowed.sort_unstable();
        allowed.dedup();
        if allowed.is_empty() {
            return Err(CronError::InvalidExpression(format!(
                "field '{}' resolved to no values",
                expr
            )));
        }
        Ok(Self { allowed })
    }

    fn parse_part(part: &str, min: u32, max: u32) -> CronResult<Vec<u32>> {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CronError::InvalidExpression(format!("bad step in '{}'", part)))?;
                if step == 0 {
                    return Err(CronError::InvalidExpression(format!(
                        "step cannot be zero in '{}'",
                        part
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| CronError::InvalidExpression(format!("bad range in '{}'", part)))?;
            let b: u32 = b
                .parse()
                .map_err(|_| CronError::InvalidExpression(format!("bad range in '{}'", part)))?;
            (a, b)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| CronError::InvalidExpression(format!("bad value in '{}'", part)))?;
            (v, v)
        };

        if start < min || end > max || start > end {
            return Err(CronError::InvalidExpression(format!(
                "field '{}' out of range {}..={}",
                part, min, max
            )));
        }

        Ok((start..=end).step_by(step as usize).collect())
    }
}

/// A parsed cron schedule, matched at minute granularity.
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    /// Parse a 5-field (`minute hour dom month dow`) or 6-field
    /// (`second minute hour dom month dow`) expression. The seconds field,
    /// when present, is validated but discarded.
    pub fn parse(expr: &str) -> CronResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let fields = match fields.len() {
            5 => fields,
            6 => {
                Field::parse(fields[0], 0, 59)?; // validate seconds, then discard
                fields[1..].to_vec()
            }
            n => {
                return Err(CronError::InvalidExpression(format!(
                    "expected 5 or 6 fields, found {}",
                    n
                )))
            }
        };

        Ok(Self {
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day_of_month: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            day_of_week: Field::parse(fields[4], 0, 6)?,
        })
    }

    fn matches<Tz: chrono::TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }

    /// Search minute by minute from `now + 1 minute` (seconds zeroed) for
    /// up to one year in UTC, returning the first matching instant.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_fire_with_offset(now, 0)
    }

    /// Same search, but fields are matched against local time at a fixed
    /// `utc_offset_minutes` offset rather than UTC directly.
    pub fn next_fire_with_offset(&self, now: DateTime<Utc>, utc_offset_minutes: i32) -> Option<DateTime<Utc>> {
        let offset = chrono::FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))?;
        let local_now = now.with_timezone(&offset);
        let mut candidate = (local_now + chrono::Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..MAX_LOOKAHEAD_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate.with_timezone(&Utc));
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wildcard_expression_fires_next_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 30).unwrap();
        let next = schedule.next_fire(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn six_field_expression_discards_seconds() {
        let schedule = CronSchedule::parse("30 * * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let next = schedule.next_fire(now).unwrap();
        // Fires at the top of the next minute regardless of the discarded
        // seconds field, since matching only ever looks at minute..dow.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn specific_hour_skips_to_the_right_day() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = schedule.next_fire(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn step_values_are_honored() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap();
        let next = schedule.next_fire(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 15, 0).unwrap());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(CronSchedule::parse("* * *").is_err());
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        assert!(CronSchedule::parse("0 25 * * *").is_err());
    }

    #[test]
    fn zero_step_is_rejected() {
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn utc_offset_shifts_which_hour_fires() {
        let schedule = CronSchedule::parse("0 9 * * *").unwrap();
        // 08:30 UTC is 09:30 local at +01:00, so 09:00 local has already
        // passed today; the next 09:00 local fire is tomorrow, i.e.
        // 08:00 UTC the next day.
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 8, 30, 0).unwrap();
        let next = schedule.next_fire_with_offset(now, 60).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 8, 0, 0).unwrap());
    }
}
