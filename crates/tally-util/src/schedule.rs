//! Reset recurrence patterns
//!
//! A reset pattern is either a sentinel (`noreset`, `forever`, `none`,
//! `session`), a named alias (`hour`, `day`, `week`, `month`, `year`) or a
//! five-field cron expression:
//!
//! ```text
//! minute  hour  day-of-month  month  day-of-week
//! 0-59    0-23  1-31          1-12   0-7 (0 and 7 are Sunday)
//! ```
//!
//! Fields accept `*`, lists (`1,15`), ranges (`1-5`), steps (`*/15`, `8-18/2`)
//! and three-letter month and weekday names. When both day fields are
//! restricted a day matches if either one does.
//!
//! Boundaries are enumerated as wall-clock labels in an explicit timezone. A
//! label that does not exist (spring forward) is skipped when the hour field is
//! `*`, so an hourly pattern yields exactly one boundary per existing hour
//! label; otherwise it fires at the first instant after the gap. A label that
//! happens twice (fall back) fires once, at its first occurrence.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::time::{is_nonexistent, resolve_local};

/// How far ahead or back a boundary is searched for. Covers the eight-year
/// gap between leap days around 2100.
const MAX_SEARCH_DAYS: i64 = 366 * 9;

/// Errors raised when parsing a reset pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 5 cron fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("cron expression '{0}' can never fire")]
    NeverFires(String),

    #[error("empty reset pattern")]
    Empty,
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

impl FieldSpec {
    fn value(&self, token: &str) -> Result<u32, ScheduleError> {
        let lower = token.to_ascii_lowercase();
        if let Some(idx) = self.names.iter().position(|n| *n == lower) {
            // Month names start at 1, weekday names at 0.
            return Ok(idx as u32 + self.min);
        }
        let value: u32 = token.parse().map_err(|_| self.invalid(token))?;
        if value < self.min || value > self.max {
            return Err(ScheduleError::OutOfRange {
                field: self.name,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }

    fn invalid(&self, value: &str) -> ScheduleError {
        ScheduleError::InvalidField {
            field: self.name,
            value: value.to_string(),
        }
    }

    /// Parse one field into a bitmask of allowed values.
    fn parse(&self, field: &str) -> Result<u64, ScheduleError> {
        let mut mask = 0u64;
        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| self.invalid(field))?;
                    if step == 0 {
                        return Err(self.invalid(field));
                    }
                    (range, step)
                }
                None => (item, 1),
            };

            let (lo, hi) = if range == "*" {
                (self.min, self.max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                let (lo, hi) = (self.value(lo)?, self.value(hi)?);
                if lo > hi {
                    return Err(self.invalid(field));
                }
                (lo, hi)
            } else {
                let lo = self.value(range)?;
                // `5/15` means "from 5 to the end, every 15"
                let hi = if step > 1 { self.max } else { lo };
                (lo, hi)
            };

            let mut v = lo;
            while v <= hi {
                mask |= 1 << v;
                v += step;
            }
        }
        Ok(mask)
    }
}

/// A parsed five-field cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
    hour_wildcard: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let mut days_of_week = DAY_OF_WEEK.parse(fields[4])?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        let schedule = Self {
            expression: fields.join(" "),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
            hour_wildcard: fields[1] == "*",
        };

        if !schedule.can_fire() {
            return Err(ScheduleError::NeverFires(schedule.expression));
        }
        Ok(schedule)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first boundary strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let first_day = after.date_naive();
        (0..=MAX_SEARCH_DAYS)
            .map(|offset| first_day + Duration::days(offset))
            .filter(|day| self.day_matches(*day))
            .find_map(|day| {
                self.labels(day)
                    .filter_map(|label| self.instant(tz, label))
                    .find(|instant| instant > after)
            })
    }

    /// The last boundary at or before `at`.
    pub fn prev_at_or_before(&self, at: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = at.timezone();
        let first_day = at.date_naive();
        (0..=MAX_SEARCH_DAYS)
            .map(|offset| first_day - Duration::days(offset))
            .filter(|day| self.day_matches(*day))
            .find_map(|day| {
                let labels: Vec<NaiveDateTime> = self.labels(day).collect();
                labels
                    .into_iter()
                    .rev()
                    .filter_map(|label| self.instant(tz, label))
                    .find(|instant| instant <= at)
            })
    }

    fn labels(&self, day: NaiveDate) -> impl Iterator<Item = NaiveDateTime> + '_ {
        bits(self.hours, 23).flat_map(move |hour| {
            bits(self.minutes, 59).filter_map(move |minute| {
                NaiveTime::from_hms_opt(hour, minute, 0).map(|time| day.and_time(time))
            })
        })
    }

    fn instant(&self, tz: Tz, label: NaiveDateTime) -> Option<DateTime<Tz>> {
        if self.hour_wildcard && is_nonexistent(tz, label) {
            return None;
        }
        Some(resolve_local(tz, label))
    }

    fn day_matches(&self, day: NaiveDate) -> bool {
        if self.months & (1 << day.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << day.day()) != 0;
        let dow = self.days_of_week & (1 << day.weekday().num_days_from_sunday()) != 0;
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn can_fire(&self) -> bool {
        if self.dow_restricted || !self.dom_restricted {
            return true;
        }
        // Longest length of each month, February counted in leap years.
        const MONTH_DAYS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
        bits(self.months, 12).any(|month| {
            bits(self.days_of_month, 31).any(|day| day <= MONTH_DAYS[month as usize - 1])
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn bits(mask: u64, max: u32) -> impl Iterator<Item = u32> {
    (0..=max).filter(move |v| mask & (1 << v) != 0)
}

/// When a series rolls its accumulated value over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetPattern {
    /// `noreset`, `forever`, `none`: only manual resets
    Never,
    /// `session`: reset whenever a measuring session ends
    Session,
    Cron(CronSchedule),
}

impl ResetPattern {
    pub const SENTINELS: [&'static str; 4] = ["noreset", "forever", "none", "session"];

    /// Map a named alias to its cron expression.
    pub fn alias(name: &str) -> Option<&'static str> {
        match name {
            "hour" => Some("0 * * * *"),
            "day" => Some("0 0 * * *"),
            "week" => Some("0 0 * * 1"),
            "month" => Some("0 0 1 * *"),
            "year" => Some("0 0 1 1 *"),
            _ => None,
        }
    }

    pub fn schedule(&self) -> Option<&CronSchedule> {
        match self {
            ResetPattern::Cron(schedule) => Some(schedule),
            _ => None,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, ResetPattern::Session)
    }
}

impl FromStr for ResetPattern {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(ScheduleError::Empty),
            "noreset" | "forever" | "none" => Ok(ResetPattern::Never),
            "session" => Ok(ResetPattern::Session),
            other => {
                let expression = Self::alias(other).unwrap_or(other);
                CronSchedule::parse(expression).map(ResetPattern::Cron)
            }
        }
    }
}

impl fmt::Display for ResetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetPattern::Never => f.write_str("noreset"),
            ResetPattern::Session => f.write_str("session"),
            ResetPattern::Cron(schedule) => schedule.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    const LA: Tz = chrono_tz::America::Los_Angeles;
    const BRUSSELS: Tz = chrono_tz::Europe::Brussels;

    fn at(tz: Tz, y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, m, d, h, min, 0).earliest().unwrap()
    }

    fn cron(pattern: &str) -> CronSchedule {
        match pattern.parse::<ResetPattern>().unwrap() {
            ResetPattern::Cron(schedule) => schedule,
            other => panic!("expected a cron pattern, got {other}"),
        }
    }

    #[test]
    fn test_sentinels_and_aliases() {
        for sentinel in ["noreset", "forever", "none"] {
            assert_eq!(sentinel.parse::<ResetPattern>(), Ok(ResetPattern::Never));
        }
        assert_eq!("session".parse::<ResetPattern>(), Ok(ResetPattern::Session));
        assert_eq!(cron("hour").expression(), "0 * * * *");
        assert_eq!(cron("day").expression(), "0 0 * * *");
        assert_eq!(cron("week").expression(), "0 0 * * 1");
        assert_eq!(cron("month").expression(), "0 0 1 * *");
        assert_eq!(cron("year").expression(), "0 0 1 1 *");
        assert_eq!("".parse::<ResetPattern>(), Err(ScheduleError::Empty));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            CronSchedule::parse("0 0 * *"),
            Err(ScheduleError::FieldCount(4))
        );
        assert!(matches!(
            CronSchedule::parse("60 * * * *"),
            Err(ScheduleError::OutOfRange { field: "minute", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/0 * * * *"),
            Err(ScheduleError::InvalidField { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 5-2 * * *"),
            Err(ScheduleError::InvalidField { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 30 feb *"),
            Err(ScheduleError::NeverFires(_))
        ));
        assert!(CronSchedule::parse("0 0 29 2 *").is_ok());
    }

    #[test]
    fn test_names_steps_and_sunday_alias() {
        let weekend = cron("0 8 * * sat,7");
        // 2024-01-06 is a Saturday
        let next = weekend.next_after(&at(LA, 2024, 1, 5, 12, 0)).unwrap();
        assert_eq!(next, at(LA, 2024, 1, 6, 8, 0));
        let next = weekend.next_after(&next).unwrap();
        assert_eq!(next, at(LA, 2024, 1, 7, 8, 0));

        let quarterly = cron("*/15 9-10 * jan-mar *");
        let next = quarterly.next_after(&at(LA, 2024, 2, 1, 9, 50)).unwrap();
        assert_eq!(next, at(LA, 2024, 2, 1, 10, 0));
    }

    #[test]
    fn test_restricted_day_fields_match_either() {
        // The 15th of each month or any Monday
        let schedule = cron("0 0 15 * mon");
        let mut now = at(BRUSSELS, 2024, 1, 1, 12, 0);
        let mut fired = Vec::new();
        for _ in 0..4 {
            now = schedule.next_after(&now).unwrap();
            fired.push(now.day());
        }
        assert_eq!(fired, vec![8, 15, 22, 29]);
    }

    #[test]
    fn test_daily_window_bounds() {
        let daily = cron("day");
        let now = at(BRUSSELS, 2022, 1, 1, 10, 30);
        assert_eq!(
            daily.prev_at_or_before(&now).unwrap(),
            at(BRUSSELS, 2022, 1, 1, 0, 0)
        );
        assert_eq!(
            daily.next_after(&now).unwrap(),
            at(BRUSSELS, 2022, 1, 2, 0, 0)
        );
        // A boundary instant is its own previous boundary
        let midnight = at(BRUSSELS, 2022, 1, 2, 0, 0);
        assert_eq!(daily.prev_at_or_before(&midnight).unwrap(), midnight);
    }

    #[test]
    fn test_hourly_spring_forward() {
        let hourly = cron("hour");
        assert_eq!(
            hourly.next_after(&at(LA, 2024, 3, 10, 1, 0)).unwrap(),
            at(LA, 2024, 3, 10, 3, 0)
        );
        assert_eq!(
            hourly.next_after(&at(BRUSSELS, 2024, 3, 31, 1, 0)).unwrap(),
            at(BRUSSELS, 2024, 3, 31, 3, 0)
        );
        assert_eq!(
            hourly.next_after(&at(BRUSSELS, 2024, 3, 31, 3, 0)).unwrap(),
            at(BRUSSELS, 2024, 3, 31, 4, 0)
        );
    }

    #[test]
    fn test_hourly_fall_back() {
        let hourly = cron("hour");
        assert_eq!(
            hourly.next_after(&at(LA, 2024, 11, 3, 1, 0)).unwrap(),
            at(LA, 2024, 11, 3, 2, 0)
        );
        assert_eq!(
            hourly.next_after(&at(LA, 2024, 11, 3, 2, 0)).unwrap(),
            at(LA, 2024, 11, 3, 3, 0)
        );
    }

    #[test]
    fn test_one_boundary_per_hour_label() {
        let hourly = cron("hour");
        let count_day = |start: DateTime<Tz>, end: DateTime<Tz>| {
            let mut now = start;
            let mut labels = Vec::new();
            while let Some(next) = hourly.next_after(&now) {
                if next > end {
                    break;
                }
                labels.push(next.hour());
                now = next;
            }
            labels
        };

        let spring = count_day(at(LA, 2024, 3, 10, 0, 0), at(LA, 2024, 3, 11, 0, 0));
        assert_eq!(spring.len(), 23);
        assert!(!spring.contains(&2));

        let fall = count_day(at(LA, 2024, 11, 3, 0, 0), at(LA, 2024, 11, 4, 0, 0));
        assert_eq!(fall.len(), 24);
        assert_eq!(fall.iter().filter(|h| **h == 1).count(), 1);
    }

    #[test]
    fn test_fixed_hour_in_gap_fires_after_gap() {
        let at_two = cron("30 2 * * *");
        assert_eq!(
            at_two.next_after(&at(BRUSSELS, 2024, 3, 31, 0, 0)).unwrap(),
            at(BRUSSELS, 2024, 3, 31, 3, 0)
        );
    }

    #[test]
    fn test_monthly_across_dst() {
        let monthly = cron("month");
        assert_eq!(
            monthly.next_after(&at(LA, 2024, 3, 2, 4, 0)).unwrap(),
            at(LA, 2024, 4, 1, 0, 0)
        );
    }

    #[test]
    fn test_display_round_trips_expression() {
        assert_eq!(cron("week").to_string(), "0 0 * * 1");
        assert_eq!(ResetPattern::Never.to_string(), "noreset");
        assert_eq!(ResetPattern::Session.to_string(), "session");
    }
}
