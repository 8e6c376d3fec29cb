//! Time utilities for tallyd
//!
//! Every time computation takes an explicit [`chrono_tz::Tz`]; nothing reads a
//! process-wide default timezone. The [`Clock`] trait is the single source of
//! "now" for meters and the engine.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `TALLY_MOCK_TIME` environment variable can be set to
//! start the [`SystemClock`] at a fixed wall-clock time in its timezone. The
//! mocked clock then advances at the rate of real time.
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-12-25 14:30:00`)

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "TALLY_MOCK_TIME";

const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of the current time, bound to one timezone.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Tz>;

    fn timezone(&self) -> Tz;
}

/// Real system time, optionally shifted by `TALLY_MOCK_TIME`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    tz: Tz,
    offset: Option<Duration>,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            offset: mock_time_offset(tz),
        }
    }

    pub fn is_mock_time_active(&self) -> bool {
        self.offset.is_some()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        let real_now = Utc::now().with_timezone(&self.tz);
        match self.offset {
            Some(offset) => real_now + offset,
            None => real_now,
        }
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

#[cfg(debug_assertions)]
fn mock_time_offset(tz: Tz) -> Option<Duration> {
    let mock_time_str = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
    match NaiveDateTime::parse_from_str(&mock_time_str, MOCK_TIME_FORMAT) {
        Ok(naive) => {
            let mock_dt = resolve_local(tz, naive);
            let offset = mock_dt.signed_duration_since(Utc::now());
            tracing::info!(
                mock_time = %mock_time_str,
                timezone = %tz,
                offset_secs = offset.num_seconds(),
                "Mock time enabled"
            );
            Some(offset)
        }
        Err(_) => {
            tracing::warn!(
                mock_time = %mock_time_str,
                expected_format = MOCK_TIME_FORMAT,
                "Invalid mock time format"
            );
            None
        }
    }
}

#[cfg(not(debug_assertions))]
fn mock_time_offset(_tz: Tz) -> Option<Duration> {
    None
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Tz>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Tz>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Tz>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Tz> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timezone(&self) -> Tz {
        self.now().timezone()
    }
}

/// Map a wall-clock label to an instant in `tz`.
///
/// Ambiguous labels (DST fall-back) resolve to their earliest occurrence.
/// Labels inside a DST gap move forward to the first instant that exists.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let mut probe = naive;
            // Real-world gaps are at most a couple of hours wide.
            for _ in 0..(4 * 60) {
                probe += Duration::minutes(1);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return dt,
                    LocalResult::Ambiguous(earliest, _) => return earliest,
                    LocalResult::None => {}
                }
            }
            tz.from_utc_datetime(&naive)
        }
    }
}

/// Whether `naive` names a wall-clock time that does not exist in `tz`.
pub fn is_nonexistent(tz: Tz, naive: NaiveDateTime) -> bool {
    matches!(tz.from_local_datetime(&naive), LocalResult::None)
}

/// Errors raised when building or querying a [`TimeWindow`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeWindowError {
    #[error("at least one day must be provided")]
    EmptyDays,

    #[error("duplicate day: {0}")]
    DuplicateDay(u8),

    #[error("invalid day {0}, expected 0 (Monday) to 6 (Sunday)")]
    InvalidDay(u8),

    #[error("invalid time of day '{0}', expected HH:MM:SS")]
    InvalidTime(String),

    #[error("time window is always active and never changes")]
    AlwaysActive,

    #[error("no active day found within a week")]
    NoActiveDay,
}

/// Time of day with second precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WallClock {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl WallClock {
    pub const MIDNIGHT: WallClock = WallClock {
        hour: 0,
        minute: 0,
        second: 0,
    };

    pub fn new(hour: u8, minute: u8, second: u8) -> Option<Self> {
        if hour < 24 && minute < 60 && second < 60 {
            Some(Self {
                hour,
                minute,
                second,
            })
        } else {
            None
        }
    }

    /// Parse `HH:MM:SS`
    pub fn parse(s: &str) -> Result<Self, TimeWindowError> {
        let invalid = || TimeWindowError::InvalidTime(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.len() != 2) {
            return Err(invalid());
        }
        let hour: u8 = parts[0].parse().map_err(|_| invalid())?;
        let minute: u8 = parts[1].parse().map_err(|_| invalid())?;
        let second: u8 = parts[2].parse().map_err(|_| invalid())?;
        Self::new(hour, minute, second).ok_or_else(invalid)
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_num_seconds_from_midnight_opt(self.as_seconds_from_midnight(), 0)
            .unwrap_or(NaiveTime::MIN)
    }

    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
        }
    }

    pub fn as_seconds_from_midnight(&self) -> u32 {
        (self.hour as u32) * 3600 + (self.minute as u32) * 60 + self.second as u32
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

impl PartialOrd for WallClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WallClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_seconds_from_midnight()
            .cmp(&other.as_seconds_from_midnight())
    }
}

/// Days of the week mask. Bit 0 is Monday, bit 6 is Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const ALL_DAYS: DaysOfWeek = DaysOfWeek(0x7F);

    /// Build from weekday indices (0 = Monday .. 6 = Sunday).
    pub fn from_indices(days: &[u8]) -> Result<Self, TimeWindowError> {
        if days.is_empty() {
            return Err(TimeWindowError::EmptyDays);
        }
        let mut mask = 0u8;
        for &day in days {
            if day > 6 {
                return Err(TimeWindowError::InvalidDay(day));
            }
            let bit = 1 << day;
            if mask & bit != 0 {
                return Err(TimeWindowError::DuplicateDay(day));
            }
            mask |= bit;
        }
        Ok(Self(mask))
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        self.0 & (1 << weekday.num_days_from_monday()) != 0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn indices(&self) -> Vec<u8> {
        (0..7).filter(|d| self.0 & (1 << d) != 0).collect()
    }
}

/// A recurring activity interval: a set of weekdays and a time-of-day range.
///
/// The range is `[start, end)`. When `start >= end` the window crosses midnight
/// and the part after midnight belongs to the day the window started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeWindow {
    days: DaysOfWeek,
    start: WallClock,
    end: WallClock,
    always_active: bool,
}

impl TimeWindow {
    pub fn new(days: &[u8], start: WallClock, end: WallClock) -> Result<Self, TimeWindowError> {
        let days = DaysOfWeek::from_indices(days)?;
        let always_active =
            days.len() == 7 && start == WallClock::MIDNIGHT && end == WallClock::MIDNIGHT;
        Ok(Self {
            days,
            start,
            end,
            always_active,
        })
    }

    /// Every day, all day.
    pub fn always() -> Self {
        Self {
            days: DaysOfWeek::ALL_DAYS,
            start: WallClock::MIDNIGHT,
            end: WallClock::MIDNIGHT,
            always_active: true,
        }
    }

    pub fn days(&self) -> DaysOfWeek {
        self.days
    }

    pub fn start(&self) -> WallClock {
        self.start
    }

    pub fn end(&self) -> WallClock {
        self.end
    }

    pub fn always_active(&self) -> bool {
        self.always_active
    }

    pub fn is_active(&self, now: &DateTime<Tz>) -> bool {
        if self.always_active {
            return true;
        }
        let time = WallClock::from_naive_time(now.time());
        let weekday = now.weekday();
        if self.start < self.end {
            time >= self.start && time < self.end && self.days.contains(weekday)
        } else if time >= self.start {
            self.days.contains(weekday)
        } else if time < self.end {
            self.days.contains(weekday.pred())
        } else {
            false
        }
    }

    /// The next instant at which [`TimeWindow::is_active`] may flip.
    pub fn next_change(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>, TimeWindowError> {
        if self.always_active {
            return Err(TimeWindowError::AlwaysActive);
        }
        let tz = now.timezone();
        let today = now.date_naive();
        let time = WallClock::from_naive_time(now.time());

        if self.is_active(now) {
            let day = if time < self.end {
                today
            } else {
                today + Duration::days(1)
            };
            return Ok(self.at(tz, day, self.end));
        }

        if time < self.start && self.days.contains(now.weekday()) {
            return Ok(self.at(tz, today, self.start));
        }

        (1..=7)
            .map(|ahead| today + Duration::days(ahead))
            .find(|day| self.days.contains(day.weekday()))
            .map(|day| self.at(tz, day, self.start))
            .ok_or(TimeWindowError::NoActiveDay)
    }

    /// How long the window is active within `[from, until)`
    pub fn active_duration(&self, from: &DateTime<Tz>, until: &DateTime<Tz>) -> Duration {
        let mut total = Duration::zero();
        let mut at = *from;
        while at < *until {
            let next = match self.next_change(&at) {
                Ok(next) if next > at => next.min(*until),
                _ => *until,
            };
            if self.is_active(&at) {
                total = total + (next - at);
            }
            at = next;
        }
        total
    }

    fn at(&self, tz: Tz, day: NaiveDate, time: WallClock) -> DateTime<Tz> {
        resolve_local(tz, day.and_time(time.to_naive_time()))
    }
}
