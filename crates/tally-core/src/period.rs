//! Accounting periods

use chrono::DateTime;
use chrono_tz::Tz;
use tally_util::ResetPattern;
use tracing::{debug, info};

/// The current accounting window of a series: `[start, end)`.
///
/// Boundaries come from the series' reset pattern, evaluated in the
/// timezone of the instants handed in. Sentinel patterns have no automatic
/// boundary, though an operator may still defer a reset onto any pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pattern: ResetPattern,
    start: Option<DateTime<Tz>>,
    end: Option<DateTime<Tz>>,
    last_reset: Option<DateTime<Tz>>,
}

impl Period {
    /// The window containing `now`
    pub fn new(pattern: ResetPattern, now: &DateTime<Tz>) -> Self {
        let mut period = Self {
            pattern,
            start: None,
            end: None,
            last_reset: None,
        };
        period.recompute(now);
        period
    }

    /// Rebuild a period from persisted boundaries.
    ///
    /// A stored `next_reset` is kept when it is earlier than the pattern's
    /// next boundary (an overdue reset still fires) or when it is not on
    /// the pattern at all (an operator deferral). A later boundary that the
    /// pattern itself could have produced is stale after a config change.
    pub fn restore(
        pattern: ResetPattern,
        now: &DateTime<Tz>,
        last_reset: Option<DateTime<Tz>>,
        next_reset: Option<DateTime<Tz>>,
    ) -> Self {
        let mut period = Self::new(pattern, now);
        period.last_reset = last_reset;
        if let Some(stored) = next_reset {
            period.take_stored_end(stored);
        }
        period
    }

    fn take_stored_end(&mut self, stored: DateTime<Tz>) {
        let Some(end) = self.end else {
            self.end = Some(stored);
            return;
        };
        if stored == end {
            return;
        }
        if stored < end {
            debug!(stored = %stored, pattern = %self.pattern, "Keeping earlier stored reset");
            self.end = Some(stored);
        } else if self.is_on_pattern(&stored) {
            info!(
                stored = %stored,
                next_reset = %end,
                pattern = %self.pattern,
                "Stored reset does not match the reset pattern, following the pattern"
            );
        } else {
            debug!(stored = %stored, pattern = %self.pattern, "Keeping deferred reset");
            self.end = Some(stored);
        }
    }

    fn is_on_pattern(&self, at: &DateTime<Tz>) -> bool {
        self.pattern
            .schedule()
            .and_then(|schedule| schedule.prev_at_or_before(at))
            .is_some_and(|boundary| boundary == *at)
    }

    pub fn pattern(&self) -> &ResetPattern {
        &self.pattern
    }

    pub fn start(&self) -> Option<DateTime<Tz>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Tz>> {
        self.end
    }

    pub fn last_reset(&self) -> Option<DateTime<Tz>> {
        self.last_reset
    }

    /// Whether the period is over at `now`
    pub fn is_due(&self, now: &DateTime<Tz>) -> bool {
        self.end.is_some_and(|end| *now >= end)
    }

    /// Roll the period over if it has ended.
    ///
    /// `reset` is called with `value` at most once. The next window is
    /// computed from `now`, so a long downtime yields a single reset.
    pub fn update<T>(&mut self, now: &DateTime<Tz>, value: T, reset: impl FnOnce(T)) -> bool {
        if !self.is_due(now) {
            return false;
        }
        reset(value);
        self.mark_reset(now);
        true
    }

    /// Record a reset that happened outside [`Period::update`]
    pub fn mark_reset(&mut self, now: &DateTime<Tz>) {
        self.last_reset = Some(*now);
        self.recompute(now);
    }

    /// Replace the next boundary with an operator-chosen instant
    pub fn defer_until(&mut self, at: DateTime<Tz>) {
        self.end = Some(at);
    }

    fn recompute(&mut self, now: &DateTime<Tz>) {
        match self.pattern.schedule() {
            Some(schedule) => {
                self.start = schedule.prev_at_or_before(now);
                self.end = schedule.next_after(now);
            }
            None => {
                self.start = None;
                self.end = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, TimeZone, Timelike};
    use chrono_tz::America::Los_Angeles;
    use chrono_tz::Europe::Brussels;

    fn pattern(s: &str) -> ResetPattern {
        s.parse().unwrap()
    }

    #[test]
    fn daily_window_and_single_reset() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 1, 10, 30, 0).unwrap();
        let mut period = Period::new(pattern("day"), &now);
        assert_eq!(
            period.start(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            period.end(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap())
        );
        assert!(period.last_reset().is_none());

        let mut calls = Vec::new();
        let later = Brussels.with_ymd_and_hms(2022, 1, 2, 13, 30, 0).unwrap();
        assert!(period.update(&later, 123, |v| calls.push(v)));
        assert!(!period.update(&later, 456, |v| calls.push(v)));

        assert_eq!(calls, vec![123]);
        assert_eq!(period.last_reset(), Some(later));
        assert_eq!(
            period.start(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(
            period.end(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn no_reset_before_end() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 1, 10, 30, 0).unwrap();
        let mut period = Period::new(pattern("day"), &now);
        let mut called = false;
        period.update(&(now + Duration::hours(5)), (), |_| called = true);
        assert!(!called);
    }

    #[test]
    fn long_downtime_resets_once() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 1, 10, 30, 0).unwrap();
        let mut period = Period::new(pattern("hour"), &now);
        let mut calls = 0;
        let much_later = now + Duration::days(3) + Duration::minutes(10);
        period.update(&much_later, (), |_| calls += 1);
        assert_eq!(calls, 1);
        assert_eq!(
            period.end(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 4, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn sentinels_never_roll_over() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 1, 10, 30, 0).unwrap();
        for sentinel in ["noreset", "forever", "none", "session"] {
            let mut period = Period::new(pattern(sentinel), &now);
            assert!(period.end().is_none());
            assert!(!period.update(&(now + Duration::days(400)), (), |_| {}));
        }
    }

    #[test]
    fn deferred_reset_fires_then_follows_pattern() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 1, 10, 30, 0).unwrap();
        let mut period = Period::new(pattern("noreset"), &now);
        let at = now + Duration::minutes(30);
        period.defer_until(at);
        assert_eq!(period.end(), Some(at));

        assert!(period.update(&at, (), |_| {}));
        assert_eq!(period.last_reset(), Some(at));
        assert!(period.end().is_none());
    }

    #[test]
    fn restore_keeps_overdue_boundary() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 5, 8, 0, 0).unwrap();
        let stored_end = Brussels.with_ymd_and_hms(2022, 1, 2, 0, 0, 0).unwrap();
        let mut period = Period::restore(pattern("day"), &now, None, Some(stored_end));
        assert!(period.is_due(&now));
        assert!(period.update(&now, (), |_| {}));
        assert_eq!(
            period.end(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 6, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn restore_drops_boundary_of_a_longer_pattern() {
        // The record was written while the series reset monthly
        let now = Brussels.with_ymd_and_hms(2022, 1, 5, 8, 20, 0).unwrap();
        let stored_end = Brussels.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap();
        let period = Period::restore(pattern("hour"), &now, None, Some(stored_end));
        assert_eq!(
            period.end(),
            Some(Brussels.with_ymd_and_hms(2022, 1, 5, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn restore_keeps_deferred_boundary() {
        let now = Brussels.with_ymd_and_hms(2022, 1, 5, 8, 20, 0).unwrap();
        let deferred = Brussels.with_ymd_and_hms(2022, 1, 9, 14, 45, 0).unwrap();
        let period = Period::restore(pattern("day"), &now, None, Some(deferred));
        assert_eq!(period.end(), Some(deferred));

        let sentinel = Period::restore(pattern("noreset"), &now, None, Some(deferred));
        assert_eq!(sentinel.end(), Some(deferred));
    }

    #[test]
    fn hourly_resets_follow_hour_labels_across_spring_forward() {
        // 2024-03-31 02:00 does not exist in Brussels
        let mut now = Brussels.with_ymd_and_hms(2024, 3, 31, 0, 30, 0).unwrap();
        let mut period = Period::new(pattern("hour"), &now);
        let mut resets = Vec::new();

        let stop = Brussels.with_ymd_and_hms(2024, 3, 31, 5, 30, 0).unwrap();
        while now < stop {
            now += Duration::minutes(5);
            period.update(&now, now, |at| resets.push(at.hour()));
        }

        assert_eq!(resets, vec![1, 3, 4, 5]);
    }

    #[test]
    fn hourly_resets_across_fall_back() {
        // 01:00-02:00 happens twice in Los Angeles on 2023-11-05
        let mut now = Los_Angeles.with_ymd_and_hms(2023, 11, 5, 0, 30, 0).unwrap();
        let mut period = Period::new(pattern("hour"), &now);
        let mut resets = 0;

        let stop = Los_Angeles.with_ymd_and_hms(2023, 11, 5, 3, 30, 0).unwrap();
        while now < stop {
            now += Duration::minutes(5);
            period.update(&now, (), |_| resets += 1);
        }

        // 01:00 (first occurrence), 02:00, 03:00
        assert_eq!(resets, 3);
    }

    #[test]
    fn monthly_boundary_keeps_local_midnight() {
        let now = Los_Angeles.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let period = Period::new(pattern("month"), &now);
        let start = period.start().unwrap();
        let end = period.end().unwrap();
        assert_eq!((start.day(), start.hour()), (1, 0));
        assert_eq!((end.month(), end.day(), end.hour()), (4, 1, 0));
        // March in Los Angeles loses an hour
        assert_eq!(end - start, Duration::days(31) - Duration::hours(1));
    }
}
