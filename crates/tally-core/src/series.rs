//! One metered series: a meter, its period and its gate

use chrono::DateTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;
use tally_api::{GatingState, MeterKind, ResetReason, SeriesView, StateClass};
use tally_config::{MeterConfig, SeriesConfig};
use tally_util::{Clock, MeterId, SeriesId};
use tracing::{debug, info, warn};

use crate::{
    CoreEvent, GateInputs, Meter, Period, RECORD_VERSION, RecordError, StoredSeriesData,
    Transition, migrate_record,
};

/// An independent metering unit, addressed by its [`SeriesId`]
#[derive(Debug, Clone)]
pub struct MeteredSeries {
    id: SeriesId,
    meter_id: MeterId,
    state_class: StateClass,
    meter: Meter,
    period: Period,
    condition_active: bool,
    time_window_active: bool,
    state: GatingState,
    last_good_value: Option<Decimal>,
}

impl MeteredSeries {
    /// A fresh series. The meter starts right away if the gate is open.
    pub fn new(
        meter: &MeterConfig,
        series: &SeriesConfig,
        clock: Arc<dyn Clock>,
        condition_active: bool,
        time_window_active: bool,
    ) -> Self {
        let now = clock.now();
        let mut unit = Self {
            id: series.id.clone(),
            meter_id: meter.id.clone(),
            state_class: series.state_class,
            meter: Meter::new(meter.kind, clock),
            period: Period::new(series.reset.clone(), &now),
            condition_active,
            time_window_active,
            state: GatingState::InitializingSource,
            last_good_value: None,
        };
        unit.state = unit.gate().evaluate();
        if unit.state == GatingState::Measuring {
            unit.meter.start();
        }
        unit
    }

    /// Bring a series back from its persisted record.
    ///
    /// Callers decide what to do with a corrupt record; nothing here falls
    /// back to zeros.
    pub fn restore(
        meter: &MeterConfig,
        series: &SeriesConfig,
        clock: Arc<dyn Clock>,
        record: Value,
    ) -> Result<Self, RecordError> {
        let tz = clock.timezone();
        let now = clock.now();
        let stored = migrate_record(record, tz)?;
        let mut restored = Meter::from_data(meter.kind, &stored.meter_data, clock)?;
        let mut time_window_active = stored.time_window_active;

        // Downtime only counts while the time window was open
        if let Some(last_seen) = restored.last_seen() {
            let counted = meter.time_window.active_duration(&last_seen, &now);
            time_window_active = meter.time_window.is_active(&now);
            debug!(
                series_id = %series.id,
                last_seen = %last_seen,
                counted_seconds = counted.num_seconds(),
                "Catching up on downtime"
            );
            restored.resume_after_downtime(counted, time_window_active);
        }

        let period = Period::restore(
            series.reset.clone(),
            &now,
            stored.last_reset.map(|t| t.with_timezone(&tz)),
            stored.next_reset.map(|t| t.with_timezone(&tz)),
        );

        let mut unit = Self {
            id: series.id.clone(),
            meter_id: meter.id.clone(),
            state_class: series.state_class,
            last_good_value: restored.source_value(),
            meter: restored,
            period,
            condition_active: stored.active,
            time_window_active,
            state: GatingState::InitializingSource,
        };
        unit.state = unit.gate().evaluate();

        // A legacy source meter keeps its session until the first reading
        let should_measure = unit.state == GatingState::Measuring;
        if should_measure != unit.meter.measuring()
            && unit.state != GatingState::InitializingSource
        {
            warn!(
                series_id = %unit.id,
                state = %unit.state,
                measuring = unit.meter.measuring(),
                "Restored meter disagrees with its gate, following the gate"
            );
            if should_measure {
                unit.meter.start();
            } else {
                unit.meter.stop();
            }
        }

        debug!(
            series_id = %unit.id,
            state = %unit.state,
            measured_value = %unit.meter.measured_value(),
            "Series restored"
        );
        Ok(unit)
    }

    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    pub fn meter_id(&self) -> &MeterId {
        &self.meter_id
    }

    pub fn kind(&self) -> MeterKind {
        self.meter.kind()
    }

    pub fn state(&self) -> GatingState {
        self.state
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn period(&self) -> &Period {
        &self.period
    }

    pub fn condition_active(&self) -> bool {
        self.condition_active
    }

    pub fn time_window_active(&self) -> bool {
        self.time_window_active
    }

    /// Next instant at which this series resets on its own
    pub fn next_reset(&self) -> Option<DateTime<Tz>> {
        self.period.end()
    }

    fn gate(&self) -> GateInputs {
        GateInputs {
            kind: self.meter.kind(),
            has_source_value: self.meter.has_source_value(),
            condition_active: self.condition_active,
            time_window_active: self.time_window_active,
        }
    }

    /// Handle a pushed value. `None` stands for an unusable reading or a
    /// plain heartbeat: nothing accumulates from it except elapsed time.
    pub fn on_value(
        &mut self,
        value: Option<Decimal>,
        now: &DateTime<Tz>,
        events: &mut Vec<CoreEvent>,
    ) {
        let old_state = self.state;

        let accepted = match value {
            Some(value) if self.source_has_reset(value) => {
                info!(
                    series_id = %self.id,
                    previous = ?self.meter.source_value(),
                    reading = %value,
                    "Source reset detected"
                );
                self.meter.handle_source_reset(value)
            }
            Some(value) => self.meter.update(Some(value)),
            None => self.meter.update(None),
        };
        match value {
            Some(value) if accepted => self.last_good_value = Some(value),
            Some(value) => warn!(
                series_id = %self.id,
                value = %value,
                measured_value = %self.meter.measured_value(),
                "Value would overflow the measured value, ignoring"
            ),
            None => {}
        }

        self.roll_period(now, events);

        if old_state == GatingState::InitializingSource {
            self.apply_gate(now, events);
        }
    }

    fn source_has_reset(&self, value: Decimal) -> bool {
        if self.state_class != StateClass::TotalIncreasing
            || self.meter.kind() != MeterKind::Source
        {
            return false;
        }
        self.meter
            .source_value()
            // A drop below 90% of the previous reading means the source restarted
            .and_then(|previous| previous.checked_mul(Decimal::new(9, 1)))
            .is_some_and(|limit| value < limit)
    }

    pub fn on_condition_change(
        &mut self,
        active: bool,
        now: &DateTime<Tz>,
        events: &mut Vec<CoreEvent>,
    ) {
        self.condition_active = active;
        self.apply_gate(now, events);
    }

    pub fn on_time_window_change(
        &mut self,
        active: bool,
        now: &DateTime<Tz>,
        events: &mut Vec<CoreEvent>,
    ) {
        self.time_window_active = active;
        self.apply_gate(now, events);
    }

    /// Scheduler callback: bring time meters up to date and fire a due reset
    pub fn tick(&mut self, now: &DateTime<Tz>, events: &mut Vec<CoreEvent>) {
        if self.meter.kind() == MeterKind::Time {
            self.meter.update(None);
        }
        self.roll_period(now, events);
    }

    fn apply_gate(&mut self, now: &DateTime<Tz>, events: &mut Vec<CoreEvent>) {
        let new_state = self.gate().evaluate();
        let Some(transition) = Transition::between(self.state, new_state) else {
            return;
        };

        if transition.starts_measuring() {
            self.meter.start();
        }
        if transition.stops_measuring() {
            self.meter.stop();
        }
        self.state = new_state;

        info!(
            series_id = %self.id,
            from = %transition.from,
            to = %transition.to,
            measured_value = %self.meter.measured_value(),
            "Gating state changed"
        );
        events.push(CoreEvent::GatingChanged {
            series_id: self.id.clone(),
            from: transition.from,
            to: transition.to,
        });

        if transition.stops_measuring() && self.period.pattern().is_session() {
            self.reset_now(now, ResetReason::SessionEnded, events);
        }
    }

    fn roll_period(&mut self, now: &DateTime<Tz>, events: &mut Vec<CoreEvent>) {
        let meter = &mut self.meter;
        let series_id = &self.id;
        let fired = self.period.update(now, self.last_good_value, |value| {
            debug!(series_id = %series_id, last_value = ?value, "Period ended");
            meter.reset();
        });
        if fired {
            self.reset_done(ResetReason::Scheduled, events);
        }
    }

    fn reset_now(
        &mut self,
        now: &DateTime<Tz>,
        reason: ResetReason,
        events: &mut Vec<CoreEvent>,
    ) {
        self.meter.reset();
        self.period.mark_reset(now);
        self.reset_done(reason, events);
    }

    fn reset_done(&mut self, reason: ResetReason, events: &mut Vec<CoreEvent>) {
        let prev_measured_value = self.meter.prev_measured_value();
        info!(
            series_id = %self.id,
            reason = ?reason,
            prev_measured_value = %prev_measured_value,
            next_reset = ?self.period.end(),
            "Series reset"
        );
        events.push(CoreEvent::SeriesReset {
            series_id: self.id.clone(),
            reason,
            prev_measured_value,
        });
    }

    /// Overwrite the accumulated value
    pub fn calibrate(&mut self, value: Decimal, events: &mut Vec<CoreEvent>) {
        info!(series_id = %self.id, value = %value, "Calibrating");
        self.meter.calibrate(value);
        events.push(CoreEvent::Calibrated {
            series_id: self.id.clone(),
            value,
        });
    }

    /// Reset now when `at` is absent or not in the future, otherwise defer
    /// the next reset to `at`.
    pub fn reset_at(
        &mut self,
        at: Option<DateTime<Tz>>,
        now: &DateTime<Tz>,
        events: &mut Vec<CoreEvent>,
    ) {
        match at {
            Some(at) if at > *now => {
                info!(series_id = %self.id, at = %at, "Reset scheduled");
                self.period.defer_until(at);
                events.push(CoreEvent::ResetScheduled {
                    series_id: self.id.clone(),
                    at,
                });
            }
            _ => self.reset_now(now, ResetReason::Manual, events),
        }
    }

    pub fn to_stored(&self) -> StoredSeriesData {
        StoredSeriesData {
            version: RECORD_VERSION,
            meter_data: self.meter.to_data(),
            time_window_active: self.time_window_active,
            active: self.condition_active,
            last_reset: self.period.last_reset().map(|t| t.fixed_offset()),
            next_reset: self.period.end().map(|t| t.fixed_offset()),
        }
    }

    pub fn to_record(&self) -> Result<Value, RecordError> {
        self.to_stored().to_value()
    }

    pub fn view(&self) -> SeriesView {
        SeriesView {
            series_id: self.id.clone(),
            meter_id: self.meter_id.clone(),
            kind: self.meter.kind(),
            state: self.state,
            measured_value: self.meter.measured_value(),
            prev_measured_value: self.meter.prev_measured_value(),
            reset_pattern: self.period.pattern().to_string(),
            state_class: self.state_class,
            last_reset: self.period.last_reset().map(|t| t.fixed_offset()),
            next_reset: self.period.end().map(|t| t.fixed_offset()),
        }
    }
}

/// Parse a raw pushed value.
///
/// `unknown`, `unavailable` and anything non-numeric come back as `None`
/// after a warning.
pub fn parse_reading(meter_id: &MeterId, raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" | "unknown" | "unavailable" | "none" | "null" => {
            warn!(meter_id = %meter_id, value = raw, "Value unavailable, ignoring");
            return None;
        }
        _ => {}
    }
    match trimmed
        .parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(trimmed))
    {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(meter_id = %meter_id, value = raw, error = %e, "Value is not a number, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use chrono_tz::Europe::Brussels;
    use tally_util::{ManualClock, ResetPattern, TimeWindow};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Brussels.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap(),
        ))
    }

    fn config(
        kind: MeterKind,
        reset: &str,
        state_class: StateClass,
    ) -> (MeterConfig, SeriesConfig) {
        let id = MeterId::new("boiler");
        let series = SeriesConfig {
            id: SeriesId::for_meter(&id, "s"),
            name: "s".into(),
            reset: reset.parse::<ResetPattern>().unwrap(),
            state_class,
        };
        let meter = MeterConfig {
            id,
            kind,
            source: None,
            condition: None,
            time_window: TimeWindow::always(),
            series: vec![series.clone()],
        };
        (meter, series)
    }

    #[test]
    fn gate_opens_only_when_both_inputs_are_active() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Counter, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), false, false);
        let now = clock.now();
        let mut events = Vec::new();

        assert_eq!(unit.state(), GatingState::WaitingForTimeWindow);
        unit.on_time_window_change(true, &now, &mut events);
        assert_eq!(unit.state(), GatingState::WaitingForCondition);
        assert!(!unit.meter().measuring());

        unit.on_condition_change(true, &now, &mut events);
        assert_eq!(unit.state(), GatingState::Measuring);
        assert!(unit.meter().measuring());

        // Repeating an input is a no-op
        unit.on_condition_change(true, &now, &mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            CoreEvent::GatingChanged {
                to: GatingState::Measuring,
                ..
            }
        ));
    }

    #[test]
    fn time_session_is_anchored_on_the_final_transition_only() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Time, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), false, false);
        let mut events = Vec::new();

        clock.advance(Duration::minutes(10));
        unit.on_time_window_change(true, &clock.now(), &mut events);
        clock.advance(Duration::minutes(10));
        unit.tick(&clock.now(), &mut events);
        assert_eq!(unit.meter().measured_value(), Decimal::ZERO);

        unit.on_condition_change(true, &clock.now(), &mut events);
        clock.advance(Duration::minutes(10));

        // Repeated inputs must not restart the session
        unit.on_condition_change(true, &clock.now(), &mut events);
        unit.on_time_window_change(true, &clock.now(), &mut events);
        clock.advance(Duration::minutes(5));
        unit.tick(&clock.now(), &mut events);

        assert_eq!(unit.meter().measured_value(), dec("900"));
        let started = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    CoreEvent::GatingChanged {
                        to: GatingState::Measuring,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(started, 1);
    }

    #[test]
    fn overflowing_reading_is_ignored() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Counter, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();
        let huge = parse_reading(unit.meter_id(), "79228162514264337593543950335");

        unit.on_value(huge, &now, &mut events);
        unit.on_value(huge, &now, &mut events);
        assert_eq!(unit.meter().measured_value(), Decimal::MAX);

        unit.on_value(Some(dec("-1")), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), Decimal::MAX - dec("1"));
    }

    #[test]
    fn restart_from_huge_source_reading_is_safe() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Source, "noreset", StateClass::TotalIncreasing);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        unit.on_value(Some(Decimal::MAX), &now, &mut events);
        unit.on_value(Some(dec("10")), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), dec("10"));
        assert_eq!(unit.meter().source_value(), Some(dec("10")));
    }

    #[test]
    fn source_waits_for_first_reading() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Source, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        assert_eq!(unit.state(), GatingState::InitializingSource);
        unit.on_value(None, &now, &mut events);
        assert_eq!(unit.state(), GatingState::InitializingSource);

        unit.on_value(Some(dec("100")), &now, &mut events);
        assert_eq!(unit.state(), GatingState::Measuring);
        assert_eq!(unit.meter().measured_value(), Decimal::ZERO);

        unit.on_value(Some(dec("103.5")), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), dec("3.5"));
    }

    #[test]
    fn unusable_value_does_not_accumulate() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Source, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        unit.on_value(Some(dec("10")), &now, &mut events);
        unit.on_value(Some(dec("12")), &now, &mut events);
        unit.on_value(parse_reading(unit.meter_id(), "unavailable"), &now, &mut events);
        unit.on_value(parse_reading(unit.meter_id(), "12,5x"), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), dec("2"));
        assert_eq!(unit.meter().source_value(), Some(dec("12")));
    }

    #[test]
    fn scheduled_reset_on_value_update() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Counter, "day", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let mut events = Vec::new();

        unit.on_value(Some(dec("5")), &clock.now(), &mut events);
        clock.advance(Duration::days(1));
        unit.on_value(Some(dec("2")), &clock.now(), &mut events);

        // The update lands in the old period, then the period rolls over
        assert_eq!(unit.meter().prev_measured_value(), dec("7"));
        assert_eq!(unit.meter().measured_value(), Decimal::ZERO);
        assert_eq!(unit.period().last_reset(), Some(clock.now()));
        assert!(events.iter().any(|e| matches!(
            e,
            CoreEvent::SeriesReset {
                reason: ResetReason::Scheduled,
                ..
            }
        )));
    }

    #[test]
    fn session_pattern_resets_when_measuring_stops() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Counter, "session", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        unit.on_value(Some(dec("4")), &now, &mut events);
        unit.on_condition_change(false, &now, &mut events);

        assert_eq!(unit.meter().prev_measured_value(), dec("4"));
        assert_eq!(unit.meter().measured_value(), Decimal::ZERO);
        assert_eq!(unit.period().last_reset(), Some(now));
        assert!(matches!(
            events.last(),
            Some(CoreEvent::SeriesReset {
                reason: ResetReason::SessionEnded,
                ..
            })
        ));
    }

    #[test]
    fn total_increasing_source_detects_restart() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Source, "noreset", StateClass::TotalIncreasing);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        unit.on_value(Some(dec("500")), &now, &mut events);
        unit.on_value(Some(dec("520")), &now, &mut events);
        // Small dips are taken at face value
        unit.on_value(Some(dec("510")), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), dec("10"));

        unit.on_value(Some(dec("3")), &now, &mut events);
        assert_eq!(unit.meter().measured_value(), dec("13"));
    }

    #[test]
    fn manual_reset_now_past_and_future() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Counter, "noreset", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();

        unit.on_value(Some(dec("3")), &now, &mut events);
        unit.reset_at(None, &now, &mut events);
        assert_eq!(unit.meter().prev_measured_value(), dec("3"));

        unit.on_value(Some(dec("4")), &now, &mut events);
        unit.reset_at(Some(now - Duration::hours(1)), &now, &mut events);
        assert_eq!(unit.meter().prev_measured_value(), dec("4"));

        unit.on_value(Some(dec("5")), &now, &mut events);
        let at = now + Duration::minutes(10);
        unit.reset_at(Some(at), &now, &mut events);
        assert_eq!(unit.next_reset(), Some(at));
        assert_eq!(unit.meter().measured_value(), dec("5"));

        clock.advance(Duration::minutes(10));
        unit.tick(&clock.now(), &mut events);
        assert_eq!(unit.meter().prev_measured_value(), dec("5"));
        assert_eq!(unit.next_reset(), None);
    }

    #[test]
    fn record_round_trip_keeps_gating_and_period() {
        let clock = clock();
        let (meter, series) = config(MeterKind::Source, "day", StateClass::Total);
        let mut unit = MeteredSeries::new(&meter, &series, clock.clone(), true, true);
        let now = clock.now();
        let mut events = Vec::new();
        unit.on_value(Some(dec("1.5")), &now, &mut events);
        unit.on_value(Some(dec("4")), &now, &mut events);
        unit.reset_at(None, &now, &mut events);
        unit.on_value(Some(dec("4.25")), &now, &mut events);

        let record = unit.to_record().unwrap();
        let restored = MeteredSeries::restore(&meter, &series, clock.clone(), record).unwrap();

        assert_eq!(restored.state(), GatingState::Measuring);
        assert_eq!(restored.meter(), unit.meter());
        assert_eq!(restored.period().last_reset(), unit.period().last_reset());
        assert_eq!(restored.next_reset(), unit.next_reset());
        assert_eq!(restored.view(), unit.view());
    }

    #[test]
    fn parse_reading_accepts_numbers_only() {
        let id = MeterId::new("boiler");
        assert_eq!(parse_reading(&id, " 12.50 "), Some(dec("12.5")));
        assert_eq!(parse_reading(&id, "-3"), Some(dec("-3")));
        assert_eq!(parse_reading(&id, "1e3"), Some(dec("1000")));
        assert_eq!(parse_reading(&id, "unknown"), None);
        assert_eq!(parse_reading(&id, ""), None);
        assert_eq!(parse_reading(&id, "abc"), None);
    }
}
