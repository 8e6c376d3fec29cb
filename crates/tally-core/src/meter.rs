//! Value accumulators
//!
//! A meter only knows how to accumulate while it is measuring. Deciding when
//! it measures is the job of the gate owned by its series.

use chrono::{DateTime, Duration, TimeZone};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tally_api::MeterKind;
use tally_util::Clock;

use crate::RecordError;

/// Meter state as it is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterData {
    pub measured_value: Decimal,
    pub prev_measured_value: Decimal,
    pub measuring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start_value: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start_measured_value: Option<Decimal>,
}

/// Adds pushed increments while measuring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterMeter {
    measured_value: Decimal,
    prev_measured_value: Decimal,
    measuring: bool,
}

impl CounterMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&mut self) {
        self.measuring = true;
    }

    fn stop(&mut self) {
        self.measuring = false;
    }

    fn update(&mut self, value: Option<Decimal>) -> bool {
        if self.measuring
            && let Some(increment) = value
        {
            let Some(total) = self.measured_value.checked_add(increment) else {
                return false;
            };
            self.measured_value = total;
        }
        true
    }

    fn reset(&mut self) {
        self.prev_measured_value = std::mem::take(&mut self.measured_value);
    }

    fn calibrate(&mut self, value: Decimal) {
        self.measured_value = value;
    }
}

/// Session anchors shared by the source and time meters.
///
/// While measuring, `measured_value == start_measured + (reading - start_reading)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Session {
    measured_value: Decimal,
    prev_measured_value: Decimal,
    measuring: bool,
    start_reading: Option<Decimal>,
    start_measured: Decimal,
}

impl Session {
    fn start(&mut self, reading: Option<Decimal>) {
        self.measuring = true;
        self.start_reading = reading;
        self.start_measured = self.measured_value;
    }

    fn stop(&mut self, reading: Option<Decimal>) {
        if self.measuring {
            self.follow(reading);
        }
        self.measuring = false;
    }

    /// Returns false, leaving the session untouched, when the reading would
    /// push the measured value out of range.
    fn follow(&mut self, reading: Option<Decimal>) -> bool {
        let Some(reading) = reading else { return true };
        match self.start_reading {
            Some(start) => match self.value_at(start, reading) {
                Some(value) => self.measured_value = value,
                None => return false,
            },
            // Started before any reading: the first one anchors the session
            None => self.start_reading = Some(reading),
        }
        true
    }

    fn value_at(&self, start: Decimal, reading: Decimal) -> Option<Decimal> {
        reading
            .checked_sub(start)
            .and_then(|delta| self.start_measured.checked_add(delta))
    }

    fn reset(&mut self, reading: Option<Decimal>) {
        let measuring = self.measuring;
        if measuring {
            self.stop(reading);
        }
        self.prev_measured_value = std::mem::take(&mut self.measured_value);
        if measuring {
            self.start(reading);
        }
    }

    fn calibrate(&mut self, value: Decimal, reading: Option<Decimal>) {
        self.measured_value = value;
        if self.measuring {
            self.start_reading = reading;
            self.start_measured = value;
        }
    }

    fn to_data(&self, source_value: Option<Decimal>) -> MeterData {
        MeterData {
            measured_value: self.measured_value,
            prev_measured_value: self.prev_measured_value,
            measuring: self.measuring,
            source_value,
            session_start_value: self.start_reading,
            session_start_measured_value: Some(self.start_measured),
        }
    }

    fn from_data(data: &MeterData) -> Result<Self, RecordError> {
        let start_measured = match (data.measuring, data.session_start_measured_value) {
            (_, Some(value)) => value,
            (true, None) => {
                return Err(RecordError::MissingField(
                    "session_start_measured_value".into(),
                ));
            }
            (false, None) => data.measured_value,
        };
        Ok(Self {
            measured_value: data.measured_value,
            prev_measured_value: data.prev_measured_value,
            measuring: data.measuring,
            start_reading: data.session_start_value,
            start_measured,
        })
    }
}

/// Accumulates the change of an external reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMeter {
    session: Session,
    source_value: Option<Decimal>,
}

impl SourceMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_value(&self) -> Option<Decimal> {
        self.source_value
    }

    fn update(&mut self, value: Option<Decimal>) -> bool {
        if self.session.measuring && !self.session.follow(value.or(self.source_value)) {
            return false;
        }
        if let Some(value) = value {
            self.source_value = Some(value);
        }
        true
    }

    /// The source restarted from zero. Keep what was measured so far and
    /// count the new reading on top of it.
    fn handle_source_reset(&mut self, value: Decimal) -> bool {
        if self.session.measuring {
            if self.session.measured_value.checked_add(value).is_none() {
                return false;
            }
            self.session.start_reading = Some(Decimal::ZERO);
            self.session.start_measured = self.session.measured_value;
            self.session.follow(Some(value));
        }
        self.source_value = Some(value);
        true
    }
}

/// Accumulates elapsed seconds read from a clock
#[derive(Clone)]
pub struct TimeMeter {
    session: Session,
    clock: Arc<dyn Clock>,
}

impl TimeMeter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            session: Session::default(),
            clock,
        }
    }

    /// Current clock reading in seconds, microsecond precision
    fn reading(&self) -> Decimal {
        Decimal::new(self.clock.now().timestamp_micros(), 6).normalize()
    }

    /// The instant the running session last caught up with the clock
    fn last_seen(&self) -> Option<DateTime<Tz>> {
        let session = &self.session;
        if !session.measuring {
            return None;
        }
        let start = session.start_reading?;
        let timestamp = session
            .measured_value
            .checked_sub(session.start_measured)
            .and_then(|elapsed| start.checked_add(elapsed))?;
        let micros = timestamp.checked_mul(Decimal::from(1_000_000))?.trunc().to_i64()?;
        self.clock.timezone().timestamp_micros(micros).single()
    }

    fn resume_after_downtime(&mut self, counted: Duration, resume: bool) {
        if let Some(total) = self.session.measured_value.checked_add(seconds(counted)) {
            self.session.measured_value = total;
        }
        self.session.measuring = false;
        if resume {
            let reading = self.reading();
            self.session.start(Some(reading));
        }
    }
}

fn seconds(duration: Duration) -> Decimal {
    duration
        .num_microseconds()
        .map_or(Decimal::ZERO, |micros| Decimal::new(micros, 6).normalize())
}

impl fmt::Debug for TimeMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeMeter")
            .field("session", &self.session)
            .field("timezone", &self.clock.timezone())
            .finish()
    }
}

/// One of the three meter variants
#[derive(Debug, Clone)]
pub enum Meter {
    Counter(CounterMeter),
    Source(SourceMeter),
    Time(TimeMeter),
}

impl Meter {
    /// A fresh meter of the given kind
    pub fn new(kind: MeterKind, clock: Arc<dyn Clock>) -> Self {
        match kind {
            MeterKind::Counter => Meter::Counter(CounterMeter::new()),
            MeterKind::Source => Meter::Source(SourceMeter::new()),
            MeterKind::Time => Meter::Time(TimeMeter::new(clock)),
        }
    }

    pub fn kind(&self) -> MeterKind {
        match self {
            Meter::Counter(_) => MeterKind::Counter,
            Meter::Source(_) => MeterKind::Source,
            Meter::Time(_) => MeterKind::Time,
        }
    }

    pub fn measured_value(&self) -> Decimal {
        match self {
            Meter::Counter(m) => m.measured_value,
            Meter::Source(m) => m.session.measured_value,
            Meter::Time(m) => m.session.measured_value,
        }
    }

    pub fn prev_measured_value(&self) -> Decimal {
        match self {
            Meter::Counter(m) => m.prev_measured_value,
            Meter::Source(m) => m.session.prev_measured_value,
            Meter::Time(m) => m.session.prev_measured_value,
        }
    }

    pub fn measuring(&self) -> bool {
        match self {
            Meter::Counter(m) => m.measuring,
            Meter::Source(m) => m.session.measuring,
            Meter::Time(m) => m.session.measuring,
        }
    }

    /// Whether a source reading has ever been observed. Always true for
    /// meters that do not depend on one.
    pub fn has_source_value(&self) -> bool {
        match self {
            Meter::Source(m) => m.source_value.is_some(),
            _ => true,
        }
    }

    /// Last reading of a source meter
    pub fn source_value(&self) -> Option<Decimal> {
        match self {
            Meter::Source(m) => m.source_value,
            _ => None,
        }
    }

    pub fn start(&mut self) {
        match self {
            Meter::Counter(m) => m.start(),
            Meter::Source(m) => m.session.start(m.source_value),
            Meter::Time(m) => {
                let reading = m.reading();
                m.session.start(Some(reading));
            }
        }
    }

    pub fn stop(&mut self) {
        match self {
            Meter::Counter(m) => m.stop(),
            Meter::Source(m) => m.session.stop(m.source_value),
            Meter::Time(m) => {
                let reading = m.reading();
                m.session.stop(Some(reading));
            }
        }
    }

    /// Feed a value. Counters add it as an increment, source meters take it
    /// as the new reading, time meters ignore it and read their clock.
    ///
    /// Returns false when the value was rejected because the measured value
    /// would overflow. Nothing changes in that case.
    pub fn update(&mut self, value: Option<Decimal>) -> bool {
        match self {
            Meter::Counter(m) => m.update(value),
            Meter::Source(m) => m.update(value),
            Meter::Time(m) => {
                if m.session.measuring {
                    let reading = m.reading();
                    return m.session.follow(Some(reading));
                }
                true
            }
        }
    }

    /// Archive the measured value and restart from zero. A running session
    /// keeps running.
    pub fn reset(&mut self) {
        match self {
            Meter::Counter(m) => m.reset(),
            Meter::Source(m) => m.session.reset(m.source_value),
            Meter::Time(m) => {
                let reading = m.reading();
                m.session.reset(Some(reading));
            }
        }
    }

    pub fn calibrate(&mut self, value: Decimal) {
        match self {
            Meter::Counter(m) => m.calibrate(value),
            Meter::Source(m) => m.session.calibrate(value, m.source_value),
            Meter::Time(m) => {
                let reading = m.reading();
                m.session.calibrate(value, Some(reading));
            }
        }
    }

    /// Only meaningful for source meters; other kinds take a plain update.
    pub fn handle_source_reset(&mut self, value: Decimal) -> bool {
        match self {
            Meter::Source(m) => m.handle_source_reset(value),
            other => other.update(Some(value)),
        }
    }

    /// Instant a running time meter was last brought up to date. `None` for
    /// other kinds and stopped meters.
    pub fn last_seen(&self) -> Option<DateTime<Tz>> {
        match self {
            Meter::Time(m) => m.last_seen(),
            _ => None,
        }
    }

    /// Fold a downtime gap into a restored time meter. Only `counted` of the
    /// gap accumulates; the session then runs on from the current clock
    /// reading when `resume` is set and is stopped otherwise.
    pub fn resume_after_downtime(&mut self, counted: Duration, resume: bool) {
        if let Meter::Time(m) = self {
            m.resume_after_downtime(counted, resume);
        }
    }

    pub fn to_data(&self) -> MeterData {
        match self {
            Meter::Counter(m) => MeterData {
                measured_value: m.measured_value,
                prev_measured_value: m.prev_measured_value,
                measuring: m.measuring,
                source_value: None,
                session_start_value: None,
                session_start_measured_value: None,
            },
            Meter::Source(m) => m.session.to_data(m.source_value),
            Meter::Time(m) => m.session.to_data(None),
        }
    }

    /// Rebuild a meter from persisted data.
    ///
    /// A session meter that was measuring must carry its session anchors.
    pub fn from_data(
        kind: MeterKind,
        data: &MeterData,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RecordError> {
        match kind {
            MeterKind::Counter => Ok(Meter::Counter(CounterMeter {
                measured_value: data.measured_value,
                prev_measured_value: data.prev_measured_value,
                measuring: data.measuring,
            })),
            MeterKind::Source => {
                let session = Session::from_data(data)?;
                if session.measuring
                    && session.start_reading.is_none()
                    && data.source_value.is_some()
                {
                    return Err(RecordError::MissingField("session_start_value".into()));
                }
                Ok(Meter::Source(SourceMeter {
                    session,
                    source_value: data.source_value,
                }))
            }
            MeterKind::Time => {
                let session = Session::from_data(data)?;
                if session.measuring {
                    let Some(start) = session.start_reading else {
                        return Err(RecordError::MissingField("session_start_value".into()));
                    };
                    if !is_timestamp(start, clock.as_ref()) {
                        return Err(RecordError::InvalidValue {
                            field: "session_start_value".into(),
                            value: start.to_string(),
                        });
                    }
                }
                Ok(Meter::Time(TimeMeter { session, clock }))
            }
        }
    }
}

fn is_timestamp(seconds: Decimal, clock: &dyn Clock) -> bool {
    seconds
        .checked_mul(Decimal::from(1_000_000))
        .and_then(|micros| micros.trunc().to_i64())
        .is_some_and(|micros| clock.timezone().timestamp_micros(micros).single().is_some())
}

impl PartialEq for Meter {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_data() == other.to_data()
    }
}
