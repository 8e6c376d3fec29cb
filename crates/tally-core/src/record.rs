//! Persisted series records and their migration
//!
//! Records written by this version look like
//!
//! ```json
//! {
//!   "version": 2,
//!   "meter_data": { "measured_value": "1.5", "prev_measured_value": "0", "measuring": true, ... },
//!   "time_window_active": true,
//!   "active": true,
//!   "last_reset": "2024-01-01T00:00:00+01:00",
//!   "next_reset": "2024-01-02T00:00:00+01:00"
//! }
//! ```
//!
//! Older records come in two shapes. The first carries the same fields without
//! `version`, sometimes with the condition flag named `condition_active`. The
//! oldest one is flat: meter fields at the top level, a `state` string and
//! `period_last_reset`/`period_end` timestamps. [`migrate_record`] maps all of
//! them to [`StoredSeriesData`].

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use tally_api::GatingState;
use thiserror::Error;
use tracing::warn;

use crate::MeterData;

/// Version written by [`StoredSeriesData`]
pub const RECORD_VERSION: u32 = 2;

const CONDITION_FIELD: &str = "active";
const LEGACY_CONDITION_FIELD: &str = "condition_active";

/// A persisted record could not be turned into a series
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("record is empty")]
    Empty,

    #[error("record is not an object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("invalid timestamp in '{field}': {value}")]
    InvalidTimestamp { field: String, value: String },

    #[error("invalid value in '{field}': {value}")]
    InvalidValue { field: String, value: String },

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u64),

    #[error("malformed record: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for RecordError {
    fn from(e: serde_json::Error) -> Self {
        RecordError::Malformed(e.to_string())
    }
}

/// Everything needed to bring a series back after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSeriesData {
    pub version: u32,
    pub meter_data: MeterData,
    pub time_window_active: bool,
    /// Activity condition
    pub active: bool,
    pub last_reset: Option<DateTime<FixedOffset>>,
    pub next_reset: Option<DateTime<FixedOffset>>,
}

impl StoredSeriesData {
    pub fn to_value(&self) -> Result<Value, RecordError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Map any known record shape to the current one.
///
/// `tz` is used for legacy timestamps that carry no offset.
pub fn migrate_record(record: Value, tz: Tz) -> Result<StoredSeriesData, RecordError> {
    let Value::Object(fields) = record else {
        return Err(if record.is_null() {
            RecordError::Empty
        } else {
            RecordError::NotAnObject
        });
    };
    if fields.is_empty() {
        return Err(RecordError::Empty);
    }

    if let Some(version) = fields.get("version") {
        let version = version
            .as_u64()
            .ok_or_else(|| invalid_value("version", version))?;
        if version > u64::from(RECORD_VERSION) {
            return Err(RecordError::UnsupportedVersion(version));
        }
    }

    let has_meter_data = fields
        .get("meter_data")
        .and_then(Value::as_object)
        .is_some_and(|data| !data.is_empty());

    if has_meter_data {
        from_current(&fields, tz)
    } else {
        from_flat(&fields, tz)
    }
}

fn from_current(fields: &Map<String, Value>, tz: Tz) -> Result<StoredSeriesData, RecordError> {
    let meter_data = meter_data(required(fields, "meter_data")?)?;
    let time_window_active = bool_field(fields, "time_window_active")?;

    let active = match (fields.get(CONDITION_FIELD), fields.get(LEGACY_CONDITION_FIELD)) {
        (Some(active), Some(legacy)) => {
            if active != legacy {
                warn!(
                    active = %active,
                    condition_active = %legacy,
                    "Record carries both condition fields with different values, using 'active'"
                );
            } else {
                warn!("Record carries both condition fields, using 'active'");
            }
            bool_field(fields, CONDITION_FIELD)?
        }
        (Some(_), None) => bool_field(fields, CONDITION_FIELD)?,
        (None, Some(_)) => bool_field(fields, LEGACY_CONDITION_FIELD)?,
        (None, None) => return Err(RecordError::MissingField(CONDITION_FIELD.into())),
    };

    Ok(StoredSeriesData {
        version: RECORD_VERSION,
        meter_data,
        time_window_active,
        active,
        last_reset: timestamp_field(fields, "last_reset", tz)?,
        next_reset: timestamp_field(fields, "next_reset", tz)?,
    })
}

fn from_flat(fields: &Map<String, Value>, tz: Tz) -> Result<StoredSeriesData, RecordError> {
    let state = required(fields, "state")?;
    let state = state.as_str().ok_or_else(|| invalid_value("state", state))?;

    let (time_window_active, active) = match state {
        s if s == GatingState::Measuring.to_string() => (true, true),
        s if s == GatingState::WaitingForTimeWindow.to_string() => (false, true),
        s if s == GatingState::WaitingForCondition.to_string() => (true, false),
        _ => (false, false),
    };
    let measuring = time_window_active && active;

    let meter_data = MeterData {
        measured_value: decimal_field(fields, "measured_value")?,
        prev_measured_value: decimal_field(fields, "prev_measured_value")?,
        measuring,
        source_value: None,
        session_start_value: Some(nullable_decimal(fields, "session_start_reading")?),
        session_start_measured_value: Some(nullable_decimal(fields, "start_measured_value")?),
    };

    Ok(StoredSeriesData {
        version: RECORD_VERSION,
        meter_data,
        time_window_active,
        active,
        last_reset: timestamp_field(fields, "period_last_reset", tz)?,
        next_reset: timestamp_field(fields, "period_end", tz)?,
    })
}

fn required<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a Value, RecordError> {
    fields
        .get(name)
        .ok_or_else(|| RecordError::MissingField(name.into()))
}

fn invalid_value(field: &str, value: &Value) -> RecordError {
    RecordError::InvalidValue {
        field: field.into(),
        value: value.to_string(),
    }
}

fn bool_field(fields: &Map<String, Value>, name: &str) -> Result<bool, RecordError> {
    let value = required(fields, name)?;
    value.as_bool().ok_or_else(|| invalid_value(name, value))
}

/// Parse a JSON number or string as an exact decimal.
///
/// Numbers go through their shortest textual form so that a stored float
/// such as `2880.001408100128` keeps every digit.
fn to_decimal(field: &str, value: &Value) -> Result<Decimal, RecordError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(invalid_value(field, value)),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| invalid_value(field, value))
}

fn decimal_field(fields: &Map<String, Value>, name: &str) -> Result<Decimal, RecordError> {
    to_decimal(name, required(fields, name)?)
}

/// Legacy anchors were allowed to be null, meaning zero
fn nullable_decimal(fields: &Map<String, Value>, name: &str) -> Result<Decimal, RecordError> {
    match required(fields, name)? {
        Value::Null => Ok(Decimal::ZERO),
        value => to_decimal(name, value),
    }
}

fn meter_data(value: &Value) -> Result<MeterData, RecordError> {
    let Value::Object(fields) = value else {
        return Err(invalid_value("meter_data", value));
    };

    let mut normalized = Map::new();
    for (name, value) in fields {
        let value = match value {
            Value::Number(_) => Value::String(to_decimal(name, value)?.to_string()),
            other => other.clone(),
        };
        normalized.insert(name.clone(), value);
    }
    for name in ["measured_value", "prev_measured_value", "measuring"] {
        required(&normalized, name)?;
    }

    Ok(serde_json::from_value(Value::Object(normalized))?)
}

fn timestamp_field(
    fields: &Map<String, Value>,
    name: &str,
    tz: Tz,
) -> Result<Option<DateTime<FixedOffset>>, RecordError> {
    let invalid = || RecordError::InvalidTimestamp {
        field: name.into(),
        value: fields.get(name).map(Value::to_string).unwrap_or_default(),
    };

    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => parse_timestamp_str(s, tz).map(Some).ok_or_else(invalid),
        Some(Value::Number(n)) => {
            let seconds = n.as_f64().ok_or_else(invalid)?;
            from_epoch_seconds(seconds, tz).map(Some).ok_or_else(invalid)
        }
        Some(_) => Err(invalid()),
    }
}

fn parse_timestamp_str(s: &str, tz: Tz) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(tally_util::resolve_local(tz, naive).fixed_offset());
        }
    }
    s.parse::<f64>().ok().and_then(|seconds| from_epoch_seconds(seconds, tz))
}

fn from_epoch_seconds(seconds: f64, tz: Tz) -> Option<DateTime<FixedOffset>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    tz.timestamp_micros(micros as i64)
        .single()
        .map(|dt| dt.fixed_offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Brussels;
    use serde_json::json;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn current_record_round_trip() {
        let stored = StoredSeriesData {
            version: RECORD_VERSION,
            meter_data: MeterData {
                measured_value: dec("12.5"),
                prev_measured_value: dec("3"),
                measuring: true,
                source_value: Some(dec("100.25")),
                session_start_value: Some(dec("90")),
                session_start_measured_value: Some(dec("2.25")),
            },
            time_window_active: true,
            active: true,
            last_reset: Some(DateTime::parse_from_rfc3339("2024-01-01T00:00:00+01:00").unwrap()),
            next_reset: None,
        };

        let value = stored.to_value().unwrap();
        assert_eq!(value["active"], json!(true));
        assert_eq!(migrate_record(value, Brussels).unwrap(), stored);
    }

    #[test]
    fn minimal_counter_record() {
        let record = json!({
            "meter_data": {"measured_value": 3, "prev_measured_value": 1, "measuring": false},
            "time_window_active": false,
            "active": true,
            "last_reset": null,
            "next_reset": null,
        });
        let stored = migrate_record(record, Brussels).unwrap();
        assert_eq!(stored.meter_data.measured_value, dec("3"));
        assert!(stored.active);
        assert!(!stored.time_window_active);
        assert!(stored.next_reset.is_none());
    }

    #[test]
    fn legacy_condition_field_is_accepted() {
        let record = json!({
            "meter_data": {"measured_value": "1", "prev_measured_value": "0", "measuring": false},
            "time_window_active": true,
            "condition_active": false,
        });
        let stored = migrate_record(record, Brussels).unwrap();
        assert!(!stored.active);
    }

    #[test]
    fn both_condition_fields_prefer_active() {
        let record = json!({
            "meter_data": {"measured_value": "1", "prev_measured_value": "0", "measuring": false},
            "time_window_active": true,
            "active": true,
            "condition_active": false,
        });
        assert!(migrate_record(record, Brussels).unwrap().active);
    }

    #[test]
    fn float_values_stay_exact() {
        let record = json!({
            "meter_data": {
                "measured_value": 2880.001408100128,
                "prev_measured_value": 0,
                "measuring": true,
                "session_start_value": 1700000000.123456,
                "session_start_measured_value": 0.1,
            },
            "time_window_active": true,
            "active": true,
        });
        let stored = migrate_record(record, Brussels).unwrap();
        assert_eq!(stored.meter_data.measured_value, dec("2880.001408100128"));
        assert_eq!(
            stored.meter_data.session_start_measured_value,
            Some(dec("0.1"))
        );
    }

    #[test]
    fn flat_legacy_record() {
        let record = json!({
            "measured_value": 25,
            "start_measured_value": null,
            "prev_measured_value": 4,
            "session_start_reading": 1000,
            "period_last_reset": 1704063600.0,
            "period_end": "2024-01-02T00:00:00",
            "state": "waiting for time window",
        });
        let stored = migrate_record(record, Brussels).unwrap();

        assert!(!stored.time_window_active);
        assert!(stored.active);
        assert!(!stored.meter_data.measuring);
        assert_eq!(stored.meter_data.session_start_measured_value, Some(Decimal::ZERO));
        assert_eq!(stored.meter_data.session_start_value, Some(dec("1000")));
        assert_eq!(
            stored.last_reset.unwrap(),
            DateTime::parse_from_rfc3339("2024-01-01T00:00:00+01:00").unwrap()
        );
        assert_eq!(
            stored.next_reset.unwrap(),
            DateTime::parse_from_rfc3339("2024-01-02T00:00:00+01:00").unwrap()
        );
    }

    #[test]
    fn flat_measuring_record_maps_state() {
        let record = json!({
            "measured_value": 1,
            "start_measured_value": 1,
            "prev_measured_value": 0,
            "session_start_reading": 5,
            "period_last_reset": null,
            "period_end": null,
            "state": "measuring",
        });
        let stored = migrate_record(record, Brussels).unwrap();
        assert!(stored.active && stored.time_window_active && stored.meter_data.measuring);
    }

    #[test]
    fn empty_meter_data_falls_back_to_flat_shape() {
        let record = json!({"meter_data": {}, "time_window_active": true, "active": true});
        assert_eq!(
            migrate_record(record, Brussels),
            Err(RecordError::MissingField("state".into()))
        );
    }

    #[test]
    fn corrupt_records_are_distinguishable() {
        assert_eq!(migrate_record(json!({}), Brussels), Err(RecordError::Empty));
        assert_eq!(migrate_record(Value::Null, Brussels), Err(RecordError::Empty));
        assert_eq!(migrate_record(json!([1]), Brussels), Err(RecordError::NotAnObject));

        let missing_flag = json!({
            "meter_data": {"measured_value": "1", "prev_measured_value": "0", "measuring": false},
            "time_window_active": true,
        });
        assert_eq!(
            migrate_record(missing_flag, Brussels),
            Err(RecordError::MissingField("active".into()))
        );

        let bad_timestamp = json!({
            "meter_data": {"measured_value": "1", "prev_measured_value": "0", "measuring": false},
            "time_window_active": true,
            "active": true,
            "last_reset": "yesterday",
        });
        assert!(matches!(
            migrate_record(bad_timestamp, Brussels),
            Err(RecordError::InvalidTimestamp { .. })
        ));

        let missing_value = json!({
            "meter_data": {"prev_measured_value": "0", "measuring": false},
            "time_window_active": true,
            "active": true,
        });
        assert_eq!(
            migrate_record(missing_value, Brussels),
            Err(RecordError::MissingField("measured_value".into()))
        );

        let future = json!({"version": 99, "meter_data": {"measured_value": "1"}});
        assert_eq!(
            migrate_record(future, Brussels),
            Err(RecordError::UnsupportedVersion(99))
        );
    }
}
