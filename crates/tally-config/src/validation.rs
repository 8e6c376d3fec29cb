//! Configuration validation

use crate::schema::{RawConfig, RawDay, RawDays, RawMeter, RawTimeWindow};
use chrono_tz::Tz;
use std::collections::HashSet;
use tally_util::{ResetPattern, TimeWindow, WallClock};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Meter '{meter_id}': {message}")]
    MeterError { meter_id: String, message: String },

    #[error("Duplicate meter ID: {0}")]
    DuplicateMeterId(String),

    #[error("Meter '{meter_id}': duplicate series name '{name}'")]
    DuplicateSeriesName { meter_id: String, name: String },

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("Invalid day specification: {0}")]
    InvalidDaySpec(String),

    #[error("Series '{series_id}': invalid reset pattern '{pattern}': {message}")]
    InvalidResetPattern {
        series_id: String,
        pattern: String,
        message: String,
    },

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(tz) = &config.service.timezone
        && tz.parse::<Tz>().is_err()
    {
        errors.push(ValidationError::InvalidTimezone(tz.clone()));
    }

    if config.service.heartbeat_seconds == Some(0) {
        errors.push(ValidationError::GlobalError(
            "heartbeat_seconds must be greater than 0".into(),
        ));
    }

    if config.meters.is_empty() {
        errors.push(ValidationError::GlobalError(
            "at least one meter must be configured".into(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for meter in &config.meters {
        if !seen_ids.insert(&meter.id) {
            errors.push(ValidationError::DuplicateMeterId(meter.id.clone()));
        }
    }

    for meter in &config.meters {
        errors.extend(validate_meter(meter));
    }

    errors
}

fn validate_meter(meter: &RawMeter) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let meter_error = |message: &str| ValidationError::MeterError {
        meter_id: meter.id.clone(),
        message: message.into(),
    };

    if meter.id.is_empty() {
        errors.push(meter_error("id cannot be empty"));
    }
    if meter.id.contains('.') {
        errors.push(meter_error("id cannot contain '.'"));
    }

    if let Some(window) = &meter.when {
        errors.extend(validate_time_window(window, &meter.id));
    }

    if meter.series.is_empty() {
        errors.push(meter_error("at least one series must be configured"));
    }

    let mut seen_names = HashSet::new();
    for series in &meter.series {
        if series.name.is_empty() || series.name.contains('.') {
            errors.push(meter_error("series name must be non-empty and cannot contain '.'"));
        }
        if !seen_names.insert(&series.name) {
            errors.push(ValidationError::DuplicateSeriesName {
                meter_id: meter.id.clone(),
                name: series.name.clone(),
            });
        }
        if let Some(pattern) = &series.reset
            && let Err(e) = pattern.parse::<ResetPattern>()
        {
            errors.push(ValidationError::InvalidResetPattern {
                series_id: format!("{}.{}", meter.id, series.name),
                pattern: pattern.clone(),
                message: e.to_string(),
            });
        }
    }

    errors
}

fn validate_time_window(window: &RawTimeWindow, meter_id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let days = match parse_days(&window.days) {
        Ok(days) => Some(days),
        Err(e) => {
            errors.push(ValidationError::InvalidDaySpec(format!("meter '{}': {}", meter_id, e)));
            None
        }
    };

    let from = WallClock::parse(&window.from).map_err(|e| ValidationError::InvalidTimeFormat {
        value: window.from.clone(),
        message: e.to_string(),
    });
    let till = WallClock::parse(&window.till).map_err(|e| ValidationError::InvalidTimeFormat {
        value: window.till.clone(),
        message: e.to_string(),
    });

    match (days, from, till) {
        (Some(days), Ok(from), Ok(till)) => {
            if let Err(e) = TimeWindow::new(&days, from, till) {
                errors.push(ValidationError::InvalidDaySpec(format!(
                    "meter '{}': {}",
                    meter_id, e
                )));
            }
        }
        (_, from, till) => {
            errors.extend(from.err());
            errors.extend(till.err());
        }
    }

    errors
}

/// Parse a days specification into weekday indices (0 = Monday).
///
/// Duplicates are kept so that [`TimeWindow::new`] can reject them.
pub fn parse_days(days: &RawDays) -> Result<Vec<u8>, String> {
    match days {
        RawDays::Preset(preset) => match preset.to_lowercase().as_str() {
            "all" | "every" | "daily" => Ok((0..7).collect()),
            "weekdays" => Ok((0..5).collect()),
            "weekends" => Ok(vec![5, 6]),
            other => Err(format!("Unknown day preset: {}", other)),
        },
        RawDays::List(list) => list.iter().map(parse_day).collect(),
    }
}

fn parse_day(day: &RawDay) -> Result<u8, String> {
    match day {
        RawDay::Index(index) => Ok(*index),
        RawDay::Name(name) => match name.to_lowercase().as_str() {
            "mon" | "monday" => Ok(0),
            "tue" | "tuesday" => Ok(1),
            "wed" | "wednesday" => Ok(2),
            "thu" | "thursday" => Ok(3),
            "fri" | "friday" => Ok(4),
            "sat" | "saturday" => Ok(5),
            "sun" | "sunday" => Ok(6),
            other => other
                .parse::<u8>()
                .map_err(|_| format!("Unknown day: {}", other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawSeries, RawServiceConfig};
    use tally_api::{MeterKind, StateClass};

    fn meter(id: &str, series: &[(&str, Option<&str>)]) -> RawMeter {
        RawMeter {
            id: id.into(),
            kind: MeterKind::Counter,
            source: None,
            condition: None,
            when: None,
            series: series
                .iter()
                .map(|(name, reset)| RawSeries {
                    name: (*name).into(),
                    reset: reset.map(String::from),
                    state_class: StateClass::Total,
                })
                .collect(),
        }
    }

    fn config(meters: Vec<RawMeter>) -> RawConfig {
        RawConfig {
            config_version: 1,
            service: RawServiceConfig::default(),
            meters,
        }
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(
            parse_days(&RawDays::Preset("weekdays".into())).unwrap(),
            vec![0, 1, 2, 3, 4]
        );
        assert_eq!(parse_days(&RawDays::Preset("weekends".into())).unwrap(), vec![5, 6]);
        assert_eq!(
            parse_days(&RawDays::List(vec![
                RawDay::Name("mon".into()),
                RawDay::Name("3".into()),
                RawDay::Index(6),
            ]))
            .unwrap(),
            vec![0, 3, 6]
        );
        assert!(parse_days(&RawDays::List(vec![RawDay::Name("someday".into())])).is_err());
    }

    #[test]
    fn test_valid_config_has_no_errors() {
        let errors = validate_config(&config(vec![meter(
            "kettle",
            &[("day", Some("day")), ("all", None), ("custom", Some("*/5 * * * *"))],
        )]));
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn test_duplicate_id_detection() {
        let errors = validate_config(&config(vec![
            meter("kettle", &[("day", None)]),
            meter("kettle", &[("day", None)]),
        ]));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateMeterId(_))));
    }

    #[test]
    fn test_duplicate_series_and_bad_pattern() {
        let errors = validate_config(&config(vec![meter(
            "kettle",
            &[("day", Some("day")), ("day", Some("0 0 * *"))],
        )]));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateSeriesName { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidResetPattern { .. })));
    }

    #[test]
    fn test_time_window_errors() {
        let mut bad = meter("office", &[("day", Some("day"))]);
        bad.when = Some(RawTimeWindow {
            days: RawDays::List(vec![RawDay::Index(1), RawDay::Index(1)]),
            from: "08:00:00".into(),
            till: "17:00".into(),
        });
        let errors = validate_config(&config(vec![bad.clone()]));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidTimeFormat { .. })));

        bad.when = Some(RawTimeWindow {
            days: RawDays::List(vec![RawDay::Index(1), RawDay::Index(1)]),
            from: "08:00:00".into(),
            till: "17:00:00".into(),
        });
        let errors = validate_config(&config(vec![bad.clone()]));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidDaySpec(msg) if msg.contains("duplicate"))));

        bad.when = Some(RawTimeWindow {
            days: RawDays::List(vec![]),
            from: "08:00:00".into(),
            till: "17:00:00".into(),
        });
        assert!(!validate_config(&config(vec![bad])).is_empty());
    }

    #[test]
    fn test_unknown_timezone() {
        let mut raw = config(vec![meter("kettle", &[("day", None)])]);
        raw.service.timezone = Some("Mars/Olympus_Mons".into());
        let errors = validate_config(&raw);
        assert!(matches!(errors.as_slice(), [ValidationError::InvalidTimezone(_)]));
    }
}
