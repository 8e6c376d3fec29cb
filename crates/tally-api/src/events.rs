//! Event types for tallyd -> client streaming

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_util::SeriesId;

use crate::{GatingState, ResetReason, ServiceStateSnapshot, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<FixedOffset>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(timestamp: DateTime<FixedOffset>, payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp,
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Full state snapshot (sent on subscribe and after resets)
    StateChanged(ServiceStateSnapshot),

    /// A series started or stopped measuring, or changed what it waits for
    GatingChanged {
        series_id: SeriesId,
        from: GatingState,
        to: GatingState,
    },

    /// A series archived its value and restarted from zero
    SeriesReset {
        series_id: SeriesId,
        reason: ResetReason,
        prev_measured_value: Decimal,
    },

    /// A deferred reset was scheduled
    ResetScheduled {
        series_id: SeriesId,
        at: DateTime<FixedOffset>,
    },

    Calibrated {
        series_id: SeriesId,
        value: Decimal,
    },

    /// Service is shutting down
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00+01:00").unwrap();
        let event = Event::new(
            now,
            EventPayload::SeriesReset {
                series_id: SeriesId::new("boiler.day"),
                reason: ResetReason::Scheduled,
                prev_measured_value: "12.5".parse().unwrap(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"series_reset\""));
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.api_version, API_VERSION);
        assert_eq!(parsed.timestamp, now);
        assert!(matches!(parsed.payload, EventPayload::SeriesReset { .. }));
    }
}
