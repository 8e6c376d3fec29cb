//! Core events emitted by the engine

use chrono::DateTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use tally_api::{GatingState, ResetReason};
use tally_util::{MeterId, SeriesId};

/// Events emitted by the core engine
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A series changed gating state
    GatingChanged {
        series_id: SeriesId,
        from: GatingState,
        to: GatingState,
    },

    /// A series archived its value
    SeriesReset {
        series_id: SeriesId,
        reason: ResetReason,
        prev_measured_value: Decimal,
    },

    /// A reset was deferred to a future instant
    ResetScheduled {
        series_id: SeriesId,
        at: DateTime<Tz>,
    },

    Calibrated {
        series_id: SeriesId,
        value: Decimal,
    },

    /// The time window of a meter opened or closed
    TimeWindowChanged {
        meter_id: MeterId,
        active: bool,
    },
}

impl CoreEvent {
    /// Why a series reset, if this is a reset
    pub fn reset_reason(&self) -> Option<ResetReason> {
        match self {
            CoreEvent::SeriesReset { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
