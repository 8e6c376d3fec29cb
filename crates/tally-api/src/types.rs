//! Shared types for the tallyd API

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tally_util::{MeterId, SeriesId};

/// What a meter accumulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// Increments pushed by the value source
    Counter,
    /// Delta of an external numeric reading
    Source,
    /// Elapsed wall-clock time in seconds
    Time,
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MeterKind::Counter => "counter",
            MeterKind::Source => "source",
            MeterKind::Time => "time",
        })
    }
}

/// Whether a series is accumulating, and if not, what it waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingState {
    Measuring,
    WaitingForCondition,
    WaitingForTimeWindow,
    /// Source meters only, until the first reading arrives
    InitializingSource,
}

impl fmt::Display for GatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatingState::Measuring => "measuring",
            GatingState::WaitingForCondition => "waiting for condition",
            GatingState::WaitingForTimeWindow => "waiting for time window",
            GatingState::InitializingSource => "initializing source",
        })
    }
}

/// How the accumulated value of a series behaves downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    /// A total that restarts at each reset
    #[default]
    Total,
    /// A total that only grows; a large drop in the source reading is taken
    /// as the source itself restarting from zero
    TotalIncreasing,
}

/// Why a series was reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    /// Period boundary reached
    Scheduled,
    /// Measuring session ended on a `session` pattern
    SessionEnded,
    /// Operator request
    Manual,
}

/// View of one series for clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesView {
    pub series_id: SeriesId,
    pub meter_id: MeterId,
    pub kind: MeterKind,
    pub state: GatingState,
    pub measured_value: Decimal,
    pub prev_measured_value: Decimal,
    pub reset_pattern: String,
    pub state_class: StateClass,
    pub last_reset: Option<DateTime<FixedOffset>>,
    pub next_reset: Option<DateTime<FixedOffset>>,
}

/// Full service state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStateSnapshot {
    pub api_version: u32,
    pub timezone: String,
    pub series: Vec<SeriesView>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Local operator and value feeders - can push values, calibrate, reset
    Operator,
    /// Read-only observer
    Observer,
}

impl ClientRole {
    pub fn can_push_values(&self) -> bool {
        matches!(self, ClientRole::Operator)
    }

    pub fn can_calibrate(&self) -> bool {
        matches!(self, ClientRole::Operator)
    }

    pub fn can_reset(&self) -> bool {
        matches!(self, ClientRole::Operator)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub config_loaded: bool,
    pub store_ok: bool,
}
