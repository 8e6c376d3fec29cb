//! Audit event types

use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_api::ResetReason;
use tally_util::SeriesId;

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// Configuration loaded at startup
    ConfigLoaded { meter_count: usize, series_count: usize },

    /// A series archived its value
    SeriesReset {
        series_id: SeriesId,
        reason: ResetReason,
        prev_measured_value: Decimal,
    },

    /// An operator scheduled a reset for later
    ResetScheduled {
        series_id: SeriesId,
        at: DateTime<FixedOffset>,
    },

    /// An operator overwrote the accumulated value
    Calibrated {
        series_id: SeriesId,
        old_value: Decimal,
        new_value: Decimal,
    },

    /// A saved record could not be restored; the series started fresh
    RestoreFailed { series_id: SeriesId, error: String },

    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: Utc::now(),
            event,
        }
    }
}
