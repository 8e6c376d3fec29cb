//! Command types for the tallyd protocol

use chrono::{DateTime, FixedOffset};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_util::{ClientId, MeterId, SeriesId};

use crate::{ClientRole, HealthStatus, SeriesView, ServiceStateSnapshot, API_VERSION};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    SeriesNotFound,
    MeterNotFound,
    InvalidValue,
    PermissionDenied,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Get all series
    GetState,

    /// Get one series
    GetSeries { series_id: SeriesId },

    /// Push a raw reading (source meters), increment (counter meters) or
    /// heartbeat (time meters, value ignored) to every series of a meter.
    /// The value is parsed by the service; `unknown` and `unavailable` are
    /// accepted and ignored.
    PushValue { meter_id: MeterId, value: String },

    /// Set the activity condition of a meter
    SetCondition { meter_id: MeterId, active: bool },

    /// Overwrite the accumulated value of a series
    Calibrate { series_id: SeriesId, value: Decimal },

    /// Reset a series now, or at `at` if it lies in the future
    Reset {
        series_id: SeriesId,
        #[serde(default)]
        at: Option<DateTime<FixedOffset>>,
    },

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    UnsubscribeEvents,

    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    State(ServiceStateSnapshot),
    Series(SeriesView),
    ValueAccepted { series_updated: usize },
    ConditionSet { series_updated: usize },
    Calibrated(SeriesView),
    ResetDone(SeriesView),
    ResetScheduled {
        series_id: SeriesId,
        at: DateTime<FixedOffset>,
    },
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = Request::new(1, Command::GetState);
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.request_id, 1);
        assert!(matches!(parsed.command, Command::GetState));
    }

    #[test]
    fn reset_without_instant_parses() {
        let json = r#"{"request_id":7,"api_version":1,"command":{"type":"reset","series_id":"boiler.day"}}"#;
        let parsed: Request = serde_json::from_str(json).unwrap();
        match parsed.command {
            Command::Reset { series_id, at } => {
                assert_eq!(series_id.as_str(), "boiler.day");
                assert!(at.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn reset_with_instant_parses() {
        let json = r#"{"type":"reset","series_id":"boiler.day","at":"2024-03-10T03:00:00-07:00"}"#;
        let parsed: Command = serde_json::from_str(json).unwrap();
        let Command::Reset { at: Some(at), .. } = parsed else {
            panic!("expected a reset with an instant");
        };
        assert_eq!(at.to_rfc3339(), "2024-03-10T03:00:00-07:00");
    }

    #[test]
    fn calibrate_accepts_string_decimal() {
        let json = r#"{"type":"calibrate","series_id":"boiler.day","value":"95.50"}"#;
        let parsed: Command = serde_json::from_str(json).unwrap();
        let Command::Calibrate { value, .. } = parsed else {
            panic!("expected calibrate");
        };
        assert_eq!(value.to_string(), "95.50");
    }

    #[test]
    fn error_response_serialization() {
        let resp = Response::error(3, ErrorInfo::new(ErrorCode::SeriesNotFound, "no such series"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("series_not_found"));
    }
}
