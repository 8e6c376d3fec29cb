//! Strongly-typed identifiers for tallyd

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a configured meter (one source, condition and time window)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeterId(String);

impl MeterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MeterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one output series: a meter paired with one reset pattern.
///
/// Rendered as `<meter>.<series>`; this is the key records are persisted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId(String);

impl SeriesId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn for_meter(meter: &MeterId, series: &str) -> Self {
        Self(format!("{}.{}", meter.as_str(), series))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SeriesId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SeriesId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a connected IPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_id_joins_meter_and_series() {
        let meter = MeterId::new("heating");
        assert_eq!(SeriesId::for_meter(&meter, "day").as_str(), "heating.day");
    }

    #[test]
    fn client_id_uniqueness() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = SeriesId::new("heating.week");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"heating.week\"");
        let parsed: SeriesId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
