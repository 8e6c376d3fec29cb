//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tally_api::{MeterKind, StateClass};

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Global service settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Configured meters
    #[serde(default)]
    pub meters: Vec<RawMeter>,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path
    pub socket_path: Option<PathBuf>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// IANA timezone all periods and time windows are evaluated in (default: UTC)
    pub timezone: Option<String>,

    /// How often time meters are brought up to date, in seconds (default: 60)
    pub heartbeat_seconds: Option<u64>,
}

/// Raw meter definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawMeter {
    /// Unique stable ID
    pub id: String,

    pub kind: MeterKind,

    /// Name of the external reading a source meter follows (informational)
    pub source: Option<String>,

    /// Description of the external activity condition. When set, the meter
    /// waits for a `set_condition` before measuring; when absent the
    /// condition is always active.
    pub condition: Option<String>,

    /// Recurring time window the meter is allowed to measure in
    #[serde(default)]
    pub when: Option<RawTimeWindow>,

    /// Output series, one per reset pattern
    #[serde(default)]
    pub series: Vec<RawSeries>,
}

/// Time window
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawTimeWindow {
    /// Days of week: "all", "weekdays", "weekends", or a list of indices
    /// (0 = Monday) or names like ["mon", "tue"]
    #[serde(default = "default_days")]
    pub days: RawDays,

    /// Start time (HH:MM:SS, inclusive)
    #[serde(default = "default_midnight")]
    pub from: String,

    /// End time (HH:MM:SS, exclusive)
    #[serde(default = "default_midnight")]
    pub till: String,
}

/// Days specification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawDays {
    Preset(String),
    List(Vec<RawDay>),
}

/// A single day: an index or a name
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawDay {
    Index(u8),
    Name(String),
}

/// Raw series definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSeries {
    /// Name, unique within the meter
    pub name: String,

    /// Reset pattern: alias, cron expression, or sentinel (default: noreset)
    pub reset: Option<String>,

    #[serde(default)]
    pub state_class: StateClass,
}

fn default_days() -> RawDays {
    RawDays::Preset("all".to_string())
}

fn default_midnight() -> String {
    "00:00:00".to_string()
}
