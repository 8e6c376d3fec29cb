//! Validated settings structures

use crate::schema::{RawConfig, RawMeter, RawServiceConfig, RawTimeWindow};
use crate::validation::parse_days;
use chrono_tz::Tz;
use std::path::PathBuf;
use std::time::Duration;
use tally_api::{MeterKind, StateClass};
use tally_util::{
    MeterId, ResetPattern, SeriesId, TimeWindow, WallClock, data_dir_without_env,
    socket_path_without_env,
};

/// Default interval at which time meters are brought up to date
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Validated settings ready for use by the core engine
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceConfig,
    pub meters: Vec<MeterConfig>,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            meters: raw.meters.into_iter().map(MeterConfig::from_raw).collect(),
        }
    }

    pub fn get_meter(&self, id: &MeterId) -> Option<&MeterConfig> {
        self.meters.iter().find(|m| &m.id == id)
    }

    pub fn series_count(&self) -> usize {
        self.meters.iter().map(|m| m.series.len()).sum()
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub timezone: Tz,
    pub heartbeat: Duration,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(socket_path_without_env),
            data_dir: raw.data_dir.unwrap_or_else(data_dir_without_env),
            timezone: raw
                .timezone
                .and_then(|tz| tz.parse().ok())
                .unwrap_or(Tz::UTC),
            heartbeat: raw
                .heartbeat_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// One configured meter and its output series
#[derive(Debug, Clone)]
pub struct MeterConfig {
    pub id: MeterId,
    pub kind: MeterKind,
    pub source: Option<String>,
    /// Description of the externally evaluated condition, if any
    pub condition: Option<String>,
    pub time_window: TimeWindow,
    pub series: Vec<SeriesConfig>,
}

impl MeterConfig {
    fn from_raw(raw: RawMeter) -> Self {
        let id = MeterId::new(raw.id);
        let series = raw
            .series
            .into_iter()
            .map(|s| SeriesConfig {
                id: SeriesId::for_meter(&id, &s.name),
                reset: s
                    .reset
                    .as_deref()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(ResetPattern::Never),
                name: s.name,
                state_class: s.state_class,
            })
            .collect();

        Self {
            time_window: raw
                .when
                .as_ref()
                .and_then(convert_time_window)
                .unwrap_or_else(TimeWindow::always),
            id,
            kind: raw.kind,
            source: raw.source,
            condition: raw.condition,
            series,
        }
    }

    /// Whether the activity condition is driven externally
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }
}

/// One output series of a meter
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub id: SeriesId,
    pub name: String,
    pub reset: ResetPattern,
    pub state_class: StateClass,
}

fn convert_time_window(raw: &RawTimeWindow) -> Option<TimeWindow> {
    let days = parse_days(&raw.days).ok()?;
    let from = WallClock::parse(&raw.from).ok()?;
    let till = WallClock::parse(&raw.till).ok()?;
    TimeWindow::new(&days, from, till).ok()
}
