//! Core metering engine

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tally_api::{API_VERSION, SeriesView, ServiceStateSnapshot};
use tally_config::{MeterConfig, SeriesConfig, Settings};
use tally_store::{AuditEvent, AuditEventType, Store};
use tally_util::{Clock, MeterId, Result, SeriesId, TallyError, TimeWindow};
use tracing::{debug, info, warn};

use crate::{CoreEvent, MeteredSeries, parse_reading};

/// One configured meter: a time window and condition shared by its series
#[derive(Debug)]
struct MeterGroup {
    id: MeterId,
    time_window: TimeWindow,
    has_condition: bool,
    time_window_active: bool,
    next_window_change: Option<DateTime<Tz>>,
    series: Vec<MeteredSeries>,
}

impl MeterGroup {
    fn refresh_window(&mut self, now: &DateTime<Tz>) {
        self.next_window_change = self.time_window.next_change(now).ok();
    }
}

/// The core metering engine.
///
/// Synchronous and single-threaded: every entry point runs to completion,
/// returns the events it produced and persists the series it touched.
pub struct CoreEngine {
    settings: Settings,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    meters: Vec<MeterGroup>,
}

impl CoreEngine {
    /// Create the engine, restoring every configured series from the store.
    ///
    /// A series whose record cannot be used starts fresh; the failure is
    /// logged and audited.
    pub fn new(settings: Settings, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();

        let _ = store.append_audit(AuditEvent::new(AuditEventType::ConfigLoaded {
            meter_count: settings.meters.len(),
            series_count: settings.series_count(),
        }));

        let meters = settings
            .meters
            .iter()
            .map(|meter| {
                let time_window_active = meter.time_window.is_active(&now);
                let series = meter
                    .series
                    .iter()
                    .map(|series| {
                        restore_or_fresh(meter, series, store.as_ref(), &clock, time_window_active)
                    })
                    .collect();

                let mut group = MeterGroup {
                    id: meter.id.clone(),
                    time_window: meter.time_window.clone(),
                    has_condition: meter.has_condition(),
                    time_window_active,
                    next_window_change: None,
                    series,
                };
                group.refresh_window(&now);
                group
            })
            .collect();

        let engine = Self {
            settings,
            store,
            clock,
            meters,
        };
        engine.prune_records();

        info!(
            meter_count = engine.meters.len(),
            series_count = engine.settings.series_count(),
            "Core engine initialized"
        );
        engine
    }

    /// Drop records of series that are no longer configured
    fn prune_records(&self) {
        let configured: HashSet<&SeriesId> = self
            .meters
            .iter()
            .flat_map(|g| g.series.iter().map(MeteredSeries::id))
            .collect();

        match self.store.list_records() {
            Ok(ids) => {
                for id in ids.iter().filter(|id| !configured.contains(id)) {
                    info!(series_id = %id, "Removing record of unconfigured series");
                    if let Err(e) = self.store.delete_record(id) {
                        warn!(series_id = %id, error = %e, "Failed to remove record");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list stored records"),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn timezone(&self) -> Tz {
        self.clock.timezone()
    }

    /// Reconcile restored state with the present: apply the current time
    /// window, open the condition of meters that have none, and fire resets
    /// that fell due while the service was down.
    pub fn start(&mut self) -> Vec<CoreEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();

        for group in &mut self.meters {
            for series in &mut group.series {
                series.on_time_window_change(group.time_window_active, &now, &mut events);
                if !group.has_condition {
                    series.on_condition_change(true, &now, &mut events);
                }
                series.tick(&now, &mut events);
            }
        }

        self.audit_resets(&events);
        self.persist_all();
        events
    }

    /// Push a raw value to every series of a meter
    pub fn push_value(&mut self, meter_id: &MeterId, raw: &str) -> Result<Vec<CoreEvent>> {
        let now = self.clock.now();
        let index = self.group_index(meter_id)?;
        let value = parse_reading(meter_id, raw);

        let mut events = Vec::new();
        let group = &mut self.meters[index];
        for series in &mut group.series {
            series.on_value(value, &now, &mut events);
        }
        debug!(meter_id = %meter_id, value = ?value, "Value pushed");

        self.audit_resets(&events);
        self.persist_group(index);
        Ok(events)
    }

    /// Set the activity condition of a meter
    pub fn set_condition(&mut self, meter_id: &MeterId, active: bool) -> Result<Vec<CoreEvent>> {
        let now = self.clock.now();
        let index = self.group_index(meter_id)?;

        let mut events = Vec::new();
        let group = &mut self.meters[index];
        if !group.has_condition {
            debug!(meter_id = %meter_id, "Condition set on a meter without configured condition");
        }
        for series in &mut group.series {
            series.on_condition_change(active, &now, &mut events);
        }

        self.audit_resets(&events);
        self.persist_group(index);
        Ok(events)
    }

    /// Scheduler callback: apply due time-window changes, fire due resets and
    /// bring time meters up to date
    pub fn tick(&mut self) -> Vec<CoreEvent> {
        let now = self.clock.now();
        let mut events = Vec::new();

        for group in &mut self.meters {
            let active = group.time_window.is_active(&now);
            if active != group.time_window_active {
                group.time_window_active = active;
                info!(meter_id = %group.id, active, "Time window changed");
                events.push(CoreEvent::TimeWindowChanged {
                    meter_id: group.id.clone(),
                    active,
                });
                for series in &mut group.series {
                    series.on_time_window_change(active, &now, &mut events);
                }
            }
            group.refresh_window(&now);

            for series in &mut group.series {
                series.tick(&now, &mut events);
            }
        }

        self.audit_resets(&events);
        self.persist_all();
        events
    }

    /// Earliest instant at which [`CoreEngine::tick`] has work to do
    pub fn next_wakeup(&self) -> Option<DateTime<Tz>> {
        self.meters
            .iter()
            .flat_map(|group| {
                group
                    .series
                    .iter()
                    .map(MeteredSeries::next_reset)
                    .chain(std::iter::once(group.next_window_change))
            })
            .flatten()
            .min()
    }

    /// Overwrite the accumulated value of a series
    pub fn calibrate(&mut self, series_id: &SeriesId, value: Decimal) -> Result<CoreEvent> {
        let (g, s) = self.series_index(series_id)?;
        let series = &mut self.meters[g].series[s];
        let old_value = series.meter().measured_value();

        let mut events = Vec::new();
        series.calibrate(value, &mut events);

        let _ = self.store.append_audit(AuditEvent::new(AuditEventType::Calibrated {
            series_id: series_id.clone(),
            old_value,
            new_value: value,
        }));
        self.persist_series(g, s);

        events
            .pop()
            .ok_or_else(|| TallyError::internal("calibration produced no event"))
    }

    /// Reset a series now, or schedule the reset when `at` is in the future.
    /// An instant in the past resets immediately.
    pub fn reset(
        &mut self,
        series_id: &SeriesId,
        at: Option<DateTime<FixedOffset>>,
    ) -> Result<CoreEvent> {
        let now = self.clock.now();
        let tz = self.clock.timezone();
        let (g, s) = self.series_index(series_id)?;

        let mut events = Vec::new();
        self.meters[g].series[s].reset_at(at.map(|t| t.with_timezone(&tz)), &now, &mut events);

        self.audit_resets(&events);
        self.persist_series(g, s);

        events
            .pop()
            .ok_or_else(|| TallyError::internal("reset produced no event"))
    }

    pub fn series_view(&self, series_id: &SeriesId) -> Option<SeriesView> {
        self.find_series(series_id).map(MeteredSeries::view)
    }

    pub fn find_series(&self, series_id: &SeriesId) -> Option<&MeteredSeries> {
        self.meters
            .iter()
            .flat_map(|g| g.series.iter())
            .find(|s| s.id() == series_id)
    }

    /// Number of series fed by a meter
    pub fn series_count(&self, meter_id: &MeterId) -> usize {
        self.meters
            .iter()
            .find(|g| &g.id == meter_id)
            .map_or(0, |g| g.series.len())
    }

    /// Get current service state snapshot
    pub fn get_state(&self) -> ServiceStateSnapshot {
        ServiceStateSnapshot {
            api_version: API_VERSION,
            timezone: self.clock.timezone().name().to_string(),
            series: self
                .meters
                .iter()
                .flat_map(|g| g.series.iter().map(MeteredSeries::view))
                .collect(),
        }
    }

    pub fn is_store_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    /// Final tick: bring time meters up to date and save everything
    pub fn shutdown(&mut self) -> Vec<CoreEvent> {
        let events = self.tick();
        info!("Core engine state saved");
        events
    }

    fn group_index(&self, meter_id: &MeterId) -> Result<usize> {
        self.meters
            .iter()
            .position(|g| &g.id == meter_id)
            .ok_or_else(|| TallyError::MeterNotFound(meter_id.clone()))
    }

    fn series_index(&self, series_id: &SeriesId) -> Result<(usize, usize)> {
        self.meters
            .iter()
            .enumerate()
            .find_map(|(g, group)| {
                group
                    .series
                    .iter()
                    .position(|s| s.id() == series_id)
                    .map(|s| (g, s))
            })
            .ok_or_else(|| TallyError::SeriesNotFound(series_id.clone()))
    }

    fn audit_resets(&self, events: &[CoreEvent]) {
        for event in events {
            let audit = match event {
                CoreEvent::SeriesReset {
                    series_id,
                    reason,
                    prev_measured_value,
                } => AuditEventType::SeriesReset {
                    series_id: series_id.clone(),
                    reason: *reason,
                    prev_measured_value: *prev_measured_value,
                },
                CoreEvent::ResetScheduled { series_id, at } => AuditEventType::ResetScheduled {
                    series_id: series_id.clone(),
                    at: at.fixed_offset(),
                },
                _ => continue,
            };
            let _ = self.store.append_audit(AuditEvent::new(audit));
        }
    }

    fn persist_series(&self, g: usize, s: usize) {
        save(self.store.as_ref(), &self.meters[g].series[s]);
    }

    fn persist_group(&self, g: usize) {
        for series in &self.meters[g].series {
            save(self.store.as_ref(), series);
        }
    }

    fn persist_all(&self) {
        for g in 0..self.meters.len() {
            self.persist_group(g);
        }
    }
}

fn restore_or_fresh(
    meter: &MeterConfig,
    series: &SeriesConfig,
    store: &dyn Store,
    clock: &Arc<dyn Clock>,
    time_window_active: bool,
) -> MeteredSeries {
    let failure = match store.load_record(&series.id) {
        Ok(Some(record)) => {
            match MeteredSeries::restore(meter, series, clock.clone(), record) {
                Ok(restored) => return restored,
                Err(e) => e.to_string(),
            }
        }
        Ok(None) => {
            info!(series_id = %series.id, "No saved record, starting fresh");
            return MeteredSeries::new(
                meter,
                series,
                clock.clone(),
                !meter.has_condition(),
                time_window_active,
            );
        }
        Err(e) => e.to_string(),
    };

    warn!(series_id = %series.id, error = %failure, "Could not restore series, starting fresh");
    let _ = store.append_audit(AuditEvent::new(AuditEventType::RestoreFailed {
        series_id: series.id.clone(),
        error: failure,
    }));
    MeteredSeries::new(
        meter,
        series,
        clock.clone(),
        !meter.has_condition(),
        time_window_active,
    )
}

fn save(store: &dyn Store, series: &MeteredSeries) {
    let result = series
        .to_record()
        .map_err(|e| e.to_string())
        .and_then(|record| {
            store
                .save_record(series.id(), &record)
                .map_err(|e| e.to_string())
        });
    if let Err(e) = result {
        warn!(series_id = %series.id(), error = %e, "Failed to persist series");
    }
}
