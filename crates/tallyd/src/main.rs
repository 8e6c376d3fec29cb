//! tallyd - The tally metering service
//!
//! This is the main entry point for the tallyd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization
//! - Core engine
//! - IPC server
//! - The wake-up scheduler for resets and time windows

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tally_api::{
    API_VERSION, ClientRole, Command, ErrorCode, ErrorInfo, Event, EventPayload, HealthStatus,
    Response, ResponsePayload,
};
use tally_config::load_config;
use tally_core::{CoreEngine, CoreEvent};
use tally_ipc::{IpcServer, ServerMessage};
use tally_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use tally_util::{Clock, ClientId, SystemClock, TallyError, default_config_path};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// tallyd - Metering service for counters, sources and time
#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(about = "Metering service for counters, sources and time", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/tally/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override
    #[arg(short, long, env = "TALLY_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override
    #[arg(short, long, env = "TALLY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Main service state
struct Service {
    engine: CoreEngine,
    clock: Arc<dyn Clock>,
    ipc: Arc<IpcServer>,
    store: Arc<dyn Store>,
    heartbeat: Duration,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        let settings = load_config(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?;

        info!(
            config_path = %args.config.display(),
            meter_count = settings.meters.len(),
            series_count = settings.series_count(),
            timezone = %settings.service.timezone,
            "Configuration loaded"
        );

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| settings.service.socket_path.clone());

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.service.data_dir.clone());

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join("tallyd.db");
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Store initialized");

        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(settings.service.timezone));
        let heartbeat = settings.service.heartbeat;
        let engine = CoreEngine::new(settings, store.clone(), clock.clone());

        let mut ipc = IpcServer::new(&socket_path);
        ipc.start().await?;
        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            engine,
            clock,
            ipc: Arc::new(ipc),
            store,
            heartbeat,
        })
    }

    async fn run(mut self) -> Result<()> {
        let ipc_ref = self.ipc.clone();
        let mut ipc_messages = ipc_ref
            .take_message_receiver()
            .await
            .context("IPC message receiver already taken")?;

        // Catch up on whatever happened while the service was down
        let startup_events = self.engine.start();
        info!(event_count = startup_events.len(), "Engine started");

        let engine = Arc::new(Mutex::new(self.engine));
        let clock = self.clock.clone();
        let store = self.store.clone();
        let heartbeat = self.heartbeat;

        broadcast_core_events(&engine, &ipc_ref, clock.as_ref(), startup_events).await;

        let ipc_accept = ipc_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

        info!("Service running");

        loop {
            let sleep_for = {
                let engine = engine.lock().await;
                time_until_wakeup(engine.next_wakeup(), clock.as_ref(), heartbeat)
            };
            debug!(sleep_ms = sleep_for.as_millis() as u64, "Waiting for next wake-up");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, shutting down gracefully");
                    break;
                }

                // Period ends, time-window edges and the heartbeat for time meters
                _ = tokio::time::sleep(sleep_for) => {
                    let events = engine.lock().await.tick();
                    broadcast_core_events(&engine, &ipc_ref, clock.as_ref(), events).await;
                }

                Some(msg) = ipc_messages.recv() => {
                    handle_ipc_message(&engine, &ipc_ref, &store, clock.as_ref(), msg).await;
                }
            }
        }

        info!("Shutting down tallyd");

        let events = engine.lock().await.shutdown();
        broadcast_core_events(&engine, &ipc_ref, clock.as_ref(), events).await;
        ipc_ref.broadcast_event(Event::new(clock.now().fixed_offset(), EventPayload::Shutdown));

        if let Err(e) = store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }

        ipc_ref.shutdown();
        info!("Shutdown complete");
        Ok(())
    }
}

/// Time to sleep until `wakeup`, capped at the heartbeat
fn time_until_wakeup(
    wakeup: Option<chrono::DateTime<chrono_tz::Tz>>,
    clock: &dyn Clock,
    heartbeat: Duration,
) -> Duration {
    match wakeup {
        Some(at) => (at - clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(heartbeat),
        None => heartbeat,
    }
}

/// Wire form of a core event. Time-window edges reach clients as gating changes.
fn event_payload(event: &CoreEvent) -> Option<EventPayload> {
    match event {
        CoreEvent::GatingChanged {
            series_id,
            from,
            to,
        } => Some(EventPayload::GatingChanged {
            series_id: series_id.clone(),
            from: *from,
            to: *to,
        }),
        CoreEvent::SeriesReset {
            series_id,
            reason,
            prev_measured_value,
        } => Some(EventPayload::SeriesReset {
            series_id: series_id.clone(),
            reason: *reason,
            prev_measured_value: *prev_measured_value,
        }),
        CoreEvent::ResetScheduled { series_id, at } => Some(EventPayload::ResetScheduled {
            series_id: series_id.clone(),
            at: at.fixed_offset(),
        }),
        CoreEvent::Calibrated { series_id, value } => Some(EventPayload::Calibrated {
            series_id: series_id.clone(),
            value: *value,
        }),
        CoreEvent::TimeWindowChanged { .. } => None,
    }
}

async fn broadcast_core_events(
    engine: &Arc<Mutex<CoreEngine>>,
    ipc: &Arc<IpcServer>,
    clock: &dyn Clock,
    events: Vec<CoreEvent>,
) {
    if events.is_empty() {
        return;
    }

    let timestamp = clock.now().fixed_offset();
    let mut state_changed = false;
    for event in &events {
        state_changed |= matches!(event, CoreEvent::SeriesReset { .. });
        if let Some(payload) = event_payload(event) {
            ipc.broadcast_event(Event::new(timestamp, payload));
        }
    }

    if state_changed {
        let state = engine.lock().await.get_state();
        debug!("Broadcasting StateChanged");
        ipc.broadcast_event(Event::new(timestamp, EventPayload::StateChanged(state)));
    }
}

async fn handle_ipc_message(
    engine: &Arc<Mutex<CoreEngine>>,
    ipc: &Arc<IpcServer>,
    store: &Arc<dyn Store>,
    clock: &dyn Clock,
    msg: ServerMessage,
) {
    match msg {
        ServerMessage::Request { client_id, request } => {
            let response = if request.api_version != API_VERSION {
                Response::error(
                    request.request_id,
                    ErrorInfo::new(
                        ErrorCode::InvalidRequest,
                        format!(
                            "Unsupported API version {} (expected {})",
                            request.api_version, API_VERSION
                        ),
                    ),
                )
            } else {
                let role = ipc
                    .get_client_info(&client_id)
                    .await
                    .map_or(ClientRole::Observer, |info| info.role);
                let (response, events) =
                    handle_command(engine, role, &client_id, request.request_id, request.command)
                        .await;
                broadcast_core_events(engine, ipc, clock, events).await;
                response
            };

            if let Err(e) = ipc.send_response(&client_id, response).await {
                debug!(client_id = %client_id, error = %e, "Failed to send response");
            }
        }

        ServerMessage::ClientConnected { client_id, info } => {
            info!(
                client_id = %client_id,
                role = ?info.role,
                uid = ?info.uid,
                "Client connected"
            );

            let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                client_id: client_id.to_string(),
                role: format!("{:?}", info.role),
                uid: info.uid,
            }));
        }

        ServerMessage::ClientDisconnected { client_id } => {
            debug!(client_id = %client_id, "Client disconnected");

            let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                client_id: client_id.to_string(),
            }));
        }
    }
}

/// Run one command against the engine. Returns the response and the core
/// events to broadcast.
async fn handle_command(
    engine: &Arc<Mutex<CoreEngine>>,
    role: ClientRole,
    client_id: &ClientId,
    request_id: u64,
    command: Command,
) -> (Response, Vec<CoreEvent>) {
    let denied = |what: &str| {
        (
            Response::error(
                request_id,
                ErrorInfo::new(
                    ErrorCode::PermissionDenied,
                    format!("Operator role required to {what}"),
                ),
            ),
            Vec::new(),
        )
    };
    let failed = |e: TallyError| (Response::error(request_id, error_info(&e)), Vec::new());

    match command {
        Command::GetState => {
            let state = engine.lock().await.get_state();
            (Response::success(request_id, ResponsePayload::State(state)), Vec::new())
        }

        Command::GetSeries { series_id } => match engine.lock().await.series_view(&series_id) {
            Some(view) => (
                Response::success(request_id, ResponsePayload::Series(view)),
                Vec::new(),
            ),
            None => failed(TallyError::SeriesNotFound(series_id)),
        },

        Command::PushValue { meter_id, value } => {
            if !role.can_push_values() {
                return denied("push values");
            }
            let mut eng = engine.lock().await;
            match eng.push_value(&meter_id, &value) {
                Ok(events) => {
                    let series_updated = eng.series_count(&meter_id);
                    (
                        Response::success(
                            request_id,
                            ResponsePayload::ValueAccepted { series_updated },
                        ),
                        events,
                    )
                }
                Err(e) => failed(e),
            }
        }

        Command::SetCondition { meter_id, active } => {
            if !role.can_push_values() {
                return denied("set conditions");
            }
            let mut eng = engine.lock().await;
            match eng.set_condition(&meter_id, active) {
                Ok(events) => {
                    let series_updated = eng.series_count(&meter_id);
                    (
                        Response::success(
                            request_id,
                            ResponsePayload::ConditionSet { series_updated },
                        ),
                        events,
                    )
                }
                Err(e) => failed(e),
            }
        }

        Command::Calibrate { series_id, value } => {
            if !role.can_calibrate() {
                return denied("calibrate");
            }
            let mut eng = engine.lock().await;
            let result = eng
                .calibrate(&series_id, value)
                .and_then(|event| Ok((event, view_of(&eng, &series_id)?)));
            match result {
                Ok((event, view)) => (
                    Response::success(request_id, ResponsePayload::Calibrated(view)),
                    vec![event],
                ),
                Err(e) => failed(e),
            }
        }

        Command::Reset { series_id, at } => {
            if !role.can_reset() {
                return denied("reset");
            }
            let mut eng = engine.lock().await;
            match eng.reset(&series_id, at) {
                Ok(CoreEvent::ResetScheduled { series_id, at }) => (
                    Response::success(
                        request_id,
                        ResponsePayload::ResetScheduled {
                            series_id: series_id.clone(),
                            at: at.fixed_offset(),
                        },
                    ),
                    vec![CoreEvent::ResetScheduled { series_id, at }],
                ),
                Ok(event) => match view_of(&eng, &series_id) {
                    Ok(view) => (
                        Response::success(request_id, ResponsePayload::ResetDone(view)),
                        vec![event],
                    ),
                    Err(e) => failed(e),
                },
                Err(e) => failed(e),
            }
        }

        Command::SubscribeEvents => (
            Response::success(
                request_id,
                ResponsePayload::Subscribed {
                    client_id: client_id.clone(),
                },
            ),
            Vec::new(),
        ),

        Command::UnsubscribeEvents => {
            (Response::success(request_id, ResponsePayload::Unsubscribed), Vec::new())
        }

        Command::GetHealth => {
            let store_ok = engine.lock().await.is_store_healthy();
            let health = HealthStatus {
                live: true,
                ready: true,
                config_loaded: true,
                store_ok,
            };
            (Response::success(request_id, ResponsePayload::Health(health)), Vec::new())
        }

        Command::Ping => (Response::success(request_id, ResponsePayload::Pong), Vec::new()),
    }
}

fn view_of(
    engine: &CoreEngine,
    series_id: &tally_util::SeriesId,
) -> Result<tally_api::SeriesView, TallyError> {
    engine
        .series_view(series_id)
        .ok_or_else(|| TallyError::SeriesNotFound(series_id.clone()))
}

fn error_info(error: &TallyError) -> ErrorInfo {
    let code = match error {
        TallyError::SeriesNotFound(_) => ErrorCode::SeriesNotFound,
        TallyError::MeterNotFound(_) => ErrorCode::MeterNotFound,
        TallyError::InvalidValue(_) => ErrorCode::InvalidValue,
        TallyError::PermissionDenied(_) => ErrorCode::PermissionDenied,
        _ => ErrorCode::InternalError,
    };
    ErrorInfo::new(code, error.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "tallyd starting");

    let service = Service::new(&args).await?;
    service.run().await
}
