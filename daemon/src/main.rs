use anyhow::Result;
use procwatch_daemon::{
    collector::SampleCollector,
    config::Config,
    controller::{LinuxProcessController, PriorityLevel, ProcessController},
    db::Database,
    monitor::{Monitor, MonitorEvent},
    notifier::Notifier,
    protocol::{IdentityParams, Request, Response, StatusData},
    sample::ProcessIdentity,
    socket::{handle_client, RequestHandler, SocketServer},
    source::{LinuxProcessSource, ProcessInfoSource},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EVENT_RETENTION_DAYS: u32 = 30;
const DEFAULT_EVENT_LIMIT: u32 = 50;

struct DaemonState {
    source: Arc<dyn ProcessInfoSource>,
    monitor: Arc<Monitor>,
    collector: Mutex<SampleCollector>,
    controller: LinuxProcessController,
    db: Mutex<Database>,
    notifier: RwLock<Notifier>,
    config: RwLock<Config>,
    config_path: PathBuf,
    broadcast_tx: broadcast::Sender<Response>,
}

impl DaemonState {
    /// Pin a request to an identity. Without a start time the newest
    /// tracked holder of the pid is used, then the live process table.
    async fn resolve(&self, pid: u32, start_time: Option<u64>) -> Option<ProcessIdentity> {
        if let Some(start_time) = start_time {
            return Some(ProcessIdentity::new(pid, start_time));
        }
        if let Some(view) = self.monitor.by_pid(pid).await {
            return Some(view.identity());
        }
        self.source.get_process(pid).map(|p| p.identity())
    }

    async fn resolve_params(&self, params: &IdentityParams) -> Result<ProcessIdentity, Response> {
        self.resolve(params.pid, params.start_time)
            .await
            .ok_or_else(|| Response::error("no_such_process", format!("no such process: PID {}", params.pid)))
    }

    async fn status(&self) -> StatusData {
        let collector = self.collector.lock().await;
        StatusData {
            tracked_count: self.monitor.tracked_count().await as u32,
            suspicious_count: self.monitor.suspicious_count().await as u32,
            paused: !collector.is_running(),
            sample_interval_ms: collector.interval().as_millis() as u64,
        }
    }

    async fn handle_event(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::ClassificationChanged(change) => {
                {
                    let db = self.db.lock().await;
                    if let Err(e) = db.insert_event(change) {
                        error!("Failed to save classification event: {}", e);
                    }
                }
                let notifier = self.notifier.read().await.clone();
                notifier.notify_change(change).await;
            }
            MonitorEvent::Reconciled(result) => {
                if !result.expired.is_empty() {
                    let db = self.db.lock().await;
                    for identity in &result.expired {
                        if let Err(e) = db.remove_trusted(identity) {
                            warn!(%identity, "Failed to drop trusted entry: {}", e);
                        }
                    }
                }
                let status = Response::Status {
                    data: self.status().await,
                };
                let _ = self.broadcast_tx.send(status);
            }
            MonitorEvent::TrustExpired { identities } => {
                let db = self.db.lock().await;
                for identity in identities {
                    if let Err(e) = db.remove_trusted(identity) {
                        warn!(%identity, "Failed to drop trusted entry: {}", e);
                    }
                }
            }
            MonitorEvent::AcquisitionFailed { .. } => {}
        }
        let _ = self.broadcast_tx.send(Response::Event { data: event.clone() });
    }

    async fn update_config(&self, new_config: Config) -> Response {
        if let Err(e) = new_config.validate() {
            return Response::from(&e);
        }
        if let Err(e) = self.monitor.reconfigure(&new_config).await {
            return Response::from(&e);
        }
        if let Err(e) = self.collector.lock().await.set_interval(new_config.sample_interval()) {
            return Response::from(&e);
        }
        self.controller.set_config(new_config.control.clone()).await;
        self.notifier.write().await.set_enabled(new_config.general.notifications);
        if let Err(e) = new_config.save(&self.config_path) {
            warn!("Config applied but not saved: {}", e);
        }
        *self.config.write().await = new_config;
        info!("Configuration updated");
        Response::data(serde_json::json!({"success": true}))
    }
}

#[async_trait::async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Status => Response::Status {
                data: self.status().await,
            },

            Request::ListProcesses => Response::data(serde_json::json!(self.monitor.processes().await)),

            Request::Find { params } => {
                Response::data(serde_json::json!(self.monitor.find_by_name(&params.name).await))
            }

            Request::GetHistory { params } => {
                let identity = match self.resolve_params(&params).await {
                    Ok(identity) => identity,
                    Err(response) => return response,
                };
                match self.monitor.history(&identity).await {
                    Some(series) => Response::data(serde_json::json!({
                        "identity": identity,
                        "capacity": series.capacity(),
                        "points": series.to_vec(),
                        "average": series.average(series.len()),
                    })),
                    None => Response::error("not_found", format!("no history for {}", identity)),
                }
            }

            Request::System => match self.monitor.system().await {
                Some(view) => Response::data(serde_json::json!(view)),
                None => Response::error("not_found", "no system reading yet"),
            },

            Request::GetSystemHistory => {
                let series = self.monitor.system_history().await;
                Response::data(serde_json::json!({
                    "capacity": series.capacity(),
                    "points": series.to_vec(),
                    "average": series.average(series.len()),
                }))
            }

            Request::GetEvents { params } => {
                let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
                let db = self.db.lock().await;
                match db.get_events(limit, params.since) {
                    Ok(events) => Response::data(serde_json::json!(events)),
                    Err(e) => Response::error("database", e.to_string()),
                }
            }

            Request::Terminate { params } => {
                let identity = match self.resolve_params(&params).await {
                    Ok(identity) => identity,
                    Err(response) => return response,
                };
                match self.controller.terminate(identity).await {
                    Ok(outcome) => Response::data(serde_json::json!({"success": true, "outcome": outcome})),
                    Err(e) => Response::from(&e),
                }
            }

            Request::SetPriority { params } => {
                let level = match params.level.parse::<PriorityLevel>() {
                    Ok(level) => level,
                    Err(e) => return Response::from(&e),
                };
                let identity = match self.resolve(params.pid, params.start_time).await {
                    Some(identity) => identity,
                    None => {
                        return Response::error("no_such_process", format!("no such process: PID {}", params.pid))
                    }
                };
                match self.controller.set_priority(identity, level).await {
                    Ok(()) => Response::data(serde_json::json!({"success": true})),
                    Err(e) => Response::from(&e),
                }
            }

            Request::Trust { params } => {
                let identity = match self.resolve_params(&params).await {
                    Ok(identity) => identity,
                    Err(response) => return response,
                };
                self.monitor.trust(identity).await;
                if let Err(e) = self.db.lock().await.add_trusted(&identity) {
                    warn!(%identity, "Trusted override not persisted: {}", e);
                }
                Response::data(serde_json::json!({"success": true, "identity": identity}))
            }

            Request::Untrust { params } => {
                let identity = match self.resolve_params(&params).await {
                    Ok(identity) => identity,
                    Err(response) => return response,
                };
                let removed = self.monitor.untrust(&identity).await;
                if let Err(e) = self.db.lock().await.remove_trusted(&identity) {
                    warn!(%identity, "Failed to drop trusted entry: {}", e);
                }
                Response::data(serde_json::json!({"success": removed, "identity": identity}))
            }

            Request::ListTrusted => Response::data(serde_json::json!(self.monitor.trusted().await)),

            Request::GetConfig => Response::Config {
                data: Box::new(self.config.read().await.clone()),
            },

            Request::UpdateConfig { params } => self.update_config(params).await,

            Request::Pause => {
                self.collector.lock().await.stop().await;
                info!("Monitoring paused");
                Response::data(serde_json::json!({"success": true}))
            }

            Request::Resume => {
                let interval = self.config.read().await.sample_interval();
                match self.collector.lock().await.start(interval) {
                    Ok(()) => {
                        info!("Monitoring resumed");
                        Response::data(serde_json::json!({"success": true}))
                    }
                    Err(e) => Response::from(&e),
                }
            }
        }
    }
}

async fn forward_events(state: Arc<DaemonState>, mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => state.handle_event(&event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged behind the monitor");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("procwatch daemon starting...");

    // Load configuration
    let config_path = Config::config_path();
    let config = if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    };

    // Initialize database
    let db_path = config
        .general
        .database_path
        .clone()
        .unwrap_or_else(Database::default_path);
    let db = Database::open(&db_path)?;
    db.init_schema()?;
    if let Err(e) = db.cleanup_old_events(EVENT_RETENTION_DAYS) {
        warn!("Failed to prune old events: {}", e);
    }
    let trusted = db.get_trusted()?;

    let source: Arc<dyn ProcessInfoSource> = Arc::new(LinuxProcessSource::new());
    let monitor = Arc::new(Monitor::new(&config));
    for identity in monitor.restore_trusted(trusted, source.as_ref()).await {
        if let Err(e) = db.remove_trusted(&identity) {
            warn!(%identity, "Failed to drop trusted entry: {}", e);
        }
    }

    // Create socket server
    let socket_path = config
        .general
        .socket_path
        .clone()
        .unwrap_or_else(SocketServer::default_path);
    let server = SocketServer::bind(&socket_path).await?;

    let collector = SampleCollector::new(Arc::clone(&source));
    collector.on_sample(monitor.clone()).await;

    let state = Arc::new(DaemonState {
        source: Arc::clone(&source),
        monitor: Arc::clone(&monitor),
        collector: Mutex::new(collector),
        controller: LinuxProcessController::new(Arc::clone(&source), config.control.clone()),
        db: Mutex::new(db),
        notifier: RwLock::new(Notifier::new(config.general.notifications)),
        config: RwLock::new(config.clone()),
        config_path,
        broadcast_tx: server.broadcast_sender(),
    });

    tokio::spawn(forward_events(Arc::clone(&state), monitor.subscribe()));
    state.collector.lock().await.start(config.sample_interval())?;

    info!("Daemon ready, listening for connections...");

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    let broadcast_rx = server.broadcast_sender().subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, broadcast_rx, state).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    state.collector.lock().await.stop().await;
    Ok(())
}
