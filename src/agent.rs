//! Agent mode implementation
//!
//! The agent resolves the configured backends through the registry, builds a
//! runner for each, starts them, and then keeps one reconciliation task per
//! backend plus the status heartbeat running until shutdown. Unknown backend
//! types and an invalid configuration abort startup; problems with a single
//! backend only disable that backend.

use crate::api::{
    BackendReport, ConfigurationSource, FileConfigurationSource, HttpConfigurationSource,
    StatusReporter, StatusRequest,
};
use crate::backends::registry::BackendRegistry;
use crate::backends::status::BackendState;
use crate::backends::{Backend, Driver};
use crate::config::{AgentConfig, AgentContext};
use crate::daemon::supervisor::Supervisor;
use crate::daemon::{create_runner, Runner};
use crate::reconcile::Reconciler;
use crate::services::detect_service_manager;
use anyhow::{bail, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Extra time on top of the grace period before bulk stop gives up
const STOP_MARGIN: Duration = Duration::from_secs(5);
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Agent {
    config: AgentConfig,
    context: Arc<AgentContext>,
    backends: Arc<Vec<Arc<dyn Backend>>>,
    supervised: Vec<(Arc<dyn Backend>, Arc<dyn Runner>)>,
    supervisor: Arc<Supervisor>,
    source: Arc<dyn ConfigurationSource>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

impl Agent {
    /// Validate the configuration and build backends and runners
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(config.context()?);

        let source: Arc<dyn ConfigurationSource> = match &config.local_configuration {
            Some(path) => {
                info!("Reading collector configuration from {}", path.display());
                Arc::new(FileConfigurationSource::new(path))
            }
            None => Arc::new(HttpConfigurationSource::new(
                &config.server_url,
                &context.node_id,
                &config.server_api_token,
            )?),
        };

        Self::with_source(config, context, source)
    }

    /// Build the agent around an explicit configuration source
    pub fn with_source(
        config: AgentConfig,
        context: Arc<AgentContext>,
        source: Arc<dyn ConfigurationSource>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.supervision_policy();

        let needs_service_manager = config
            .backends
            .iter()
            .any(|backend| backend.enabled && backend.driver == Driver::Svc);
        let service_manager = if needs_service_manager {
            match detect_service_manager() {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!("{:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut supervisor = Supervisor::new(policy.grace_period + STOP_MARGIN);
        let mut backends = Vec::new();
        let mut supervised = Vec::new();

        for descriptor in &config.backends {
            if !descriptor.enabled {
                info!("[{}] Backend is disabled, skipping", descriptor.name);
                continue;
            }

            // An unknown type is fatal for the whole agent
            let factory = BackendRegistry::resolve(&descriptor.backend_type)?;
            let backend = match factory(descriptor.clone(), Arc::clone(&context)) {
                Ok(backend) => backend,
                Err(e) => {
                    error!("[{}] Unable to set up backend: {:#}", descriptor.name, e);
                    continue;
                }
            };
            backends.push(Arc::clone(&backend));

            if let Err(e) = backend.exec_path() {
                let message = format!("Unable to find collector executable: {:#}", e);
                error!("[{}] {}, disabling backend", backend.name(), message);
                backend.set_status(BackendState::Error, &message);
                continue;
            }

            let runner = match create_runner(
                Arc::clone(&backend),
                &context,
                policy.clone(),
                service_manager.clone(),
            ) {
                Ok(runner) => runner,
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!("{}", message);
                    backend.set_status(BackendState::Error, &message);
                    continue;
                }
            };

            supervisor.add_runner(backend.id(), Arc::clone(&runner));
            supervised.push((backend, runner));
        }

        if backends.is_empty() {
            warn!("No enabled backends configured");
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            context,
            backends: Arc::new(backends),
            supervised,
            supervisor: Arc::new(supervisor),
            source,
            shutdown_tx,
            tasks: Vec::new(),
            running: false,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn statuses(&self) -> Vec<BackendReport> {
        self.backends.iter().map(|backend| backend.report()).collect()
    }

    /// Start collectors and background tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("Agent is already running");
        }

        info!(
            "Starting agent as node {} ({}) with {} backend(s)",
            self.context.node_id,
            self.context.node_name,
            self.supervisor.len()
        );
        self.shutdown_tx.send_replace(false);

        let reporter = if self.config.send_status && self.config.local_configuration.is_none() {
            Some(StatusReporter::new(
                &self.config.server_url,
                &self.context.node_id,
                &self.config.server_api_token,
            )?)
        } else {
            None
        };

        self.supervisor.start_all().await;

        let period = self.config.update_interval();
        for (backend, runner) in &self.supervised {
            let reconciler =
                Reconciler::new(Arc::clone(backend), Arc::clone(runner), Arc::clone(&self.source));
            self.tasks.push(tokio::spawn(
                reconciler.run(period, self.shutdown_tx.subscribe()),
            ));
        }

        if let Some(reporter) = reporter {
            self.tasks.push(tokio::spawn(report_status(
                reporter,
                Arc::clone(&self.context),
                Arc::clone(&self.backends),
                period,
                self.shutdown_tx.subscribe(),
            )));
        }

        if let Some(port) = self.config.status_port {
            self.tasks.push(tokio::spawn(serve_status(
                port,
                Arc::clone(&self.backends),
                self.shutdown_tx.subscribe(),
            )));
        }

        self.running = true;
        Ok(())
    }

    /// Cancel background tasks and stop every collector
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        info!("Stopping agent");

        self.shutdown_tx.send_replace(true);
        for mut task in self.tasks.drain(..) {
            if timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not finish in time, aborting it");
                task.abort();
            }
        }

        let result = self.supervisor.stop_all().await;
        if let Err(e) = &result {
            error!("{:#}", e);
        }
        self.running = false;
        result
    }

    /// Run until Ctrl-C or SIGTERM; SIGHUP restarts all collectors
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        self.start().await?;
        self.wait_for_shutdown().await?;
        self.stop().await
    }

    #[cfg(unix)]
    async fn wait_for_shutdown(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C");
                    return Ok(());
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    return Ok(());
                }
                _ = hangup.recv() => {
                    info!("Received SIGHUP, restarting all collectors");
                    if let Err(e) = self.supervisor.restart_all().await {
                        warn!("{:#}", e);
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C");
        Ok(())
    }
}

fn status_request(context: &AgentContext, backends: &[Arc<dyn Backend>]) -> StatusRequest {
    StatusRequest {
        node_id: context.node_id.clone(),
        node_name: context.node_name.clone(),
        tags: context.tags.clone(),
        operating_system: std::env::consts::OS.to_string(),
        backends: backends.iter().map(|backend| backend.report()).collect(),
    }
}

#[instrument(skip_all)]
async fn report_status(
    reporter: StatusReporter,
    context: Arc<AgentContext>,
    backends: Arc<Vec<Arc<dyn Backend>>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let request = status_request(&context, &backends);
                match reporter.report(&request).await {
                    Ok(()) => debug!("Reported status of {} backend(s)", request.backends.len()),
                    Err(e) => warn!("Failed to report status: {:#}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[derive(Clone)]
struct StatusState {
    backends: Arc<Vec<Arc<dyn Backend>>>,
}

async fn health_check() -> &'static str {
    "ok"
}

async fn status_endpoint(State(state): State<StatusState>) -> Json<Vec<BackendReport>> {
    Json(state.backends.iter().map(|backend| backend.report()).collect())
}

async fn serve_status(
    port: u16,
    backends: Arc<Vec<Arc<dyn Backend>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .with_state(StatusState { backends });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to bind status endpoint on {}: {}", addr, e);
            return;
        }
    };
    info!("Status endpoint available at http://{}/status", addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await;
    if let Err(e) = result {
        error!("Status endpoint failed: {}", e);
    }
}
