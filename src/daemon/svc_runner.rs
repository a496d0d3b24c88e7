//! Service-manager runner
//!
//! Registers the collector as an OS service named `sidecar-collector-<name>`
//! and drives it through a [`ServiceManager`]. State transitions are polled
//! with a deadline. A monitor task restarts a supervised service that stopped
//! on its own, within the same restart budget as the exec runner.

use super::{lock_or_recover, Runner, RunnerState, StopOutcome, SupervisionPolicy};
use crate::backends::status::BackendState;
use crate::backends::Backend;
use crate::services::{ServiceDefinition, ServiceManager, ServiceState};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

pub fn service_name(backend_name: &str) -> String {
    format!("sidecar-collector-{}", backend_name)
}

struct SvcShared {
    name: String,
    service_name: String,
    backend: Arc<dyn Backend>,
    manager: Arc<dyn ServiceManager>,
    policy: SupervisionPolicy,
    state: RwLock<RunnerState>,
    running: AtomicBool,
    supervised: AtomicBool,
    spawn_count: AtomicU64,
    restart_count: AtomicU32,
    started_at: RwLock<Option<Instant>>,
}

impl SvcShared {
    fn set_state(&self, state: RunnerState) {
        *lock_or_recover!(self.state.write()) = state;
    }

    /// Start the service and wait until the manager reports it running
    async fn start_service(&self) -> Result<()> {
        self.set_state(RunnerState::Starting);
        self.manager
            .start(&self.service_name)
            .await
            .with_context(|| format!("[{}] Failed to start service {}", self.name, self.service_name))?;
        self.wait_for(ServiceState::Running).await?;

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        *lock_or_recover!(self.started_at.write()) = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
        self.set_state(RunnerState::Running);
        self.backend.set_status(BackendState::Running, "Running");
        Ok(())
    }

    async fn wait_for(&self, wanted: ServiceState) -> Result<()> {
        let poll = async {
            loop {
                match self.manager.query(&self.service_name).await {
                    Ok(state) if state == wanted => return,
                    Ok(state) => debug!("[{}] Service is {:?}, waiting", self.name, state),
                    Err(e) => debug!("[{}] Service query failed: {:#}", self.name, e),
                }
                sleep(self.policy.service_poll_interval).await;
            }
        };

        timeout(self.policy.service_transition_timeout, poll)
            .await
            .map_err(|_| {
                anyhow!(
                    "[{}] Service {} did not become {:?} within {:?}",
                    self.name,
                    self.service_name,
                    wanted,
                    self.policy.service_transition_timeout
                )
            })
    }
}

pub struct SvcRunner {
    shared: Arc<SvcShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SvcRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        manager: Arc<dyn ServiceManager>,
        policy: SupervisionPolicy,
    ) -> Self {
        let name = backend.name().to_string();
        Self {
            shared: Arc::new(SvcShared {
                service_name: service_name(&name),
                name,
                backend,
                manager,
                policy,
                state: RwLock::new(RunnerState::Stopped),
                running: AtomicBool::new(false),
                supervised: AtomicBool::new(false),
                spawn_count: AtomicU64::new(0),
                restart_count: AtomicU32::new(0),
                started_at: RwLock::new(None),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    async fn start_locked(&self, monitor: &mut Option<JoinHandle<()>>) -> Result<()> {
        let shared = &self.shared;
        self.validate_before_start().await?;
        shared.restart_count.store(0, Ordering::SeqCst);

        let current = shared.manager.query(&shared.service_name).await;
        if matches!(current, Ok(ServiceState::Running)) {
            info!("[{}] Service {} is already running", shared.name, shared.service_name);
            shared.running.store(true, Ordering::SeqCst);
            shared.set_state(RunnerState::Running);
            shared.backend.set_status(BackendState::Running, "Running");
        } else {
            info!("[{}] Starting service {}", shared.name, shared.service_name);
            if let Err(e) = shared.start_service().await {
                let message = format!("Failed to start collector service: {:#}", e);
                error!("[{}] {}", shared.name, message);
                shared.set_state(RunnerState::Crashed);
                shared.backend.set_status(BackendState::Error, &message);
                return Err(e);
            }
        }

        shared.supervised.store(true, Ordering::SeqCst);
        if monitor.as_ref().map_or(true, |handle| handle.is_finished()) {
            *monitor = Some(tokio::spawn(monitor_service(Arc::clone(shared))));
        }
        Ok(())
    }

    async fn stop_locked(&self, monitor: &mut Option<JoinHandle<()>>) -> Result<StopOutcome> {
        let shared = &self.shared;
        shared.supervised.store(false, Ordering::SeqCst);
        if let Some(handle) = monitor.take() {
            handle.abort();
            let _ = handle.await;
        }

        match shared.manager.query(&shared.service_name).await {
            Ok(ServiceState::Stopped) | Ok(ServiceState::NotInstalled) => {
                shared.running.store(false, Ordering::SeqCst);
                shared.set_state(RunnerState::Stopped);
                return Ok(StopOutcome::NotRunning);
            }
            Ok(_) => {}
            Err(e) => warn!("[{}] Unable to query service before stopping: {:#}", shared.name, e),
        }

        info!("[{}] Stopping service {}", shared.name, shared.service_name);
        shared.set_state(RunnerState::Stopping);
        shared
            .manager
            .stop(&shared.service_name)
            .await
            .with_context(|| format!("[{}] Failed to stop service {}", shared.name, shared.service_name))?;
        shared.wait_for(ServiceState::Stopped).await?;

        shared.running.store(false, Ordering::SeqCst);
        shared.set_state(RunnerState::Stopped);
        shared.backend.set_status(BackendState::Unknown, "Stopped");
        Ok(StopOutcome::Graceful)
    }
}

#[async_trait]
impl Runner for SvcRunner {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.shared.backend)
    }

    fn state(&self) -> RunnerState {
        *lock_or_recover!(self.shared.state.read())
    }

    async fn is_running(&self) -> bool {
        match self.shared.manager.query(&self.shared.service_name).await {
            Ok(state) => {
                let running = state == ServiceState::Running;
                self.shared.running.store(running, Ordering::SeqCst);
                running
            }
            Err(_) => self.shared.running.load(Ordering::SeqCst),
        }
    }

    fn spawn_count(&self) -> u64 {
        self.shared.spawn_count.load(Ordering::SeqCst)
    }

    fn restart_count(&self) -> u32 {
        self.shared.restart_count.load(Ordering::SeqCst)
    }

    /// Make sure the service definition exists and matches the backend
    async fn validate_before_start(&self) -> Result<()> {
        let shared = &self.shared;
        let executable = match shared.backend.exec_path() {
            Ok(executable) => executable,
            Err(e) => {
                let message = format!("Unable to find collector executable: {:#}", e);
                error!("[{}] {}", shared.name, message);
                shared.backend.set_status(BackendState::Error, &message);
                return Err(e);
            }
        };

        let definition = ServiceDefinition {
            name: shared.service_name.clone(),
            display_name: shared.name.clone(),
            description: format!("Collector {} managed by sidecar", shared.name),
            executable,
            args: shared.backend.exec_args(),
            restart_on_failure: false,
        };

        if let Err(e) = shared.manager.install(&definition).await {
            let message = format!("Failed to install collector service: {:#}", e);
            error!("[{}] {}", shared.name, message);
            shared.backend.set_status(BackendState::Error, &message);
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        self.start_locked(&mut monitor).await
    }

    async fn stop(&self) -> Result<StopOutcome> {
        let mut monitor = self.monitor.lock().await;
        self.stop_locked(&mut monitor).await
    }

    async fn restart(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        self.stop_locked(&mut monitor).await?;
        sleep(self.shared.policy.settle_delay).await;
        self.start_locked(&mut monitor).await
    }
}

/// Watch a supervised service and bring it back if it stops on its own.
///
/// A service stuck in a pending state for longer than the transition timeout
/// counts as stopped, so a service that never settles still uses up the
/// restart budget.
#[instrument(skip_all, fields(service = %shared.service_name))]
async fn monitor_service(shared: Arc<SvcShared>) {
    let mut pending_since: Option<Instant> = None;
    loop {
        sleep(shared.policy.service_monitor_interval).await;
        if !shared.supervised.load(Ordering::SeqCst) {
            pending_since = None;
            continue;
        }

        match shared.manager.query(&shared.service_name).await {
            Ok(ServiceState::Running) => {
                pending_since = None;
                continue;
            }
            Ok(ServiceState::Pending) => {
                let since = *pending_since.get_or_insert_with(Instant::now);
                if since.elapsed() < shared.policy.service_transition_timeout {
                    continue;
                }
                warn!(
                    "[{}] Service has been pending for {:?}, treating it as stopped",
                    shared.name,
                    since.elapsed()
                );
            }
            Ok(state) => debug!("[{}] Service is {:?}", shared.name, state),
            Err(e) => {
                debug!("[{}] Service query failed: {:#}", shared.name, e);
                continue;
            }
        }
        pending_since = None;

        shared.running.store(false, Ordering::SeqCst);
        shared.set_state(RunnerState::Crashed);

        let ran_for = lock_or_recover!(shared.started_at.read()).map(|at| at.elapsed());
        if ran_for.is_some_and(|elapsed| elapsed >= shared.policy.cooldown) {
            shared.restart_count.store(0, Ordering::SeqCst);
        }
        // Only count a run once
        *lock_or_recover!(shared.started_at.write()) = None;

        if shared.restart_count.load(Ordering::SeqCst) >= shared.policy.max_restarts {
            let message = format!(
                "Unable to start collector after {} tries, giving up!",
                shared.policy.max_restarts
            );
            error!("[{}] {}", shared.name, message);
            shared.backend.set_status(BackendState::Error, &message);
            shared.supervised.store(false, Ordering::SeqCst);
            return;
        }

        let attempt = shared.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            "[{}] Service stopped unexpectedly, restarting in {:?} ({}/{})",
            shared.name, shared.policy.backoff, attempt, shared.policy.max_restarts
        );
        shared
            .backend
            .set_status(BackendState::Unknown, "Collector service stopped, restarting");
        sleep(shared.policy.backoff).await;

        if !shared.supervised.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = shared.start_service().await {
            error!("[{}] Restart attempt {} failed: {:#}", shared.name, attempt, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ServerConfiguration;
    use crate::backends::status::{BackendStatus, StatusCell};
    use crate::backends::Driver;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeBackend {
        executable: Option<PathBuf>,
        status: StatusCell,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn id(&self) -> &str {
            "fake"
        }
        fn name(&self) -> &str {
            "fake"
        }
        fn backend_type(&self) -> &str {
            "generic"
        }
        fn driver(&self) -> Driver {
            Driver::Svc
        }
        fn exec_path(&self) -> Result<PathBuf> {
            self.executable
                .clone()
                .ok_or_else(|| anyhow!("/nonexistent/collector does not exist"))
        }
        fn exec_args(&self) -> Vec<String> {
            vec!["-c".to_string(), "/etc/fake.conf".to_string()]
        }
        fn configuration_path(&self) -> &Path {
            Path::new("/etc/fake.conf")
        }
        async fn render_on_change(&self, _response: &ServerConfiguration) -> bool {
            false
        }
        async fn validate_configuration_file(&self) -> bool {
            true
        }
        fn set_status(&self, state: BackendState, message: &str) {
            self.status.set(state, message);
        }
        fn set_verbose_status(&self, verbose: &str) {
            self.status.set_verbose(verbose);
        }
        fn reset_status(&self, state: BackendState, message: &str) {
            self.status.reset(state, message);
        }
        fn status(&self) -> BackendStatus {
            self.status.get()
        }
    }

    #[derive(Default)]
    struct FakeManager {
        services: StdMutex<HashMap<String, ServiceState>>,
        definitions: StdMutex<Vec<ServiceDefinition>>,
        refuse_to_run: AtomicBool,
        /// Start leaves the service activating instead of running
        stuck_pending: AtomicBool,
        starts: AtomicU32,
    }

    impl FakeManager {
        fn set_state(&self, name: &str, state: ServiceState) {
            self.services.lock().unwrap().insert(name.to_string(), state);
        }
    }

    #[async_trait]
    impl ServiceManager for FakeManager {
        async fn install(&self, definition: &ServiceDefinition) -> Result<()> {
            self.definitions.lock().unwrap().push(definition.clone());
            self.services
                .lock()
                .unwrap()
                .entry(definition.name.clone())
                .or_insert(ServiceState::Stopped);
            Ok(())
        }

        async fn uninstall(&self, name: &str) -> Result<()> {
            self.services.lock().unwrap().remove(name);
            Ok(())
        }

        async fn query(&self, name: &str) -> Result<ServiceState> {
            Ok(*self
                .services
                .lock()
                .unwrap()
                .get(name)
                .unwrap_or(&ServiceState::NotInstalled))
        }

        async fn start(&self, name: &str) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.stuck_pending.load(Ordering::SeqCst) {
                self.set_state(name, ServiceState::Pending);
            } else if !self.refuse_to_run.load(Ordering::SeqCst) {
                self.set_state(name, ServiceState::Running);
            }
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<()> {
            self.set_state(name, ServiceState::Stopped);
            Ok(())
        }
    }

    fn policy() -> SupervisionPolicy {
        SupervisionPolicy {
            backoff: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
            service_poll_interval: Duration::from_millis(5),
            service_transition_timeout: Duration::from_millis(100),
            service_monitor_interval: Duration::from_millis(20),
            ..SupervisionPolicy::default()
        }
    }

    fn runner(executable: Option<&str>) -> (SvcRunner, Arc<FakeManager>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend {
            executable: executable.map(PathBuf::from),
            status: StatusCell::new(),
        });
        let manager = Arc::new(FakeManager::default());
        let runner = SvcRunner::new(backend.clone(), manager.clone(), policy());
        (runner, manager, backend)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_start_installs_and_runs_service() {
        let (runner, manager, backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();

        assert_eq!(runner.service_name(), "sidecar-collector-fake");
        let definitions = manager.definitions.lock().unwrap().clone();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].executable, PathBuf::from("/usr/bin/collector"));
        assert_eq!(definitions[0].args, vec!["-c", "/etc/fake.conf"]);

        assert!(runner.is_running().await);
        assert_eq!(runner.state(), RunnerState::Running);
        assert_eq!(runner.spawn_count(), 1);
        assert_eq!(backend.status().state, BackendState::Running);

        assert_eq!(runner.stop().await.unwrap(), StopOutcome::Graceful);
        assert_eq!(runner.stop().await.unwrap(), StopOutcome::NotRunning);
        assert!(!runner.is_running().await);
    }

    #[tokio::test]
    async fn test_missing_executable_installs_nothing() {
        let (runner, manager, backend) = runner(None);

        assert!(runner.start().await.is_err());
        assert!(manager.definitions.lock().unwrap().is_empty());
        assert_eq!(manager.starts.load(Ordering::SeqCst), 0);
        assert_eq!(backend.status().state, BackendState::Error);
    }

    #[tokio::test]
    async fn test_start_times_out_when_service_never_runs() {
        let (runner, manager, backend) = runner(Some("/usr/bin/collector"));
        manager.refuse_to_run.store(true, Ordering::SeqCst);

        let err = runner.start().await.unwrap_err();
        assert!(err.to_string().contains("did not become Running"));
        assert_eq!(backend.status().state, BackendState::Error);
        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_restarts_stopped_service() {
        let (runner, manager, _backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();

        manager.set_state("sidecar-collector-fake", ServiceState::Stopped);
        wait_until(|| runner.spawn_count() == 2).await;
        assert_eq!(runner.restart_count(), 1);

        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_gives_up_after_budget() {
        let (runner, manager, backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();

        manager.refuse_to_run.store(true, Ordering::SeqCst);
        manager.set_state("sidecar-collector-fake", ServiceState::Stopped);

        wait_until(|| backend.status().message.contains("giving up")).await;
        assert_eq!(backend.status().state, BackendState::Error);
        assert_eq!(runner.restart_count(), 3);
        // initial start plus three restart attempts
        assert_eq!(manager.starts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_monitor_counts_pending_then_stopped_service() {
        let (runner, manager, backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();

        // the service manager is between restarts, then the unit fails
        manager.refuse_to_run.store(true, Ordering::SeqCst);
        manager.set_state("sidecar-collector-fake", ServiceState::Pending);
        sleep(Duration::from_millis(50)).await;
        manager.set_state("sidecar-collector-fake", ServiceState::Stopped);

        wait_until(|| backend.status().message.contains("giving up")).await;
        assert_eq!(backend.status().state, BackendState::Error);
        assert_eq!(runner.restart_count(), 3);
        assert_eq!(manager.starts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_monitor_gives_up_on_service_stuck_pending() {
        let (runner, manager, backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();

        manager.stuck_pending.store(true, Ordering::SeqCst);
        manager.set_state("sidecar-collector-fake", ServiceState::Pending);

        wait_until(|| backend.status().message.contains("giving up")).await;
        assert_eq!(backend.status().state, BackendState::Error);
        assert_eq!(runner.restart_count(), 3);
        assert_eq!(manager.starts.load(Ordering::SeqCst), 4);
        assert_eq!(runner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_cycles_service() {
        let (runner, manager, _backend) = runner(Some("/usr/bin/collector"));
        runner.start().await.unwrap();
        runner.restart().await.unwrap();

        assert!(runner.is_running().await);
        assert_eq!(runner.spawn_count(), 2);
        assert_eq!(manager.starts.load(Ordering::SeqCst), 2);
        runner.stop().await.unwrap();
    }
}
