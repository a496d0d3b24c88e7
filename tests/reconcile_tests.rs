//! Reconciliation cycle tests with a scripted configuration source and a
//! runner that only records restarts

#![cfg(unix)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use sidecar::api::{ConfigurationEntry, ConfigurationSource, ServerConfiguration};
use sidecar::backends::filebeat::FilebeatRenderer;
use sidecar::backends::status::BackendState;
use sidecar::backends::{Backend, CollectorBackend, Driver};
use sidecar::config::{AgentContext, BackendDescriptor};
use sidecar::daemon::{Runner, RunnerState, StopOutcome};
use sidecar::reconcile::{CycleOutcome, Reconciler, INVALID_CONFIGURATION_MESSAGE};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Serves whatever configuration the test put in, or fails when empty
struct ScriptedSource {
    response: Mutex<Option<ServerConfiguration>>,
}

impl ScriptedSource {
    fn new(response: Option<ServerConfiguration>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
        })
    }

    fn set(&self, response: ServerConfiguration) {
        *self.response.lock().unwrap() = Some(response);
    }
}

#[async_trait]
impl ConfigurationSource for ScriptedSource {
    async fn fetch(&self, _backend_id: &str) -> Result<ServerConfiguration> {
        self.response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

struct RecordingRunner {
    backend: Arc<dyn Backend>,
    restarts: AtomicU32,
    fail_restart: bool,
}

impl RecordingRunner {
    fn new(backend: Arc<dyn Backend>, fail_restart: bool) -> Arc<Self> {
        Arc::new(Self {
            backend,
            restarts: AtomicU32::new(0),
            fail_restart,
        })
    }
}

#[async_trait]
impl Runner for RecordingRunner {
    fn name(&self) -> &str {
        "recording"
    }
    fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }
    fn state(&self) -> RunnerState {
        RunnerState::Running
    }
    async fn is_running(&self) -> bool {
        true
    }
    fn spawn_count(&self) -> u64 {
        0
    }
    fn restart_count(&self) -> u32 {
        0
    }
    async fn validate_before_start(&self) -> Result<()> {
        Ok(())
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<StopOutcome> {
        Ok(StopOutcome::Graceful)
    }
    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart {
            return Err(anyhow!("service manager unavailable"));
        }
        Ok(())
    }
}

fn filebeat(dir: &Path, validation: &str) -> Arc<CollectorBackend<FilebeatRenderer>> {
    let context = Arc::new(AgentContext {
        node_id: "node-1".to_string(),
        node_name: "test-host".to_string(),
        tags: vec!["linux".to_string()],
        log_path: dir.join("logs"),
        collector_configuration_directory: dir.join("generated"),
        validation_timeout: Duration::from_secs(5),
        accesslist: Vec::new(),
    });
    let descriptor = BackendDescriptor {
        id: "fb-1".to_string(),
        name: "filebeat".to_string(),
        backend_type: "filebeat".to_string(),
        driver: Driver::Exec,
        executable_path: "/bin/sh".into(),
        configuration_path: None,
        execute_parameters: "-c %s".to_string(),
        validation_parameters: validation.to_string(),
        enabled: true,
    };
    let renderer = FilebeatRenderer::new(context.template_variables());
    Arc::new(CollectorBackend::new(descriptor, context, renderer).unwrap())
}

fn with_output(hosts: &str) -> ServerConfiguration {
    let mut properties = BTreeMap::new();
    properties.insert("hosts".to_string(), json!(hosts));
    ServerConfiguration {
        outputs: vec![ConfigurationEntry {
            backend_id: "fb-1".to_string(),
            entry_type: "logstash".to_string(),
            name: "graylog".to_string(),
            properties,
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_first_cycle_restarts_then_settles() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "");
    let runner = RecordingRunner::new(backend.clone(), false);
    let source = ScriptedSource::new(Some(ServerConfiguration::default()));
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Restarted);
    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Unchanged);
    assert_eq!(backend.pipeline().write_count(), 1);
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(reconciler.cycles(), 2);

    let rendered =
        std::fs::read_to_string(temp_dir.path().join("generated/filebeat.conf")).unwrap();
    assert!(rendered.contains("linux"));
}

#[tokio::test]
async fn test_changed_configuration_restarts_again() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "");
    let runner = RecordingRunner::new(backend.clone(), false);
    let source = ScriptedSource::new(Some(with_output("[\"localhost:5044\"]")));
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Restarted);
    source.set(with_output("[\"graylog:5044\"]"));
    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Restarted);
    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Unchanged);
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 2);

    let rendered =
        std::fs::read_to_string(temp_dir.path().join("generated/filebeat.conf")).unwrap();
    assert!(rendered.contains("graylog:5044"));
    assert!(!rendered.contains("localhost:5044"));
}

#[tokio::test]
async fn test_invalid_configuration_is_not_applied() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "-c 'exit 1'");
    let runner = RecordingRunner::new(backend.clone(), false);
    let source = ScriptedSource::new(Some(ServerConfiguration::default()));
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::ValidationFailed);
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 0);

    let status = backend.status();
    assert_eq!(status.state, BackendState::Error);
    assert_eq!(status.message, INVALID_CONFIGURATION_MESSAGE);

    // the same configuration is not re-validated on the next cycle
    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Unchanged);
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_server_skips_cycle() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "");
    let runner = RecordingRunner::new(backend.clone(), false);
    let source = ScriptedSource::new(None);
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Skipped);
    assert_eq!(backend.pipeline().write_count(), 0);
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 0);
    assert!(!temp_dir.path().join("generated/filebeat.conf").exists());

    // recovers once the server answers
    source.set(ServerConfiguration::default());
    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::Restarted);
}

#[tokio::test]
async fn test_failed_restart_marks_backend_error() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "");
    let runner = RecordingRunner::new(backend.clone(), true);
    let source = ScriptedSource::new(Some(ServerConfiguration::default()));
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    assert_eq!(reconciler.reconcile_once().await, CycleOutcome::RestartFailed);
    let status = backend.status();
    assert_eq!(status.state, BackendState::Error);
    assert!(status.message.contains("service manager unavailable"));
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() {
    let temp_dir = TempDir::new().unwrap();
    let backend = filebeat(temp_dir.path(), "");
    let runner = RecordingRunner::new(backend.clone(), false);
    let source = ScriptedSource::new(Some(ServerConfiguration::default()));
    let reconciler = Reconciler::new(backend.clone(), runner.clone(), source.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(reconciler.run(Duration::from_millis(50), shutdown_rx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    // the first tick renders, later ticks see no change
    assert_eq!(runner.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(backend.pipeline().write_count(), 1);
}
