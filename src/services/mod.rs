//! OS service manager integration
//!
//! The svc runner and the `service` subcommand talk to the host's service
//! manager through [`ServiceManager`]. Installation is idempotent: installing
//! an existing service replaces its definition.

pub mod systemd;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

/// Everything needed to register a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Let the service manager restart the process on its own. Off for
    /// collectors, whose restarts are counted by the runner.
    #[serde(default)]
    pub restart_on_failure: bool,
}

/// State reported by the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    /// Starting, stopping or reloading
    Pending,
    NotInstalled,
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Create or replace the service definition
    async fn install(&self, definition: &ServiceDefinition) -> Result<()>;

    async fn uninstall(&self, name: &str) -> Result<()>;

    async fn query(&self, name: &str) -> Result<ServiceState>;

    async fn start(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;
}

/// Actions accepted by `sidecar service`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
    Status,
}

/// Apply `action` to the service described by `definition`, returning a
/// human readable result
pub async fn control(
    manager: &dyn ServiceManager,
    definition: &ServiceDefinition,
    action: ServiceAction,
) -> Result<String> {
    let name = definition.name.as_str();
    match action {
        ServiceAction::Install => {
            manager.install(definition).await?;
            Ok(format!("Service {} installed", name))
        }
        ServiceAction::Uninstall => {
            manager.uninstall(name).await?;
            Ok(format!("Service {} uninstalled", name))
        }
        ServiceAction::Start => {
            manager.start(name).await?;
            Ok(format!("Service {} started", name))
        }
        ServiceAction::Stop => {
            manager.stop(name).await?;
            Ok(format!("Service {} stopped", name))
        }
        ServiceAction::Restart => {
            if manager.query(name).await? == ServiceState::Running {
                manager.stop(name).await?;
            }
            manager.start(name).await?;
            Ok(format!("Service {} restarted", name))
        }
        ServiceAction::Status => {
            let state = manager.query(name).await?;
            Ok(format!("Service {} is {:?}", name, state))
        }
    }
}

/// Detect the service manager available on the system
pub fn detect_service_manager() -> Result<Arc<dyn ServiceManager>> {
    detect_with(&["which", "systemctl"])
}

/// Use systemd when `probe` runs successfully
fn detect_with(probe: &[&str]) -> Result<Arc<dyn ServiceManager>> {
    let Some((program, args)) = probe.split_first() else {
        bail!("Empty service manager probe");
    };
    let available = Command::new(program)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    if available {
        Ok(Arc::new(systemd::SystemdManager::new()))
    } else {
        bail!("No supported service manager found (systemd is required)")
    }
}
