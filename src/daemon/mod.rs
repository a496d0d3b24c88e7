//! Collector supervision
//!
//! A [`Runner`] owns the OS-level execution of exactly one backend, either as
//! a child process ([`exec_runner::ExecRunner`]) or through the service
//! manager ([`svc_runner::SvcRunner`]). The [`supervisor::Supervisor`] drives
//! all runners together.

pub mod exec_runner;
pub mod supervisor;
pub mod svc_runner;

use crate::backends::{Backend, Driver};
use crate::config::AgentContext;
use crate::services::ServiceManager;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Timing and budget knobs for crash recovery and stop handling
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    /// Exits sooner than this after spawning are logged as misconfiguration
    pub stability_threshold: Duration,
    /// A run longer than this resets the restart budget
    pub cooldown: Duration,
    /// Automatic restarts before giving up
    pub max_restarts: u32,
    /// Delay before an automatic respawn
    pub backoff: Duration,
    /// Time between the graceful signal and the force kill
    pub grace_period: Duration,
    /// Pause between stop and start during a restart
    pub settle_delay: Duration,
    pub service_poll_interval: Duration,
    pub service_transition_timeout: Duration,
    pub service_monitor_interval: Duration,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            stability_threshold: Duration::from_secs(3),
            cooldown: Duration::from_secs(60),
            max_restarts: 3,
            backoff: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            service_poll_interval: Duration::from_millis(500),
            service_transition_timeout: Duration::from_secs(30),
            service_monitor_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Exited on its own; either waiting for a respawn or out of budget
    Crashed,
}

/// How a stop request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Graceful,
    Killed,
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> Arc<dyn Backend>;

    fn state(&self) -> RunnerState;

    /// Whether the collector is alive right now
    async fn is_running(&self) -> bool;

    /// Processes or service starts issued so far
    fn spawn_count(&self) -> u64;

    /// Automatic restarts in the current crash-loop window
    fn restart_count(&self) -> u32;

    /// Check the runner can start; on failure the backend status is set to
    /// Error and nothing is spawned
    async fn validate_before_start(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Stop the collector. Safe to call when nothing is running.
    async fn stop(&self) -> Result<StopOutcome>;

    /// Stop, wait for the collector to be gone, then start again
    async fn restart(&self) -> Result<()>;
}

/// Build the runner matching the backend's driver
pub fn create_runner(
    backend: Arc<dyn Backend>,
    context: &AgentContext,
    policy: SupervisionPolicy,
    service_manager: Option<Arc<dyn ServiceManager>>,
) -> Result<Arc<dyn Runner>> {
    match backend.driver() {
        Driver::Exec => Ok(Arc::new(exec_runner::ExecRunner::new(
            backend,
            &context.log_path,
            policy,
        ))),
        Driver::Svc => {
            let manager = service_manager.with_context(|| {
                format!(
                    "[{}] The svc driver needs a service manager on this host",
                    backend.name()
                )
            })?;
            Ok(Arc::new(svc_runner::SvcRunner::new(backend, manager, policy)))
        }
    }
}

/// Lock a std mutex or rwlock guard, recovering from poisoning
macro_rules! lock_or_recover {
    ($lock:expr) => {
        match $lock {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    };
}

pub(crate) use lock_or_recover;
