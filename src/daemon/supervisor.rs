//! Bulk control over all runners
//!
//! Failures of one runner never stop the others: start errors end up in the
//! backend's status and the log, not in the return value.

use super::Runner;
use anyhow::{bail, Result};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    runners: BTreeMap<String, Arc<dyn Runner>>,
    stop_timeout: Duration,
}

impl Supervisor {
    /// `stop_timeout` bounds how long `stop_all` waits for every runner to
    /// report not-running
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            runners: BTreeMap::new(),
            stop_timeout,
        }
    }

    pub fn add_runner(&mut self, backend_id: &str, runner: Arc<dyn Runner>) {
        if self
            .runners
            .insert(backend_id.to_string(), runner)
            .is_some()
        {
            warn!("Replaced runner for backend {}", backend_id);
        }
    }

    pub fn runner(&self, backend_id: &str) -> Option<Arc<dyn Runner>> {
        self.runners.get(backend_id).cloned()
    }

    pub fn runners(&self) -> impl Iterator<Item = (&String, &Arc<dyn Runner>)> {
        self.runners.iter()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Start every runner. Returns once each start call returned.
    pub async fn start_all(&self) {
        let starts = self.runners.values().map(|runner| async move {
            if let Err(e) = runner.start().await {
                error!("[{}] Failed to start: {:#}", runner.name(), e);
            }
        });
        join_all(starts).await;
    }

    /// Stop every runner and wait, bounded, until none reports running
    pub async fn stop_all(&self) -> Result<()> {
        info!("Stopping {} collector(s)", self.runners.len());
        let stops = self.runners.values().map(|runner| async move {
            if let Err(e) = runner.stop().await {
                error!("[{}] Failed to stop: {:#}", runner.name(), e);
            }
        });
        join_all(stops).await;

        let wait_all = async {
            loop {
                if self.still_running().await.is_empty() {
                    return;
                }
                sleep(STOP_POLL_INTERVAL).await;
            }
        };

        if timeout(self.stop_timeout, wait_all).await.is_err() {
            let remaining = self.still_running().await;
            bail!(
                "Collectors still running after {:?}: {}",
                self.stop_timeout,
                remaining.join(", ")
            );
        }
        Ok(())
    }

    pub async fn restart_all(&self) -> Result<()> {
        let stopped = self.stop_all().await;
        if let Err(e) = &stopped {
            warn!("Restarting despite incomplete stop: {:#}", e);
        }
        self.start_all().await;
        stopped
    }

    async fn still_running(&self) -> Vec<String> {
        let mut names = Vec::new();
        for runner in self.runners.values() {
            if runner.is_running().await {
                names.push(runner.name().to_string());
            }
        }
        names
    }
}
