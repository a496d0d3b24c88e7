//! Per-backend reconciliation
//!
//! Each cycle fetches the server configuration, renders it, and only when the
//! rendered file changed validates it and restarts the collector. A
//! configuration that fails validation is never applied to the running
//! collector; the backend goes to Error and the next change is tried again.

use crate::api::ConfigurationSource;
use crate::backends::status::BackendState;
use crate::backends::Backend;
use crate::daemon::Runner;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

pub const INVALID_CONFIGURATION_MESSAGE: &str =
    "Collector configuration file is not valid, waiting for the next update.";

/// Result of a single reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The configuration could not be fetched
    Skipped,
    Unchanged,
    Restarted,
    ValidationFailed,
    RestartFailed,
}

pub struct Reconciler {
    backend: Arc<dyn Backend>,
    runner: Arc<dyn Runner>,
    source: Arc<dyn ConfigurationSource>,
    cycles: AtomicU64,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn Backend>,
        runner: Arc<dyn Runner>,
        source: Arc<dyn ConfigurationSource>,
    ) -> Self {
        Self {
            backend,
            runner,
            source,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Fetch, render, validate and restart, in that order
    pub async fn reconcile_once(&self) -> CycleOutcome {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        let name = self.backend.name();

        let response = match self.source.fetch(self.backend.id()).await {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Can't fetch configuration from server: {:#}", name, e);
                return CycleOutcome::Skipped;
            }
        };

        if !self.backend.render_on_change(&response).await {
            return CycleOutcome::Unchanged;
        }

        if !self.backend.validate_configuration_file().await {
            error!("[{}] {}", name, INVALID_CONFIGURATION_MESSAGE);
            self.backend
                .set_status(BackendState::Error, INVALID_CONFIGURATION_MESSAGE);
            return CycleOutcome::ValidationFailed;
        }

        info!("[{}] Configuration changed, restarting collector", name);
        match self.runner.restart().await {
            Ok(()) => CycleOutcome::Restarted,
            Err(e) => {
                let message = format!("Failed to restart collector: {:#}", e);
                error!("[{}] {}", name, message);
                self.backend.set_status(BackendState::Error, &message);
                CycleOutcome::RestartFailed
            }
        }
    }

    /// Run cycles every `period` until `shutdown` flips to true. Cycles never
    /// overlap; a slow cycle delays the next tick instead of queueing more.
    #[instrument(skip_all, fields(backend = %self.backend.name()))]
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.reconcile_once().await;
                    debug!("[{}] Reconciliation cycle finished: {:?}", self.backend.name(), outcome);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("[{}] Reconciliation loop shutting down", self.backend.name());
                        return;
                    }
                }
            }
        }
    }
}
