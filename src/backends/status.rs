//! Backend health tracking
//!
//! Every backend carries a [`StatusCell`] that the runner and the reconciliation
//! loop write into and the status reporter reads from. An `Error` is sticky: it
//! survives later `Unknown` updates and keeps its first message until a
//! successful start or an explicit reset clears it. Later errors are kept in
//! the verbose message.

use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Coarse health of a collector backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Running,
    Unknown,
    Error,
}

impl BackendState {
    /// Numeric code used by the status report wire format
    pub fn code(&self) -> u8 {
        match self {
            BackendState::Running => 0,
            BackendState::Unknown => 1,
            BackendState::Error => 2,
        }
    }
}

/// Snapshot of a backend's health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub state: BackendState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_message: Option<String>,
}

impl Default for BackendStatus {
    fn default() -> Self {
        Self {
            state: BackendState::Unknown,
            message: String::new(),
            verbose_message: None,
        }
    }
}

/// Interior-mutable status holder shared between runner and reconciler
#[derive(Debug, Default)]
pub struct StatusCell {
    inner: RwLock<BackendStatus>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition.
    ///
    /// `Unknown` does not overwrite `Error`. A second, different `Error`
    /// keeps the first message and records itself in the verbose message.
    /// `Running` always wins and clears the verbose output.
    pub fn set(&self, state: BackendState, message: impl Into<String>) {
        let mut status = self.write();
        match (status.state, state) {
            (BackendState::Error, BackendState::Unknown) => {}
            (BackendState::Error, BackendState::Error) => {
                let message = message.into();
                if message != status.message {
                    append_verbose(&mut status, message);
                }
            }
            (_, BackendState::Running) => {
                status.state = state;
                status.message = message.into();
                status.verbose_message = None;
            }
            _ => {
                status.state = state;
                status.message = message.into();
            }
        }
    }

    /// Unconditionally replace the status
    pub fn reset(&self, state: BackendState, message: impl Into<String>) {
        let mut status = self.write();
        status.state = state;
        status.message = message.into();
        status.verbose_message = None;
    }

    /// Attach captured collector output to the current status, after any
    /// detail already recorded
    pub fn set_verbose(&self, verbose: impl Into<String>) {
        append_verbose(&mut self.write(), verbose.into());
    }

    pub fn get(&self) -> BackendStatus {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, BackendStatus> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BackendStatus> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn append_verbose(status: &mut BackendStatus, detail: String) {
    match status.verbose_message.as_mut() {
        Some(existing) if existing.contains(&detail) => {}
        Some(existing) => {
            existing.push('\n');
            existing.push_str(&detail);
        }
        None => status.verbose_message = Some(detail),
    }
}
