//! Sidecar - host agent that supervises log collectors
//!
//! The agent fetches collector configuration from a central server, renders
//! it into each collector's native format, validates it and restarts the
//! collector when it changed. Collectors run either as supervised child
//! processes or as OS services.

pub mod agent;
pub mod api;
pub mod backends;
pub mod config;
pub mod daemon;
pub mod reconcile;
pub mod services;
