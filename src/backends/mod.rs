//! Collector backends
//!
//! A backend is the capability object for one managed collector: it knows its
//! identity, how to launch the collector, how to render the collector's
//! configuration from the server's description and how to ask the collector
//! to check that configuration. Concrete families plug in through the
//! [`registry`] so the supervision engine never names them.

pub mod filebeat;
pub mod generic;
pub mod registry;
pub mod render;
pub mod status;

use crate::api::{BackendReport, ServerConfiguration};
use crate::config::{expand_parameters, AgentContext, BackendDescriptor};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use render::{RenderOutcome, RenderPipeline, Renderer};
use serde::{Deserialize, Serialize};
use status::{BackendState, BackendStatus, StatusCell};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// How a collector process is owned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Spawned and supervised as a child process
    #[default]
    Exec,
    /// Installed and controlled through the OS service manager
    Svc,
}

/// Capability interface implemented once per collector family
#[async_trait]
pub trait Backend: Send + Sync {
    fn id(&self) -> &str;

    /// Stable name used for logs, status and service names
    fn name(&self) -> &str;

    /// Registry key this backend was built from
    fn backend_type(&self) -> &str;

    fn driver(&self) -> Driver;

    /// Resolved, access-checked executable
    fn exec_path(&self) -> Result<PathBuf>;

    fn exec_args(&self) -> Vec<String>;

    fn configuration_path(&self) -> &Path;

    /// Render the configuration and report whether the file changed
    async fn render_on_change(&self, response: &ServerConfiguration) -> bool;

    /// Run the collector's own configuration test
    async fn validate_configuration_file(&self) -> bool;

    fn set_status(&self, state: BackendState, message: &str);

    fn set_verbose_status(&self, verbose: &str);

    fn reset_status(&self, state: BackendState, message: &str);

    fn status(&self) -> BackendStatus;

    fn report(&self) -> BackendReport {
        BackendReport::new(self.id(), self.name(), &self.status())
    }
}

/// Backend built from a descriptor and a family-specific renderer
pub struct CollectorBackend<R: Renderer> {
    descriptor: BackendDescriptor,
    context: Arc<AgentContext>,
    pipeline: RenderPipeline<R>,
    status: StatusCell,
    exec_args: Vec<String>,
    validation_args: Vec<String>,
}

impl<R: Renderer> CollectorBackend<R> {
    pub fn new(descriptor: BackendDescriptor, context: Arc<AgentContext>, renderer: R) -> Result<Self> {
        let configuration_path =
            descriptor.resolved_configuration_path(&context.collector_configuration_directory);
        let exec_args = expand_parameters(&descriptor.execute_parameters, &configuration_path)
            .with_context(|| format!("[{}] Invalid execute_parameters", descriptor.name))?;
        let validation_args =
            expand_parameters(&descriptor.validation_parameters, &configuration_path)
                .with_context(|| format!("[{}] Invalid validation_parameters", descriptor.name))?;

        Ok(Self {
            pipeline: RenderPipeline::new(renderer, configuration_path),
            descriptor,
            context,
            status: StatusCell::new(),
            exec_args,
            validation_args,
        })
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    pub fn pipeline(&self) -> &RenderPipeline<R> {
        &self.pipeline
    }
}

#[async_trait]
impl<R: Renderer> Backend for CollectorBackend<R> {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn backend_type(&self) -> &str {
        &self.descriptor.backend_type
    }

    fn driver(&self) -> Driver {
        self.descriptor.driver
    }

    fn exec_path(&self) -> Result<PathBuf> {
        let path = resolve_executable(&self.descriptor.executable_path)?;
        check_accesslist(&path, &self.context.accesslist)?;
        Ok(path)
    }

    fn exec_args(&self) -> Vec<String> {
        self.exec_args.clone()
    }

    fn configuration_path(&self) -> &Path {
        self.pipeline.path()
    }

    async fn render_on_change(&self, response: &ServerConfiguration) -> bool {
        if let Err(e) = ensure_outside_accesslist(self.pipeline.path(), &self.context.accesslist) {
            let message = format!("{:#}", e);
            error!("[{}] {}", self.name(), message);
            self.set_status(BackendState::Error, &message);
            return false;
        }

        match self.pipeline.render_on_change(self.id(), response).await {
            Ok(RenderOutcome::Changed) => {
                info!(
                    "[{}] Configuration change detected, rewrote {}",
                    self.name(),
                    self.pipeline.path().display()
                );
                true
            }
            Ok(RenderOutcome::Unchanged) => {
                debug!("[{}] Configuration unchanged", self.name());
                false
            }
            Err(e) => {
                let message = format!("Failed to render configuration: {:#}", e);
                error!("[{}] {}", self.name(), message);
                self.set_status(BackendState::Error, &message);
                false
            }
        }
    }

    async fn validate_configuration_file(&self) -> bool {
        if self.validation_args.is_empty() {
            warn!(
                "[{}] No validation parameters configured, skipping configuration test",
                self.name()
            );
            return true;
        }

        let program = match self.exec_path() {
            Ok(program) => program,
            Err(e) => {
                error!("[{}] Cannot run configuration test: {:#}", self.name(), e);
                return false;
            }
        };

        let mut command = Command::new(&program);
        command
            .args(&self.validation_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.context.validation_timeout, command.output()).await {
            Err(_) => {
                error!(
                    "[{}] Configuration test timed out after {:?}",
                    self.name(),
                    self.context.validation_timeout
                );
                false
            }
            Ok(Err(e)) => {
                error!(
                    "[{}] Failed to run configuration test {}: {}",
                    self.name(),
                    program.display(),
                    e
                );
                false
            }
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                error!(
                    "[{}] Configuration test failed ({}): {}",
                    self.name(),
                    output.status,
                    combined.trim()
                );
                false
            }
        }
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

/// Find an executable by path, or by name on `PATH`
pub fn resolve_executable(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        bail!("No executable path configured");
    }

    if path.is_absolute() || path.components().count() > 1 {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        bail!("{} does not exist or is not executable", path.display());
    }

    let search_path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(path))
        .find(|candidate| is_executable(candidate))
        .with_context(|| format!("{} not found in PATH", path.display()))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Executables must live under one of the access-list entries, if any are set
pub fn check_accesslist(executable: &Path, accesslist: &[PathBuf]) -> Result<()> {
    if accesslist.is_empty() {
        return Ok(());
    }

    let executable = normalize(executable);
    if accesslist
        .iter()
        .any(|allowed| executable.starts_with(normalize(allowed)))
    {
        Ok(())
    } else {
        bail!(
            "{} is not in the collector binaries access list",
            executable.display()
        )
    }
}

/// Rendered configuration must never overwrite an allowed binary location
pub fn ensure_outside_accesslist(configuration: &Path, accesslist: &[PathBuf]) -> Result<()> {
    let configuration = normalize(configuration);
    if let Some(allowed) = accesslist
        .iter()
        .find(|allowed| configuration.starts_with(normalize(allowed)))
    {
        bail!(
            "Configuration path {} is inside the access-listed directory {}",
            configuration.display(),
            allowed.display()
        );
    }
    Ok(())
}
