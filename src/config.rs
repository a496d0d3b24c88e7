//! Configuration management for the sidecar
//!
//! This module provides the agent configuration structures, file loading by
//! extension (YAML, JSON or TOML), validation and the node identity lookup.

use crate::backends::render::TemplateVariables;
use crate::backends::Driver;
use crate::daemon::SupervisionPolicy;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the server API
    pub server_url: String,
    /// Token sent as bearer authentication
    pub server_api_token: String,
    /// Node identity, either literal or `file:<path>`
    pub node_id: String,
    /// Display name, defaults to the hostname
    pub node_name: Option<String>,
    /// Seconds between reconciliation cycles and heartbeats
    pub update_interval: u64,
    /// Whether to report backend status to the server
    pub send_status: bool,
    pub tags: Vec<String>,
    /// Directory receiving collector stdout/stderr captures
    pub log_path: PathBuf,
    /// Default directory for rendered collector configuration
    pub collector_configuration_directory: PathBuf,
    /// Seconds a collector's config test may take
    pub collector_validation_timeout: u64,
    /// Seconds between graceful stop and force kill
    pub collector_shutdown_timeout: u64,
    /// Directories collector executables must live in. Empty disables the check.
    pub collector_binaries_accesslist: Vec<PathBuf>,
    /// Read configuration from this file instead of the server
    pub local_configuration: Option<PathBuf>,
    /// Port for the `/health` and `/status` endpoints
    pub status_port: Option<u16>,
    pub backends: Vec<BackendDescriptor>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9000/api/".to_string(),
            server_api_token: String::new(),
            node_id: String::new(),
            node_name: None,
            update_interval: 10,
            send_status: true,
            tags: Vec::new(),
            log_path: PathBuf::from("/var/log/sidecar"),
            collector_configuration_directory: PathBuf::from("/var/lib/sidecar/generated"),
            collector_validation_timeout: 60,
            collector_shutdown_timeout: 10,
            collector_binaries_accesslist: Vec::new(),
            local_configuration: None,
            status_port: None,
            backends: Vec::new(),
        }
    }
}

/// One managed collector as declared in the agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub name: String,
    /// Registry key selecting the backend implementation
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub driver: Driver,
    pub executable_path: PathBuf,
    #[serde(default)]
    pub configuration_path: Option<PathBuf>,
    #[serde(default)]
    pub execute_parameters: String,
    #[serde(default)]
    pub validation_parameters: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

pub fn default_true() -> bool {
    true
}

impl BackendDescriptor {
    /// Explicit configuration path or `<dir>/<name>.conf`
    pub fn resolved_configuration_path(&self, directory: &Path) -> PathBuf {
        self.configuration_path
            .clone()
            .unwrap_or_else(|| directory.join(format!("{}.conf", self.name)))
    }
}

/// Split a parameter string like a shell would, then substitute `%s` with the
/// configuration path inside each argument. The path never goes through the
/// shell-word parser, so spaces and quotes in it stay within one argument.
pub fn expand_parameters(parameters: &str, configuration_path: &Path) -> Result<Vec<String>> {
    let path = configuration_path.to_string_lossy();
    let arguments = shlex::split(parameters)
        .with_context(|| format!("Unable to parse parameters: {}", parameters))?;

    Ok(arguments
        .into_iter()
        .map(|argument| argument.replace("%s", &path))
        .collect())
}

/// Runtime facts every backend needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub node_id: String,
    pub node_name: String,
    pub tags: Vec<String>,
    pub log_path: PathBuf,
    pub collector_configuration_directory: PathBuf,
    pub validation_timeout: Duration,
    pub accesslist: Vec<PathBuf>,
}

impl AgentContext {
    pub fn template_variables(&self) -> TemplateVariables {
        TemplateVariables {
            node_id: self.node_id.clone(),
            node_name: self.node_name.clone(),
            tags: self.tags.clone(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

impl AgentConfig {
    /// Reject configurations the agent cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id is required");
        }

        if self.update_interval == 0 {
            bail!("update_interval must be greater than zero");
        }

        if !self.collector_configuration_directory.is_absolute() {
            bail!(
                "collector_configuration_directory must be an absolute path: {}",
                self.collector_configuration_directory.display()
            );
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                bail!("Backend {} has an empty id", backend.name);
            }
            if !seen.insert(backend.id.as_str()) {
                bail!("Duplicate backend id: {}", backend.id);
            }
        }

        Ok(())
    }

    pub fn supervision_policy(&self) -> SupervisionPolicy {
        SupervisionPolicy {
            grace_period: Duration::from_secs(self.collector_shutdown_timeout),
            ..SupervisionPolicy::default()
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }

    /// Resolve node identity and name
    pub fn context(&self) -> Result<AgentContext> {
        let node_id = resolve_node_id(&self.node_id)?;
        let node_name = match &self.node_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => hostname::get()
                .context("Failed to read hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(AgentContext {
            node_id,
            node_name,
            tags: self.tags.clone(),
            log_path: self.log_path.clone(),
            collector_configuration_directory: self.collector_configuration_directory.clone(),
            validation_timeout: Duration::from_secs(self.collector_validation_timeout),
            accesslist: self.collector_binaries_accesslist.clone(),
        })
    }
}

/// Resolve a node id.
///
/// `file:<path>` reads the id from the file, generating and persisting a new
/// UUID when the file is missing or empty. Anything else is used literally.
pub fn resolve_node_id(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let Some(path) = raw.strip_prefix("file:") else {
        return Ok(raw.to_string());
    };
    let path = Path::new(path.trim());

    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read node id from {}", path.display()))?;
        let id = content.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::write(path, &id)
        .with_context(|| format!("Failed to persist node id to {}", path.display()))?;
    info!("Generated node id {} in {}", id, path.display());

    Ok(id)
}

/// `/etc/sidecar/sidecar.yml` when present, otherwise the user config dir
pub fn default_config_path() -> PathBuf {
    let system_config = PathBuf::from("/etc/sidecar/sidecar.yml");
    if system_config.exists() {
        system_config
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sidecar")
            .join("sidecar.yml")
    }
}

/// Load agent configuration, picking the format from the file extension
pub fn load_agent_config(config_file: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(config_file)
        .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;

    let config: AgentConfig = match config_file.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        _ => {
            return Err(anyhow::anyhow!(
                "Unsupported config file format: {}",
                config_file.display()
            ));
        }
    };

    Ok(config)
}
