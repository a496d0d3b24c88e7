//! Server communication
//!
//! Wire types for the configuration the server hands out per backend, the
//! [`ConfigurationSource`] seam the reconciliation loop fetches through, and the
//! heartbeat that reports backend health back to the server.

use crate::backends::status::BackendStatus;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration descriptor returned by the server for one backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfiguration {
    #[serde(default)]
    pub inputs: Vec<ConfigurationEntry>,
    #[serde(default)]
    pub outputs: Vec<ConfigurationEntry>,
    #[serde(default)]
    pub snippets: Vec<SnippetEntry>,
}

/// Input or output entry tagged with the backend it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub backend_id: String,
    #[serde(rename = "type", default)]
    pub entry_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Raw configuration text tagged with the backend it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetEntry {
    pub backend_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub text: String,
}

impl ServerConfiguration {
    pub fn inputs_for<'a>(
        &'a self,
        backend_id: &'a str,
    ) -> impl Iterator<Item = &'a ConfigurationEntry> + 'a {
        self.inputs
            .iter()
            .filter(move |entry| entry.backend_id == backend_id)
    }

    pub fn outputs_for<'a>(
        &'a self,
        backend_id: &'a str,
    ) -> impl Iterator<Item = &'a ConfigurationEntry> + 'a {
        self.outputs
            .iter()
            .filter(move |entry| entry.backend_id == backend_id)
    }

    pub fn snippets_for<'a>(
        &'a self,
        backend_id: &'a str,
    ) -> impl Iterator<Item = &'a SnippetEntry> + 'a {
        self.snippets
            .iter()
            .filter(move |entry| entry.backend_id == backend_id)
    }
}

/// Where the reconciliation loop gets its configuration from.
///
/// An `Err` is treated as transient: the cycle is skipped and retried on the
/// next interval.
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn fetch(&self, backend_id: &str) -> Result<ServerConfiguration>;
}

/// Fetches configuration from the server's REST API
pub struct HttpConfigurationSource {
    client: reqwest::Client,
    server_url: String,
    node_id: String,
    api_token: String,
}

impl HttpConfigurationSource {
    pub fn new(server_url: &str, node_id: &str, api_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sidecar/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            node_id: node_id.to_string(),
            api_token: api_token.to_string(),
        })
    }

    pub fn configuration_url(&self, backend_id: &str) -> String {
        format!(
            "{}/sidecar/configurations/{}/{}",
            self.server_url, self.node_id, backend_id
        )
    }
}

#[async_trait]
impl ConfigurationSource for HttpConfigurationSource {
    async fn fetch(&self, backend_id: &str) -> Result<ServerConfiguration> {
        let url = self.configuration_url(backend_id);
        debug!("Fetching configuration from {}", url);

        let mut request = self.client.get(&url);
        if !self.api_token.is_empty() {
            request = request.bearer_auth(&self.api_token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach server at {}", url))?;

        if !response.status().is_success() {
            bail!("Server answered {} for {}", response.status(), url);
        }

        response
            .json::<ServerConfiguration>()
            .await
            .with_context(|| format!("Invalid configuration received from {}", url))
    }
}

/// Reads configuration from a local file instead of the server
pub struct FileConfigurationSource {
    path: PathBuf,
}

impl FileConfigurationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigurationSource for FileConfigurationSource {
    async fn fetch(&self, _backend_id: &str) -> Result<ServerConfiguration> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let configuration = match self.path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => bail!(
                "Unsupported configuration file format: {}",
                self.path.display()
            ),
        };

        Ok(configuration)
    }
}

/// Health of one backend as sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReport {
    pub id: String,
    pub name: String,
    pub status: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_message: Option<String>,
}

impl BackendReport {
    pub fn new(id: &str, name: &str, status: &BackendStatus) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: status.state.code(),
            message: status.message.clone(),
            verbose_message: status.verbose_message.clone(),
        }
    }
}

/// Heartbeat payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub node_id: String,
    pub node_name: String,
    pub tags: Vec<String>,
    pub operating_system: String,
    pub backends: Vec<BackendReport>,
}

/// Periodically tells the server how the collectors are doing
pub struct StatusReporter {
    client: reqwest::Client,
    url: String,
    api_token: String,
}

impl StatusReporter {
    pub fn new(server_url: &str, node_id: &str, api_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sidecar/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/sidecars/{}", server_url.trim_end_matches('/'), node_id),
            api_token: api_token.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn report(&self, request: &StatusRequest) -> Result<()> {
        let mut builder = self.client.put(&self.url).json(request);
        if !self.api_token.is_empty() {
            builder = builder.bearer_auth(&self.api_token);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send status to {}", self.url))?;

        if !response.status().is_success() {
            bail!("Server rejected status update: {}", response.status());
        }

        Ok(())
    }
}
