//! Render-on-change pipeline
//!
//! A [`Renderer`] turns the server's configuration for one backend into an
//! in-memory configuration object and serializes it to the collector's native
//! text format. The [`RenderPipeline`] keeps the last applied object and only
//! writes the file when a freshly built object differs from it structurally.
//! This is what keeps a stable server state from restarting collectors on
//! every poll.

use crate::api::ServerConfiguration;
use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Builds and serializes the configuration of one collector family
pub trait Renderer: Send + Sync + 'static {
    /// In-memory configuration, compared with `==` to detect changes
    type Config: Clone + PartialEq + Debug + Send + Sync;

    /// Build the configuration from the entries tagged with `backend_id`
    fn build(&self, backend_id: &str, response: &ServerConfiguration) -> Result<Self::Config>;

    /// Serialize to the collector's native format. Must be pure.
    fn serialize(&self, config: &Self::Config) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Changed,
    Unchanged,
}

/// Active snapshot plus the file it is written to
pub struct RenderPipeline<R: Renderer> {
    renderer: R,
    path: PathBuf,
    active: Mutex<Option<R::Config>>,
    writes: AtomicU64,
}

impl<R: Renderer> RenderPipeline<R> {
    pub fn new(renderer: R, path: impl Into<PathBuf>) -> Self {
        Self {
            renderer,
            path: path.into(),
            active: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Number of times the configuration file has been written
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Currently applied configuration, if any render succeeded yet
    pub async fn active(&self) -> Option<R::Config> {
        self.active.lock().await.clone()
    }

    /// Rebuild the configuration and write it out if it changed.
    ///
    /// The snapshot starts out empty, so the first successful render always
    /// reports `Changed`. The snapshot is only replaced after the file was
    /// written, so a failed write is retried on the next call.
    pub async fn render_on_change(
        &self,
        backend_id: &str,
        response: &ServerConfiguration,
    ) -> Result<RenderOutcome> {
        let candidate = self
            .renderer
            .build(backend_id, response)
            .context("Failed to build configuration")?;

        let mut active = self.active.lock().await;
        if active.as_ref() == Some(&candidate) {
            return Ok(RenderOutcome::Unchanged);
        }

        let text = self.renderer.serialize(&candidate)?;
        write_config_file(&self.path, &text).await?;
        debug!(
            "Wrote {} (sha256 {})",
            self.path.display(),
            content_digest(&text)
        );

        *active = Some(candidate);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(RenderOutcome::Changed)
    }
}

/// Create parent directories and write `contents` to `path`
pub async fn write_config_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write configuration {}", path.display()))
}

pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Host facts snippets may reference
#[derive(Debug, Clone, Serialize)]
pub struct TemplateVariables {
    pub node_id: String,
    pub node_name: String,
    pub tags: Vec<String>,
    pub os: String,
}

impl TemplateVariables {
    /// Render a snippet as a template. A snippet that does not parse as a
    /// template is returned unchanged and left to the collector's own check.
    pub fn render_snippet(&self, text: &str) -> String {
        let mut env = minijinja::Environment::new();
        env.set_keep_trailing_newline(true);

        match env.render_str(text, self) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("Snippet is not a valid template, using it verbatim: {}", e);
                text.to_string()
            }
        }
    }
}
