//! Generic backend
//!
//! Drives any collector whose configuration is a plain text file. The file
//! content is the snippet the server tags with this backend's id, rendered as
//! a template against the host's variables.

use super::registry::BackendFactory;
use super::render::{Renderer, TemplateVariables};
use super::{Backend, CollectorBackend};
use crate::api::ServerConfiguration;
use crate::config::{AgentContext, BackendDescriptor};
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

pub const BACKEND_TYPE: &str = "generic";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericConfig {
    pub template: String,
}

pub struct GenericRenderer {
    variables: TemplateVariables,
}

impl GenericRenderer {
    pub fn new(variables: TemplateVariables) -> Self {
        Self { variables }
    }
}

impl Renderer for GenericRenderer {
    type Config = GenericConfig;

    /// The last snippet tagged for the backend wins
    fn build(&self, backend_id: &str, response: &ServerConfiguration) -> Result<GenericConfig> {
        let snippets: Vec<_> = response.snippets_for(backend_id).collect();
        if snippets.len() > 1 {
            warn!(
                "{} snippets tagged for backend {}, using the last one",
                snippets.len(),
                backend_id
            );
        }

        let template = snippets
            .last()
            .map(|snippet| self.variables.render_snippet(&snippet.text))
            .unwrap_or_default();

        Ok(GenericConfig { template })
    }

    fn serialize(&self, config: &GenericConfig) -> Result<String> {
        Ok(config.template.clone())
    }
}

pub fn factory() -> BackendFactory {
    Arc::new(
        |descriptor: BackendDescriptor, context: Arc<AgentContext>| -> Result<Arc<dyn Backend>> {
            let renderer = GenericRenderer::new(context.template_variables());
            let backend = CollectorBackend::new(descriptor, context, renderer)?;
            Ok(Arc::new(backend))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SnippetEntry;

    fn renderer() -> GenericRenderer {
        GenericRenderer::new(TemplateVariables {
            node_id: "node-1".to_string(),
            node_name: "web01".to_string(),
            tags: vec!["prod".to_string()],
            os: "linux".to_string(),
        })
    }

    fn snippet(backend_id: &str, text: &str) -> SnippetEntry {
        SnippetEntry {
            backend_id: backend_id.to_string(),
            name: "main".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_empty_response_builds_empty_template() {
        let config = renderer()
            .build("gen", &ServerConfiguration::default())
            .unwrap();
        assert_eq!(config, GenericConfig::default());
    }

    #[test]
    fn test_uses_last_snippet_for_backend() {
        let response = ServerConfiguration {
            snippets: vec![
                snippet("gen", "first"),
                snippet("other", "ignored"),
                snippet("gen", "host={{ node_name }} tags={{ tags | join(',') }}"),
            ],
            ..Default::default()
        };

        let renderer = renderer();
        let config = renderer.build("gen", &response).unwrap();
        assert_eq!(renderer.serialize(&config).unwrap(), "host=web01 tags=prod");
    }
}
