//! Filebeat backend
//!
//! Maps the server's inputs and outputs onto a filebeat YAML document. Every
//! input becomes a `log` prospector carrying the node identity in its fields;
//! string property values are parsed as nested YAML so the server can hand out
//! lists and maps. Snippets are appended verbatim after the document.

use super::registry::BackendFactory;
use super::render::{Renderer, TemplateVariables};
use super::{Backend, CollectorBackend};
use crate::api::{ConfigurationEntry, ServerConfiguration};
use crate::config::{AgentContext, BackendDescriptor};
use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const BACKEND_TYPE: &str = "filebeat";

const TLS_PROPERTIES: [&str; 5] = ["tls", "ca_file", "cert_file", "cert_key_file", "tls_insecure"];
const MULTILINE_PROPERTIES: [&str; 4] = [
    "multiline",
    "multiline_pattern",
    "multiline_negate",
    "multiline_match",
];

/// Rendered filebeat configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BeatsConfig {
    /// YAML document; maps compare regardless of key order, lists in order
    pub document: Value,
    /// Raw snippets appended after the document
    pub snippets: Vec<String>,
}

pub struct FilebeatRenderer {
    variables: TemplateVariables,
}

impl FilebeatRenderer {
    pub fn new(variables: TemplateVariables) -> Self {
        Self { variables }
    }

    fn build_output(&self, root: &mut Map<String, Value>, output: &ConfigurationEntry) -> Result<()> {
        if output.entry_type.is_empty() {
            bail!("Output '{}' has no type", output.name);
        }
        let base = ["output", output.entry_type.as_str()];

        for (property, value) in &output.properties {
            if TLS_PROPERTIES.contains(&property.as_str()) {
                continue;
            }
            set_path(root, &[&base[..], &[property.as_str()]].concat(), lenient_yaml(value))?;
        }

        if property_bool(output.properties.get("tls")) {
            let tls = [base[0], base[1], "tls"];
            if let Some(ca_file) = non_empty(output.properties.get("ca_file")) {
                set_path(root, &[&tls[..], &["certificate_authorities"]].concat(), json!([ca_file]))?;
            }
            if let Some(cert_file) = non_empty(output.properties.get("cert_file")) {
                set_path(root, &[&tls[..], &["certificate"]].concat(), json!(cert_file))?;
            }
            if let Some(key_file) = non_empty(output.properties.get("cert_key_file")) {
                set_path(root, &[&tls[..], &["certificate_key"]].concat(), json!(key_file))?;
            }
            if property_bool(output.properties.get("tls_insecure")) {
                set_path(root, &[&tls[..], &["insecure"]].concat(), json!(true))?;
            }
        }

        Ok(())
    }

    fn build_input(&self, input: &ConfigurationEntry) -> Result<Value> {
        let mut prospector = Map::new();
        let mut fields = Map::new();
        fields.insert("gl2_source_collector".to_string(), json!(self.variables.node_id));
        fields.insert("collector_node_id".to_string(), json!(self.variables.node_name));
        prospector.insert("input_type".to_string(), json!("log"));

        for (property, value) in &input.properties {
            if (property == "include_lines" || property == "exclude_lines")
                && property_string(value) == "[]"
            {
                continue;
            }
            if MULTILINE_PROPERTIES.contains(&property.as_str()) || property == "fields" {
                continue;
            }
            prospector.insert(property.clone(), strict_yaml(value)?);
        }

        if property_bool(input.properties.get("multiline")) {
            let matcher = input
                .properties
                .get("multiline_match")
                .map(property_string)
                .unwrap_or_default();
            if matcher != "after" && matcher != "before" {
                bail!(
                    "Multiline match can either be 'after' or 'before', but not '{}'",
                    matcher
                );
            }

            let pattern = input
                .properties
                .get("multiline_pattern")
                .map(property_string)
                .unwrap_or_default();
            prospector.insert(
                "multiline".to_string(),
                json!({
                    "pattern": pattern,
                    "negate": property_bool(input.properties.get("multiline_negate")),
                    "match": matcher,
                }),
            );
        }

        if let Some(Value::Object(extra)) = input.properties.get("fields") {
            for (key, value) in extra {
                fields.insert(key.clone(), value.clone());
            }
        }
        prospector.insert("fields".to_string(), Value::Object(fields));

        Ok(Value::Object(prospector))
    }
}

impl Renderer for FilebeatRenderer {
    type Config = BeatsConfig;

    fn build(&self, backend_id: &str, response: &ServerConfiguration) -> Result<BeatsConfig> {
        let mut root = Map::new();
        set_path(&mut root, &["shipper", "tags"], json!(self.variables.tags))?;

        for output in response.outputs_for(backend_id) {
            self.build_output(&mut root, output)?;
        }

        let prospectors = response
            .inputs_for(backend_id)
            .map(|input| self.build_input(input))
            .collect::<Result<Vec<_>>>()?;
        set_path(&mut root, &["filebeat", "prospectors"], Value::Array(prospectors))?;

        let snippets = response
            .snippets_for(backend_id)
            .map(|snippet| self.variables.render_snippet(&snippet.text))
            .collect();

        Ok(BeatsConfig {
            document: Value::Object(root),
            snippets,
        })
    }

    fn serialize(&self, config: &BeatsConfig) -> Result<String> {
        let mut text = serde_yaml::to_string(&config.document)
            .context("Failed to serialize filebeat configuration")?;
        for snippet in &config.snippets {
            text.push_str(snippet);
            text.push('\n');
        }
        Ok(text)
    }
}

pub fn factory() -> BackendFactory {
    Arc::new(
        |descriptor: BackendDescriptor, context: Arc<AgentContext>| -> Result<Arc<dyn Backend>> {
            let renderer = FilebeatRenderer::new(context.template_variables());
            let backend = CollectorBackend::new(descriptor, context, renderer)?;
            Ok(Arc::new(backend))
        },
    )
}

/// Insert `value` at `path`, creating intermediate maps
fn set_path(root: &mut Map<String, Value>, path: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };

    let mut current = root;
    for key in parents {
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => bail!("Value collision while building path {}", path.join(".")),
        };
    }

    current.insert(last.to_string(), value);
    Ok(())
}

/// String values are nested YAML; anything that fails to parse is an error
fn strict_yaml(value: &Value) -> Result<Value> {
    match value {
        Value::String(text) if text.trim().is_empty() => Ok(Value::Null),
        Value::String(text) => serde_yaml::from_str(text)
            .with_context(|| format!("Nested YAML is not parsable: '{}'", text)),
        other => Ok(other.clone()),
    }
}

/// Like [`strict_yaml`] but keeps unparsable strings as they are
fn lenient_yaml(value: &Value) -> Value {
    strict_yaml(value).unwrap_or_else(|_| value.clone())
}

fn property_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

/// Booleans from the server arrive as bools or loosely typed strings; any
/// non-empty string that is not an explicit false counts as true
fn property_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            !text.is_empty() && !matches!(text.as_str(), "0" | "f" | "F" | "false" | "FALSE" | "False")
        }
        _ => false,
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value.map(property_string).filter(|text| !text.is_empty())
}
