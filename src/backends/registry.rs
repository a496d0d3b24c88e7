//! Backend registry
//!
//! Process-wide mapping from backend type name to the factory that builds it.
//! Built-in families are registered when the registry is first touched; more
//! can be added at runtime. The first registration of a name wins.

use super::{filebeat, generic, Backend};
use crate::config::{AgentContext, BackendDescriptor};
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::error;

/// Constructor for one backend family
pub type BackendFactory =
    Arc<dyn Fn(BackendDescriptor, Arc<AgentContext>) -> Result<Arc<dyn Backend>> + Send + Sync>;

// Global backend registry, seeded with the built-in families
static BACKEND_REGISTRY: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
    let mut registry = HashMap::new();

    // Initialize with built-in backends
    BackendRegistry::initialize_builtin_backends(&mut registry);

    RwLock::new(registry)
});

/// Backend factory registry for runtime extensibility
pub struct BackendRegistry;

impl BackendRegistry {
    /// Register a backend factory.
    ///
    /// Returns `false` and logs an error when `name` is already bound; the
    /// existing factory stays in place.
    pub fn register(name: &str, factory: BackendFactory) -> bool {
        let mut registry = match BACKEND_REGISTRY.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::insert(&mut registry, name, factory)
    }

    /// Look up the factory for a backend type
    pub fn resolve(name: &str) -> Result<BackendFactory> {
        let registry = match BACKEND_REGISTRY.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("No backend registered for type: {}", name))
    }

    /// Build a backend from its descriptor
    pub fn create(
        descriptor: BackendDescriptor,
        context: Arc<AgentContext>,
    ) -> Result<Arc<dyn Backend>> {
        let factory = Self::resolve(&descriptor.backend_type)?;
        factory(descriptor, context)
    }

    /// Get all registered backend types
    pub fn registered_names() -> Vec<String> {
        let registry = match BACKEND_REGISTRY.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(
        registry: &mut HashMap<String, BackendFactory>,
        name: &str,
        factory: BackendFactory,
    ) -> bool {
        if registry.contains_key(name) {
            error!("Backend type {} is already registered, ignoring", name);
            return false;
        }
        registry.insert(name.to_string(), factory);
        true
    }

    /// Initialize the registry with built-in backends
    pub fn initialize_builtin_backends(registry: &mut HashMap<String, BackendFactory>) {
        Self::insert(registry, generic::BACKEND_TYPE, generic::factory());
        Self::insert(registry, filebeat::BACKEND_TYPE, filebeat::factory());
    }
}
