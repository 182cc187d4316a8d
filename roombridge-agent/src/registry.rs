// ABOUTME: Registry for picking an agent backend by name at runtime.
// ABOUTME: Backends register factories; the bridge creates one from its [agent] config.

use crate::handle::AgentHandle;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Factory function that creates an AgentHandle from a JSON config blob
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<AgentHandle> + Send + Sync>;

pub struct AgentRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory by name
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<AgentHandle> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// Create a backend by name. Must be called inside a tokio runtime.
    pub fn create(&self, name: &str, config: &Value) -> Result<AgentHandle> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown agent backend '{}' (available: {})",
                name,
                self.available().join(", ")
            )
        })?;
        factory(config)
    }

    /// Registered backend names, sorted
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        use crate::backends::direct_cli::DirectCliBackend;
        use crate::backends::mock::MockBackend;

        Self::new()
            .register("direct", DirectCliBackend::factory())
            .register("mock", MockBackend::factory())
    }
}
