use std::collections::HashMap;
use std::sync::Arc;

use super::{Capability, CapabilityMeta};

/// Capability registry for looking up capabilities by name.
///
/// Constructed and populated at startup, then shared behind an `Arc`.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    metadata: HashMap<String, CapabilityMeta>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any previous one with the same name.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let meta = capability.metadata();
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            tracing::warn!(capability = %name, "replacing registered capability");
        }
        self.metadata.insert(name.clone(), meta);
        self.capabilities.insert(name, capability);
    }

    /// Builder-style register
    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Contract captured at registration time
    pub fn meta(&self, name: &str) -> Option<&CapabilityMeta> {
        self.metadata.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}
