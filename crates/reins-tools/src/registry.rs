//! Shared registry of callable tools.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::tool::{Tool, ToolDefinition};

/// Name-keyed tool catalogue shared across the runtime.
///
/// Mutations happen inside lifecycle side effects, so registration order is
/// driven by integration enable/disable; a re-register under an existing
/// name replaces the prior tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry behind a shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Mounts `tool` under its declared name, replacing any prior tool.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool)
            .is_some();
        if replaced {
            tracing::debug!(tool = %name, "replaced previously registered tool");
        } else {
            tracing::debug!(tool = %name, "registered tool");
        }
    }

    /// Withdraws the tool registered under `name`. True when one existed.
    pub fn remove(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Withdraws every tool whose name starts with `prefix`; returns the
    /// number removed. Lifecycle disable uses `"<integration_id>."`.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<String> = tools
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in &doomed {
            tools.remove(name);
        }
        doomed.len()
    }

    /// Looks up a tool by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns true when a tool is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Returns every registered definition, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|tool| tool.definition())
            .collect();
        definitions.sort_by(|left, right| left.name.cmp(&right.name));
        definitions
    }

    /// Returns the number of registered tools.
    pub fn len(&self) -> usize {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
