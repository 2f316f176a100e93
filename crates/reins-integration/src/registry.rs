//! In-memory catalogue of installed integrations.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use reins_core::{current_unix_timestamp_ms, IntegrationError, IntegrationResult};
use reins_credentials::normalize_integration_id;

use crate::contract::Integration;
use crate::manifest::{
    IntegrationConfig, IntegrationManifest, IntegrationRuntimeStatus, StatusIndicator,
};
use crate::state::IntegrationState;

struct RegisteredEntry {
    integration: Arc<dyn Integration>,
    config: IntegrationConfig,
    status: IntegrationRuntimeStatus,
}

/// Catalogue listing entry returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationCatalogEntry {
    pub manifest: IntegrationManifest,
    pub enabled: bool,
    pub status: IntegrationRuntimeStatus,
}

/// Id-keyed catalogue of installed integrations.
///
/// The registry exclusively owns the per-integration config flag and the
/// daemon's view of runtime status. `enable`/`disable` flip the flag only;
/// connection work belongs to the lifecycle manager.
#[derive(Default)]
pub struct IntegrationRegistry {
    entries: RwLock<BTreeMap<String, RegisteredEntry>>,
}

impl IntegrationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry behind a shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers `integration` as disabled. Refuses duplicate ids.
    /// Returns the normalized id.
    pub fn register(&self, integration: Arc<dyn Integration>) -> IntegrationResult<String> {
        let id = integration.manifest().normalized_id()?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&id) {
            return Err(IntegrationError::validation(format!(
                "integration '{id}' is already registered"
            )));
        }
        entries.insert(
            id.clone(),
            RegisteredEntry {
                integration,
                config: IntegrationConfig {
                    id: id.clone(),
                    enabled: false,
                },
                status: IntegrationRuntimeStatus::installed(current_unix_timestamp_ms()),
            },
        );
        tracing::debug!(integration_id = %id, "registered integration");
        Ok(id)
    }

    /// Looks up an integration handle by id.
    pub fn get(&self, integration_id: &str) -> Option<Arc<dyn Integration>> {
        let id = normalize_integration_id(integration_id).ok()?;
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.integration.clone())
    }

    /// Lists every installed integration with its config and status.
    pub fn list(&self) -> Vec<IntegrationCatalogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| IntegrationCatalogEntry {
                manifest: entry.integration.manifest().clone(),
                enabled: entry.config.enabled,
                status: entry.status.clone(),
            })
            .collect()
    }

    /// Flips the config flag on. Does no connection work.
    pub fn enable(&self, integration_id: &str) -> IntegrationResult<()> {
        self.set_enabled(integration_id, true)
    }

    /// Flips the config flag off. Does no connection work.
    pub fn disable(&self, integration_id: &str) -> IntegrationResult<()> {
        self.set_enabled(integration_id, false)
    }

    /// Returns the config flag for `integration_id`.
    pub fn is_enabled(&self, integration_id: &str) -> IntegrationResult<bool> {
        let id = normalize_integration_id(integration_id)?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&id)
            .map(|entry| entry.config.enabled)
            .ok_or_else(|| unknown_integration(&id))
    }

    /// Returns the daemon's status record for `integration_id`.
    pub fn status(&self, integration_id: &str) -> IntegrationResult<IntegrationRuntimeStatus> {
        let id = normalize_integration_id(integration_id)?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&id)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| unknown_integration(&id))
    }

    /// Overwrites the status indicator (and optional error) for
    /// `integration_id`, stamping the update time.
    pub fn update_status(
        &self,
        integration_id: &str,
        indicator: StatusIndicator,
        last_error: Option<String>,
    ) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&id).ok_or_else(|| unknown_integration(&id))?;
        entry.status.indicator = indicator;
        entry.status.last_error = last_error;
        entry.status.updated_unix_ms = current_unix_timestamp_ms();
        Ok(())
    }

    /// Records the lifecycle state into the status record.
    pub fn record_state(
        &self,
        integration_id: &str,
        state: IntegrationState,
    ) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&id).ok_or_else(|| unknown_integration(&id))?;
        entry.status.state = state;
        entry.status.updated_unix_ms = current_unix_timestamp_ms();
        Ok(())
    }

    fn set_enabled(&self, integration_id: &str, enabled: bool) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(&id).ok_or_else(|| unknown_integration(&id))?;
        entry.config.enabled = enabled;
        Ok(())
    }

    /// Returns every registered id.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

fn unknown_integration(id: &str) -> IntegrationError {
    IntegrationError::validation(format!("integration '{id}' is not registered"))
}
