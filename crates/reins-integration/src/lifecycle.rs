//! Drives integrations through the state machine with side effects at the
//! transition boundaries.
//!
//! Side effects run strictly before the state change they justify: a failed
//! connect leaves the lifecycle at or before `configured`, and tool-registry
//! mutations land before listeners observe the corresponding transition.
//! Transitions for one integration never interleave; a per-id async lock
//! serializes them.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use reins_core::{IntegrationError, IntegrationResult};
use reins_credentials::{normalize_integration_id, CredentialVault};
use reins_tools::ToolRegistry;

use crate::contract::Integration;
use crate::manifest::StatusIndicator;
use crate::meta::OperationTool;
use crate::registry::IntegrationRegistry;
use crate::state::{IntegrationState, IntegrationStateMachine};

/// Orchestrates enable/disable/suspend against the state machine, the tool
/// registry, and the vault.
pub struct LifecycleManager {
    registry: Arc<IntegrationRegistry>,
    state_machine: Arc<IntegrationStateMachine>,
    tool_registry: Arc<ToolRegistry>,
    vault: Arc<dyn CredentialVault>,
    id_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LifecycleManager {
    /// Wires a manager over the given collaborators.
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        state_machine: Arc<IntegrationStateMachine>,
        tool_registry: Arc<ToolRegistry>,
        vault: Arc<dyn CredentialVault>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            state_machine,
            tool_registry,
            vault,
            id_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Current lifecycle state, or `None` for unknown integrations.
    pub fn state(&self, integration_id: &str) -> Option<IntegrationState> {
        let id = normalize_integration_id(integration_id).ok()?;
        self.state_machine.state(&id)
    }

    /// Brings an integration to `active`: connect, expose operation tools,
    /// and walk installed/configured → connected → active. Idempotent when
    /// already active; resumes a suspended integration.
    pub async fn enable(&self, integration_id: &str) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let guard = self.id_lock(&id);
        let _guard = guard.lock().await;

        let integration = self
            .registry
            .get(&id)
            .ok_or_else(|| unknown_integration(&id))?;
        self.state_machine.track(&id);

        loop {
            let state = self
                .state_machine
                .state(&id)
                .ok_or_else(|| unknown_integration(&id))?;
            match state {
                IntegrationState::Disconnected => {
                    self.transition_and_record(&id, IntegrationState::Installed)?;
                }
                IntegrationState::Installed => {
                    self.transition_and_record(&id, IntegrationState::Configured)?;
                }
                IntegrationState::Configured => {
                    integration.connect().await?;
                    self.transition_and_record(&id, IntegrationState::Connected)?;
                }
                IntegrationState::Connected | IntegrationState::Suspended => {
                    self.register_operation_tools(&id, &integration);
                    self.transition_and_record(&id, IntegrationState::Active)?;
                    self.registry
                        .update_status(&id, StatusIndicator::Connected, None)?;
                    tracing::info!(integration_id = %id, "integration enabled");
                    return Ok(());
                }
                IntegrationState::Active => return Ok(()),
            }
        }
    }

    /// Tears an integration down to `disconnected`: disconnect, withdraw its
    /// tools, revoke its credentials. Idempotent when already disconnected.
    pub async fn disable(&self, integration_id: &str) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let guard = self.id_lock(&id);
        let _guard = guard.lock().await;

        let integration = self
            .registry
            .get(&id)
            .ok_or_else(|| unknown_integration(&id))?;
        let state = self
            .state_machine
            .state(&id)
            .ok_or_else(|| unknown_integration(&id))?;
        if state == IntegrationState::Disconnected {
            return Ok(());
        }

        if matches!(
            state,
            IntegrationState::Connected | IntegrationState::Active | IntegrationState::Suspended
        ) {
            integration.disconnect().await?;
        }
        let withdrawn = self.tool_registry.remove_prefix(&format!("{id}."));
        self.vault.revoke(&id).await?;
        self.transition_and_record(&id, IntegrationState::Disconnected)?;
        self.registry
            .update_status(&id, StatusIndicator::Disconnected, None)?;
        tracing::info!(
            integration_id = %id,
            tools_withdrawn = withdrawn,
            "integration disabled"
        );
        Ok(())
    }

    /// Parks an active integration at `suspended` without tearing it down.
    /// Operation tools are withdrawn; credentials stay in the vault.
    pub async fn suspend(&self, integration_id: &str) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let guard = self.id_lock(&id);
        let _guard = guard.lock().await;

        let state = self
            .state_machine
            .state(&id)
            .ok_or_else(|| unknown_integration(&id))?;
        if state != IntegrationState::Active {
            return Err(IntegrationError::state_transition(format!(
                "integration '{id}' cannot transition from '{}' to '{}'",
                state.as_str(),
                IntegrationState::Suspended.as_str()
            )));
        }
        self.tool_registry.remove_prefix(&format!("{id}."));
        self.transition_and_record(&id, IntegrationState::Suspended)?;
        tracing::info!(integration_id = %id, "integration suspended");
        Ok(())
    }

    fn register_operation_tools(&self, id: &str, integration: &Arc<dyn Integration>) {
        for descriptor in integration.operations() {
            self.tool_registry.register(Arc::new(OperationTool::new(
                id,
                integration.clone(),
                descriptor,
            )));
        }
    }

    fn transition_and_record(&self, id: &str, to: IntegrationState) -> IntegrationResult<()> {
        self.state_machine.transition(id, to)?;
        self.registry.record_state(id, to)?;
        Ok(())
    }

    fn id_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.id_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn unknown_integration(id: &str) -> IntegrationError {
    IntegrationError::validation(format!("integration '{id}' is not registered"))
}
