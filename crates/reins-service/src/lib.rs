//! The integration service facade.
//!
//! One constructed object wires the registry, state machine, vault, refresh
//! manager, and tool registry under a single contract: register bundled
//! integrations disabled, mount the meta-tool, and expose
//! list/status/enable/disable/execute. Execution routes through the
//! meta-tool so the host path and the LLM path share one pipeline.


use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;
use serde_json::json;

use reins_core::{IntegrationError, IntegrationErrorKind, IntegrationResult};
use reins_credentials::{
    normalize_integration_id, CredentialStatus, CredentialVault, EncryptedCredentialVault,
    InMemoryCredentialVault, RefreshManager, RefreshOptions, StatusUpdater,
};
use reins_crypto::KeyEncryption;
use reins_integration::{
    DualChannelResult, Integration, IntegrationCatalogEntry, IntegrationMetaTool,
    IntegrationRegistry, IntegrationState, IntegrationStateMachine, LifecycleManager,
    StatusIndicator, META_TOOL_NAME,
};
use reins_store::CredentialStore;
use reins_tools::{Tool, ToolCallContext, ToolRegistry};

/// Environment variable supplying the vault master secret when the config
/// does not carry one.
pub const CREDENTIAL_ENCRYPTION_KEY_ENV: &str = "REINS_CREDENTIAL_ENCRYPTION_KEY";

/// Factory producing the per-call context passed into tool executions.
pub type ToolContextFactory = Arc<dyn Fn() -> ToolCallContext + Send + Sync>;

/// Construction inputs recognised by the integration service.
pub struct IntegrationServiceConfig {
    /// Registry to mount the meta-tool and per-operation tools into.
    pub tool_registry: Arc<ToolRegistry>,
    /// Bundled integrations, registered as disabled on startup.
    pub integrations: Vec<Arc<dyn Integration>>,
    /// When present, credentials persist through the encrypted vault;
    /// otherwise the in-memory vault is used.
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    /// Vault crypto. Falls back to [`CREDENTIAL_ENCRYPTION_KEY_ENV`] when a
    /// store is configured without one.
    pub key_encryption: Option<Arc<KeyEncryption>>,
    /// Refresh manager tuning.
    pub refresh_options: RefreshOptions,
    /// Per-call tool context. Defaults to an empty context.
    pub tool_context_factory: Option<ToolContextFactory>,
}

impl IntegrationServiceConfig {
    /// Minimal config over a tool registry: no bundled integrations, vault
    /// in memory.
    pub fn new(tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            tool_registry,
            integrations: Vec::new(),
            credential_store: None,
            key_encryption: None,
            refresh_options: RefreshOptions::default(),
            tool_context_factory: None,
        }
    }
}

/// Aggregated health view for one integration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct IntegrationStatusReport {
    pub id: String,
    pub enabled: bool,
    pub state: IntegrationState,
    pub indicator: StatusIndicator,
    pub credential_status: CredentialStatus,
    pub last_error: Option<String>,
}

/// Routes `auth_expired` demotions from the refresh manager into the
/// registry's status record and parks the affected integration.
struct ServiceStatusUpdater {
    registry: Arc<IntegrationRegistry>,
    lifecycle: Arc<LifecycleManager>,
}

#[async_trait]
impl StatusUpdater for ServiceStatusUpdater {
    async fn update_status(&self, integration_id: &str, indicator: &str, message: &str) {
        let parsed = StatusIndicator::parse(indicator).unwrap_or(StatusIndicator::Unknown);
        if let Err(error) =
            self.registry
                .update_status(integration_id, parsed, Some(message.to_string()))
        {
            tracing::warn!(
                integration_id,
                indicator,
                error = %error,
                "failed to record status demotion"
            );
            return;
        }
        if parsed == StatusIndicator::AuthExpired
            && self.lifecycle.state(integration_id) == Some(IntegrationState::Active)
        {
            if let Err(error) = self.lifecycle.suspend(integration_id).await {
                tracing::warn!(
                    integration_id,
                    error = %error,
                    "failed to suspend integration after auth expiry"
                );
            }
        }
    }
}

/// Facade orchestrating the integration runtime. One instance per daemon,
/// owned by the runtime and injected where needed.
pub struct IntegrationService {
    registry: Arc<IntegrationRegistry>,
    state_machine: Arc<IntegrationStateMachine>,
    lifecycle: Arc<LifecycleManager>,
    vault: Arc<dyn CredentialVault>,
    refresh: Arc<RefreshManager>,
    tool_registry: Arc<ToolRegistry>,
    meta_tool: Arc<IntegrationMetaTool>,
    context_factory: Option<ToolContextFactory>,
    bundled: Mutex<Vec<Arc<dyn Integration>>>,
    started: AtomicBool,
}

impl IntegrationService {
    /// Builds the service from its config. Fails when a credential store is
    /// configured but no master secret is available.
    pub fn new(config: IntegrationServiceConfig) -> IntegrationResult<Arc<Self>> {
        let vault: Arc<dyn CredentialVault> = match config.credential_store {
            Some(store) => {
                let crypto = match config.key_encryption {
                    Some(crypto) => crypto,
                    None => {
                        let secret =
                            std::env::var(CREDENTIAL_ENCRYPTION_KEY_ENV).map_err(|_| {
                                IntegrationError::validation(format!(
                                    "credential store configured but neither key encryption nor \
                                     {CREDENTIAL_ENCRYPTION_KEY_ENV} is set"
                                ))
                            })?;
                        Arc::new(KeyEncryption::new(secret))
                    }
                };
                Arc::new(EncryptedCredentialVault::new(store, crypto))
            }
            None => InMemoryCredentialVault::shared(),
        };

        let registry = IntegrationRegistry::shared();
        let state_machine = IntegrationStateMachine::shared();
        let lifecycle = LifecycleManager::new(
            registry.clone(),
            state_machine.clone(),
            config.tool_registry.clone(),
            vault.clone(),
        );
        let status_updater = Arc::new(ServiceStatusUpdater {
            registry: registry.clone(),
            lifecycle: lifecycle.clone(),
        });
        let refresh = RefreshManager::new(vault.clone(), status_updater, config.refresh_options);
        let meta_tool = Arc::new(IntegrationMetaTool::new(
            registry.clone(),
            state_machine.clone(),
        ));

        Ok(Arc::new(Self {
            registry,
            state_machine,
            lifecycle,
            vault,
            refresh,
            tool_registry: config.tool_registry,
            meta_tool,
            context_factory: config.tool_context_factory,
            bundled: Mutex::new(config.integrations),
            started: AtomicBool::new(false),
        }))
    }

    /// Registers bundled integrations (disabled) and mounts the meta-tool.
    /// Idempotent: a second call changes nothing.
    pub async fn start(&self) -> IntegrationResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let bundled: Vec<Arc<dyn Integration>> = self
            .bundled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for integration in bundled {
            let id = self.registry.register(integration)?;
            self.state_machine.track(&id);
        }
        self.tool_registry.register(self.meta_tool.clone());
        tracing::info!("integration service started");
        Ok(())
    }

    /// Disables every connected integration, cancels refreshes, and
    /// withdraws the meta-tool. Idempotent.
    pub async fn stop(&self) -> IntegrationResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        for id in self.registry.ids() {
            if matches!(
                self.state_machine.state(&id),
                Some(
                    IntegrationState::Connected
                        | IntegrationState::Active
                        | IntegrationState::Suspended
                )
            ) {
                if let Err(error) = self.lifecycle.disable(&id).await {
                    tracing::warn!(
                        integration_id = %id,
                        error = %error,
                        "failed to disable integration during shutdown"
                    );
                }
            }
        }
        self.refresh.cancel_all();
        self.tool_registry.remove(META_TOOL_NAME);
        tracing::info!("integration service stopped");
        Ok(())
    }

    /// Returns true between `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Test hook: tears the service down to its pre-start state.
    pub async fn reset(&self) -> IntegrationResult<()> {
        self.stop().await
    }

    /// Lists installed integrations with config and status.
    pub fn list_integrations(&self) -> Vec<IntegrationCatalogEntry> {
        self.registry.list()
    }

    /// Aggregates lifecycle, indicator, and credential status for one
    /// integration.
    pub async fn integration_status(
        &self,
        integration_id: &str,
    ) -> IntegrationResult<IntegrationStatusReport> {
        let id = normalize_integration_id(integration_id)?;
        let status = self.registry.status(&id)?;
        let enabled = self.registry.is_enabled(&id)?;
        let credential_status = self.vault.status(&id).await?;
        Ok(IntegrationStatusReport {
            id,
            enabled,
            state: status.state,
            indicator: status.indicator,
            credential_status,
            last_error: status.last_error,
        })
    }

    /// Enables an integration: config flag on, lifecycle driven to active.
    pub async fn enable_integration(&self, integration_id: &str) -> IntegrationResult<()> {
        self.ensure_started()?;
        let id = normalize_integration_id(integration_id)?;
        self.lifecycle.enable(&id).await?;
        self.registry.enable(&id)
    }

    /// Disables an integration: lifecycle torn down, config flag off.
    pub async fn disable_integration(&self, integration_id: &str) -> IntegrationResult<()> {
        self.ensure_started()?;
        let id = normalize_integration_id(integration_id)?;
        self.lifecycle.disable(&id).await?;
        self.registry.disable(&id)
    }

    /// Executes one integration operation through the meta-tool pipeline.
    ///
    /// Refuses with distinct errors when the service is not started, the
    /// integration is unknown, disabled, or not active.
    pub async fn execute_operation(
        &self,
        integration_id: &str,
        operation: &str,
        arguments: serde_json::Value,
    ) -> IntegrationResult<DualChannelResult> {
        self.ensure_started()?;
        let id = normalize_integration_id(integration_id)?;
        if self.registry.get(&id).is_none() {
            return Err(IntegrationError::validation(format!(
                "integration '{id}' is not registered"
            )));
        }
        if !self.registry.is_enabled(&id)? {
            return Err(IntegrationError::validation(format!(
                "integration '{id}' is disabled"
            )));
        }
        match self.state_machine.state(&id) {
            Some(IntegrationState::Active) => {}
            Some(state) => {
                return Err(IntegrationError::state_transition(format!(
                    "integration '{id}' is '{}', not active",
                    state.as_str()
                )))
            }
            None => {
                return Err(IntegrationError::validation(format!(
                    "integration '{id}' is not tracked by the state machine"
                )))
            }
        }

        let context = self
            .context_factory
            .as_ref()
            .map(|factory| factory())
            .unwrap_or_default();
        let call = json!({
            "action": "execute",
            "integration_id": id,
            "operation": operation,
            "args": arguments,
        });
        let result = self.meta_tool.execute(call, &context).await;
        if result.is_error {
            let message = result
                .content
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| result.as_text());
            let kind = result
                .content
                .get("kind")
                .and_then(serde_json::Value::as_str)
                .and_then(parse_error_kind)
                .unwrap_or(IntegrationErrorKind::Operation);
            return Err(IntegrationError::new(kind, message));
        }
        let payload = result
            .content
            .get("result")
            .cloned()
            .ok_or_else(|| {
                IntegrationError::operation("meta-tool execute response is missing 'result'")
            })?;
        serde_json::from_value(payload).map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Operation,
                "meta-tool execute response is not a dual-channel result",
                error.into(),
            )
        })
    }

    /// Handle to the refresh manager for scheduling token refreshes.
    pub fn refresh_manager(&self) -> &Arc<RefreshManager> {
        &self.refresh
    }

    /// Handle to the credential vault.
    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    /// Handle to the lifecycle manager.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    fn ensure_started(&self) -> IntegrationResult<()> {
        if !self.is_started() {
            return Err(IntegrationError::validation(
                "integration service is not started",
            ));
        }
        Ok(())
    }
}

fn parse_error_kind(raw: &str) -> Option<IntegrationErrorKind> {
    match raw {
        "connection" => Some(IntegrationErrorKind::Connection),
        "auth" => Some(IntegrationErrorKind::Auth),
        "operation" => Some(IntegrationErrorKind::Operation),
        "validation" => Some(IntegrationErrorKind::Validation),
        "state_transition" => Some(IntegrationErrorKind::StateTransition),
        _ => None,
    }
}
