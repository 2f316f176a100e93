//! Tests for lifecycle side effects and meta-tool routing.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use reins_core::{IntegrationErrorKind, IntegrationResult};
use reins_credentials::{Credential, CredentialVault, InMemoryCredentialVault};
use reins_tools::{fits_token_budget, Tool, ToolCallContext, ToolRegistry};

use super::{
    DualChannelResult, Integration, IntegrationAuthKind, IntegrationManifest,
    IntegrationMetaTool, IntegrationRegistry, IntegrationRuntimeStatus, IntegrationState,
    IntegrationStateMachine, LifecycleManager, OperationDescriptor, DISCOVER_TOKEN_BUDGET,
};

struct MockIntegration {
    manifest: IntegrationManifest,
    connect_error: Option<String>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockIntegration {
    fn base(id: &str, operation_names: &[&str]) -> Self {
        let operations = operation_names
            .iter()
            .map(|name| OperationDescriptor {
                name: name.to_string(),
                description: format!("mock operation {name}"),
                parameters: json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                }),
            })
            .collect();
        Self {
            manifest: IntegrationManifest {
                id: id.to_string(),
                name: id.to_string(),
                description: "mock integration".to_string(),
                version: "0.1.0".to_string(),
                author: "reins".to_string(),
                category: "test".to_string(),
                auth: IntegrationAuthKind::ApiKey,
                permissions: Vec::new(),
                platforms: Vec::new(),
                operations,
            },
            connect_error: None,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn new(id: &str, operation_names: &[&str]) -> Arc<Self> {
        Arc::new(Self::base(id, operation_names))
    }

    fn failing_connect(id: &str, message: &str) -> Arc<Self> {
        let mut integration = Self::base(id, &["noop"]);
        integration.connect_error = Some(message.to_string());
        Arc::new(integration)
    }

    fn recorded_calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl Integration for MockIntegration {
    fn manifest(&self) -> &IntegrationManifest {
        &self.manifest
    }

    async fn connect(&self) -> IntegrationResult<()> {
        if let Some(message) = &self.connect_error {
            return Err(reins_core::IntegrationError::connection(message.clone()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> IntegrationResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> IntegrationRuntimeStatus {
        IntegrationRuntimeStatus::installed(0)
    }

    async fn execute(
        &self,
        operation: &str,
        arguments: Value,
    ) -> IntegrationResult<DualChannelResult> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((operation.to_string(), arguments.clone()));
        Ok(DualChannelResult::list(
            1,
            format!("{operation} matched 1 item"),
            json!([{"id": "item-1"}]),
            json!([{"id": "item-1", "body": "full payload"}]),
        ))
    }
}

struct Fixture {
    registry: Arc<IntegrationRegistry>,
    state_machine: Arc<IntegrationStateMachine>,
    tool_registry: Arc<ToolRegistry>,
    vault: Arc<InMemoryCredentialVault>,
    lifecycle: Arc<LifecycleManager>,
}

fn fixture() -> Fixture {
    let registry = IntegrationRegistry::shared();
    let state_machine = IntegrationStateMachine::shared();
    let tool_registry = ToolRegistry::shared();
    let vault = InMemoryCredentialVault::shared();
    let lifecycle = LifecycleManager::new(
        registry.clone(),
        state_machine.clone(),
        tool_registry.clone(),
        vault.clone(),
    );
    Fixture {
        registry,
        state_machine,
        tool_registry,
        vault,
        lifecycle,
    }
}

fn install(fixture: &Fixture, integration: Arc<MockIntegration>) -> String {
    let id = fixture
        .registry
        .register(integration)
        .expect("register integration");
    fixture.state_machine.track(&id);
    id
}

async fn enable(fixture: &Fixture, id: &str) {
    fixture.registry.enable(id).expect("flip config flag");
    fixture.lifecycle.enable(id).await.expect("lifecycle enable");
}

#[tokio::test]
async fn enable_walks_to_active_and_registers_operation_tools() {
    let fixture = fixture();
    let mock = MockIntegration::new("mock", &["search", "read"]);
    install(&fixture, mock.clone());

    enable(&fixture, "mock").await;

    assert_eq!(
        fixture.lifecycle.state("mock"),
        Some(IntegrationState::Active)
    );
    assert_eq!(mock.connects.load(Ordering::SeqCst), 1);
    assert!(fixture.tool_registry.contains("mock.search"));
    assert!(fixture.tool_registry.contains("mock.read"));
}

#[tokio::test]
async fn failed_connect_leaves_state_before_connected() {
    let fixture = fixture();
    install(
        &fixture,
        MockIntegration::failing_connect("broken", "service unreachable"),
    );
    fixture.registry.enable("broken").expect("flip flag");

    let error = fixture
        .lifecycle
        .enable("broken")
        .await
        .expect_err("connect failure must propagate");
    assert_eq!(error.kind(), IntegrationErrorKind::Connection);
    assert_eq!(
        fixture.lifecycle.state("broken"),
        Some(IntegrationState::Configured)
    );
    assert!(!fixture.tool_registry.contains("broken.noop"));
}

#[tokio::test]
async fn disable_withdraws_tools_and_revokes_credentials() {
    let fixture = fixture();
    let mock = MockIntegration::new("mock", &["search", "read"]);
    install(&fixture, mock.clone());
    enable(&fixture, "mock").await;
    fixture
        .vault
        .store(
            "mock",
            Credential::ApiKey {
                key: "sk-123".to_string(),
                label: "primary".to_string(),
            },
        )
        .await
        .expect("store credential");

    fixture
        .lifecycle
        .disable("mock")
        .await
        .expect("lifecycle disable");

    assert_eq!(
        fixture.lifecycle.state("mock"),
        Some(IntegrationState::Disconnected)
    );
    assert_eq!(mock.disconnects.load(Ordering::SeqCst), 1);
    assert!(!fixture.tool_registry.contains("mock.search"));
    assert!(!fixture.tool_registry.contains("mock.read"));
    assert!(!fixture
        .vault
        .has_credentials("mock")
        .await
        .expect("vault query"));
    // Disable is idempotent once disconnected.
    fixture
        .lifecycle
        .disable("mock")
        .await
        .expect("second disable");
}

#[tokio::test]
async fn re_enabling_after_disable_starts_over_from_installed() {
    let fixture = fixture();
    let mock = MockIntegration::new("mock", &["search"]);
    install(&fixture, mock.clone());
    enable(&fixture, "mock").await;
    fixture.lifecycle.disable("mock").await.expect("disable");

    enable(&fixture, "mock").await;
    assert_eq!(
        fixture.lifecycle.state("mock"),
        Some(IntegrationState::Active)
    );
    assert_eq!(mock.connects.load(Ordering::SeqCst), 2);
    assert!(fixture.tool_registry.contains("mock.search"));
}

#[tokio::test]
async fn suspend_parks_the_integration_and_withdraws_tools() {
    let fixture = fixture();
    let mock = MockIntegration::new("mock", &["search"]);
    install(&fixture, mock.clone());
    enable(&fixture, "mock").await;

    fixture.lifecycle.suspend("mock").await.expect("suspend");
    assert_eq!(
        fixture.lifecycle.state("mock"),
        Some(IntegrationState::Suspended)
    );
    assert!(!fixture.tool_registry.contains("mock.search"));
    // No teardown happened.
    assert_eq!(mock.disconnects.load(Ordering::SeqCst), 0);

    // Suspending anything but an active integration is rejected.
    let error = fixture
        .lifecycle
        .suspend("mock")
        .await
        .expect_err("suspended integrations cannot suspend again");
    assert_eq!(error.kind(), IntegrationErrorKind::StateTransition);

    // Re-enabling resumes without reconnecting.
    fixture.lifecycle.enable("mock").await.expect("resume");
    assert_eq!(
        fixture.lifecycle.state("mock"),
        Some(IntegrationState::Active)
    );
    assert_eq!(mock.connects.load(Ordering::SeqCst), 1);
    assert!(fixture.tool_registry.contains("mock.search"));
}

#[tokio::test]
async fn discover_lists_active_integrations_with_all_operations() {
    let fixture = fixture();
    install(
        &fixture,
        MockIntegration::new("obsidian", &["search-notes", "read-note"]),
    );
    install(
        &fixture,
        MockIntegration::new("gmail", &["list-emails", "send-email"]),
    );
    enable(&fixture, "obsidian").await;
    enable(&fixture, "gmail").await;

    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );
    let index = meta.capability_index();
    assert_eq!(
        index,
        vec![
            "gmail:list-emails,send-email".to_string(),
            "obsidian:search-notes,read-note".to_string(),
        ]
    );
}

#[tokio::test]
async fn discover_reflects_enable_then_disable() {
    let fixture = fixture();
    install(&fixture, MockIntegration::new("mock", &["search"]));
    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );

    assert!(meta.capability_index().is_empty());
    enable(&fixture, "mock").await;
    assert_eq!(meta.capability_index().len(), 1);

    fixture.lifecycle.disable("mock").await.expect("disable");
    fixture.registry.disable("mock").expect("flip flag");
    assert!(meta.capability_index().is_empty());
}

#[tokio::test]
async fn discover_response_fits_the_token_budget_at_scale() {
    let fixture = fixture();
    for index in 0..12 {
        let id = format!("integration-{index:02}");
        install(&fixture, MockIntegration::new(&id, &["search", "read"]));
        enable(&fixture, &id).await;
    }
    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );
    let response = meta.discover_response();
    assert_eq!(
        response["capabilityIndex"]
            .as_array()
            .expect("index array")
            .len(),
        12
    );
    let serialized = serde_json::to_string(&response).expect("serialize");
    assert!(
        fits_token_budget(&serialized, DISCOVER_TOKEN_BUDGET),
        "discover response exceeded {DISCOVER_TOKEN_BUDGET} tokens: {} chars",
        serialized.len()
    );
}

#[tokio::test]
async fn activate_returns_full_operation_schemas() {
    let fixture = fixture();
    install(
        &fixture,
        MockIntegration::new("obsidian", &["search-notes", "read-note"]),
    );
    enable(&fixture, "obsidian").await;
    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );

    let result = meta
        .execute(
            json!({"action": "activate", "integration_id": "obsidian"}),
            &ToolCallContext::default(),
        )
        .await;
    assert!(!result.is_error);
    let operations = result.content["operations"]
        .as_array()
        .expect("operations array");
    assert_eq!(operations.len(), 2);
    assert_eq!(operations[0]["name"], "search-notes");
    assert!(operations[0]["parameters"]["properties"]["query"].is_object());
}

#[tokio::test]
async fn execute_routes_to_the_integration_exactly_once() {
    let fixture = fixture();
    let obsidian = MockIntegration::new("obsidian", &["search-notes", "read-note"]);
    install(&fixture, obsidian.clone());
    enable(&fixture, "obsidian").await;
    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );

    let result = meta
        .execute(
            json!({
                "action": "execute",
                "integration_id": "obsidian",
                "operation": "search-notes",
                "args": {"query": "test"},
            }),
            &ToolCallContext::default(),
        )
        .await;
    assert!(!result.is_error, "unexpected error: {}", result.as_text());
    assert_eq!(result.content["integrationId"], "obsidian");
    assert_eq!(result.content["operation"], "search-notes");
    assert_eq!(result.content["result"]["shape"], "list");
    assert_eq!(
        obsidian.recorded_calls(),
        vec![("search-notes".to_string(), json!({"query": "test"}))]
    );
}

#[tokio::test]
async fn execute_rejects_unknown_actions_operations_and_bad_args() {
    let fixture = fixture();
    install(&fixture, MockIntegration::new("mock", &["search"]));
    enable(&fixture, "mock").await;
    let meta = IntegrationMetaTool::new(
        fixture.registry.clone(),
        fixture.state_machine.clone(),
    );
    let context = ToolCallContext::default();

    let unknown_action = meta.execute(json!({"action": "explode"}), &context).await;
    assert!(unknown_action.is_error);
    assert!(unknown_action.as_text().contains("unknown meta-tool action"));

    let unknown_operation = meta
        .execute(
            json!({"action": "execute", "integration_id": "mock", "operation": "ghost"}),
            &context,
        )
        .await;
    assert!(unknown_operation.is_error);
    assert!(unknown_operation.as_text().contains("no operation 'ghost'"));

    let bad_args = meta
        .execute(
            json!({
                "action": "execute",
                "integration_id": "mock",
                "operation": "search",
                "args": {"query": 42},
            }),
            &context,
        )
        .await;
    assert!(bad_args.is_error);
    assert!(bad_args.as_text().contains("invalid arguments"));
}

#[tokio::test]
async fn operation_tools_execute_directly() {
    let fixture = fixture();
    let mock = MockIntegration::new("mock", &["search"]);
    install(&fixture, mock.clone());
    enable(&fixture, "mock").await;

    let tool = fixture
        .tool_registry
        .get("mock.search")
        .expect("operation tool registered");
    let result = tool
        .execute(json!({"query": "direct"}), &ToolCallContext::default())
        .await;
    assert!(!result.is_error);
    assert_eq!(result.content["shape"], "list");
    assert_eq!(
        mock.recorded_calls(),
        vec![("search".to_string(), json!({"query": "direct"}))]
    );
}
