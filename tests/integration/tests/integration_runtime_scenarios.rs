//! End-to-end scenarios across the integration runtime: enable/execute/
//! disable, OAuth refresh outcomes, meta-tool routing, daemon shutdown
//! ordering, and the encrypted-at-rest guarantee.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{json, Value};

use reins_core::{IntegrationError, IntegrationResult};
use reins_credentials::{
    Credential, CredentialVault, EncryptedCredentialVault, InMemoryCredentialVault,
    RefreshContext, RefreshManager, RefreshOptions, RefreshedTokens, StatusUpdater,
    TokenRefresher, STATUS_INDICATOR_AUTH_EXPIRED,
};
use reins_crypto::KeyEncryption;
use reins_daemon::{
    DaemonEventSink, DaemonRuntime, DaemonRuntimeOptions, ManagedIntegrationService,
    ManagedService, TracingEventSink,
};
use reins_integration::{
    DualChannelResult, Integration, IntegrationAuthKind, IntegrationManifest,
    IntegrationMetaTool, IntegrationRuntimeStatus, IntegrationState, OperationDescriptor,
};
use reins_service::{IntegrationService, IntegrationServiceConfig};
use reins_store::{CredentialStore, FileCredentialStore, FileCredentialStoreOptions};
use reins_tools::{fits_token_budget, ToolRegistry};

struct MockIntegration {
    manifest: IntegrationManifest,
    calls: Mutex<Vec<(String, Value)>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockIntegration {
    fn new(id: &str, operation_names: &[&str]) -> Arc<Self> {
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
        Arc::new(Self {
            manifest: IntegrationManifest {
                id: id.to_string(),
                name: id.to_string(),
                description: "mock integration".to_string(),
                version: "0.1.0".to_string(),
                author: "reins".to_string(),
                category: "test".to_string(),
                auth: IntegrationAuthKind::OAuth,
                permissions: Vec::new(),
                platforms: Vec::new(),
                operations,
            },
            calls: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        })
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

fn build_service(
    integrations: Vec<Arc<dyn Integration>>,
) -> (Arc<IntegrationService>, Arc<ToolRegistry>) {
    let tool_registry = ToolRegistry::shared();
    let mut config = IntegrationServiceConfig::new(tool_registry.clone());
    config.integrations = integrations;
    let service = IntegrationService::new(config).expect("service builds");
    (service, tool_registry)
}

fn rfc3339_in(duration: ChronoDuration) -> String {
    (Utc::now() + duration).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn oauth_expiring_in(duration: ChronoDuration) -> Credential {
    Credential::OAuth {
        access_token: "original-access".to_string(),
        refresh_token: "original-refresh".to_string(),
        expires_at: rfc3339_in(duration),
        scopes: vec!["mail.read".to_string()],
        token_type: "Bearer".to_string(),
    }
}

struct RecordingStatusUpdater {
    calls: Mutex<Vec<(String, String, String)>>,
}

impl RecordingStatusUpdater {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Vec<(String, String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl StatusUpdater for RecordingStatusUpdater {
    async fn update_status(&self, integration_id: &str, indicator: &str, message: &str) {
        self.calls.lock().expect("calls lock").push((
            integration_id.to_string(),
            indicator.to_string(),
            message.to_string(),
        ));
    }
}

struct ScriptedRefresher {
    outcomes: Mutex<Vec<IntegrationResult<RefreshedTokens>>>,
    calls: AtomicUsize,
}

impl ScriptedRefresher {
    fn new(outcomes: Vec<IntegrationResult<RefreshedTokens>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn refresh(&self, _context: &RefreshContext) -> IntegrationResult<RefreshedTokens> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().expect("outcomes lock");
        if outcomes.is_empty() {
            return Err(IntegrationError::operation("scripted outcomes exhausted"));
        }
        outcomes.remove(0)
    }
}

// Scenario: enable -> execute -> disable.
#[tokio::test]
async fn enable_execute_disable_walks_the_full_lifecycle() {
    let mock = MockIntegration::new("mock", &["search", "read"]);
    let (service, tool_registry) = build_service(vec![mock.clone()]);
    service.start().await.expect("start");

    service.enable_integration("mock").await.expect("enable");
    assert!(tool_registry.contains("mock.search"));
    assert!(tool_registry.contains("mock.read"));
    let report = service.integration_status("mock").await.expect("status");
    assert_eq!(report.state, IntegrationState::Active);

    let result = service
        .execute_operation("mock", "search", json!({"query": "x"}))
        .await
        .expect("execute");
    assert!(matches!(result, DualChannelResult::List { count: 1, .. }));
    assert_eq!(
        mock.recorded_calls(),
        vec![("search".to_string(), json!({"query": "x"}))]
    );

    service
        .vault()
        .store("mock", oauth_expiring_in(ChronoDuration::hours(1)))
        .await
        .expect("store credential");
    service.disable_integration("mock").await.expect("disable");
    assert!(!tool_registry.contains("mock.search"));
    assert!(!tool_registry.contains("mock.read"));
    assert_eq!(
        service
            .integration_status("mock")
            .await
            .expect("status")
            .state,
        IntegrationState::Disconnected
    );
    assert!(!service
        .vault()
        .has_credentials("mock")
        .await
        .expect("vault query"));
}

// Scenario: OAuth refresh happy path.
#[tokio::test]
async fn oauth_refresh_happy_path_merges_and_rearms() {
    let vault = InMemoryCredentialVault::shared();
    vault
        .store("gmail", oauth_expiring_in(ChronoDuration::hours(1)))
        .await
        .expect("store");
    let updater = RecordingStatusUpdater::new();
    let manager = RefreshManager::new(vault.clone(), updater.clone(), RefreshOptions::default());
    let refreshed_expiry = rfc3339_in(ChronoDuration::hours(2));
    let refresher = ScriptedRefresher::new(vec![Ok(RefreshedTokens {
        access_token: "new".to_string(),
        expires_at: Some(refreshed_expiry),
        ..RefreshedTokens::default()
    })]);

    let delay = manager
        .schedule_refresh("gmail", refresher.clone())
        .await
        .expect("schedule");
    // One hour of TTL arms the timer at ~80%: 48 minutes.
    assert!((2_870_000..=2_880_000).contains(&delay), "delay {delay}");

    // Fire the refresh the timer would have run.
    let refreshed = manager
        .refresh_now("gmail", refresher.clone())
        .await
        .expect("refresh");
    match &refreshed {
        Credential::OAuth {
            access_token,
            refresh_token,
            ..
        } => {
            assert_eq!(access_token, "new");
            assert_eq!(refresh_token, "original-refresh");
        }
        other => panic!("expected oauth credential, got {other:?}"),
    }
    let stored = vault
        .retrieve("gmail")
        .await
        .expect("retrieve")
        .expect("present");
    assert_eq!(stored, refreshed);
    assert!(updater.snapshot().is_empty());

    // The next timer is armed at ~80% of the two-hour TTL.
    assert!(manager.has_scheduled("gmail"));
    let rearmed = manager
        .schedule_refresh("gmail", refresher)
        .await
        .expect("reschedule");
    assert!((5_750_000..=5_760_000).contains(&rearmed), "delay {rearmed}");
    manager.cancel_all();
}

// Scenario: OAuth refresh permanent failure.
#[tokio::test]
async fn oauth_refresh_permanent_failure_escalates_auth_expired() {
    let vault = InMemoryCredentialVault::shared();
    vault
        .store("gmail", oauth_expiring_in(ChronoDuration::hours(1)))
        .await
        .expect("store");
    let updater = RecordingStatusUpdater::new();
    let manager = RefreshManager::new(
        vault,
        updater.clone(),
        RefreshOptions {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..RefreshOptions::default()
        },
    );
    let refresher = ScriptedRefresher::new(vec![Err(IntegrationError::auth(
        "Invalid grant: token revoked",
    ))]);

    let error = manager
        .refresh_now("gmail", refresher.clone())
        .await
        .expect_err("refresh must fail");
    // Non-transient: exactly one callback invocation despite max_attempts=3.
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(error.message(), "Invalid grant: token revoked");
    assert_eq!(
        updater.snapshot(),
        vec![(
            "gmail".to_string(),
            STATUS_INDICATOR_AUTH_EXPIRED.to_string(),
            "Invalid grant: token revoked".to_string(),
        )]
    );
    assert!(!manager.has_scheduled("gmail"));
}

// Scenario: meta-tool discover / activate / execute.
#[tokio::test]
async fn meta_tool_covers_discovery_activation_and_execution() {
    let obsidian = MockIntegration::new("obsidian", &["search-notes", "read-note"]);
    let gmail = MockIntegration::new("gmail", &["list-emails", "send-email"]);
    let (service, tool_registry) =
        build_service(vec![obsidian.clone(), gmail.clone()]);
    service.start().await.expect("start");
    service
        .enable_integration("obsidian")
        .await
        .expect("enable obsidian");
    service
        .enable_integration("gmail")
        .await
        .expect("enable gmail");

    let meta = tool_registry
        .get(reins_integration::META_TOOL_NAME)
        .expect("meta tool mounted");
    let context = reins_tools::ToolCallContext::default();

    let discover = meta.execute(json!({"action": "discover"}), &context).await;
    assert!(!discover.is_error);
    let index: Vec<String> = discover.content["capabilityIndex"]
        .as_array()
        .expect("index array")
        .iter()
        .filter_map(|entry| entry.as_str().map(str::to_string))
        .collect();
    assert!(index.contains(&"obsidian:search-notes,read-note".to_string()));
    assert!(index.contains(&"gmail:list-emails,send-email".to_string()));

    let activate = meta
        .execute(
            json!({"action": "activate", "integration_id": "obsidian"}),
            &context,
        )
        .await;
    assert!(!activate.is_error);
    let operations = activate.content["operations"]
        .as_array()
        .expect("operations array");
    assert_eq!(operations.len(), 2);
    assert!(operations
        .iter()
        .all(|operation| operation["parameters"].is_object()));

    let execute = meta
        .execute(
            json!({
                "action": "execute",
                "integration_id": "obsidian",
                "operation": "search-notes",
                "args": {"query": "test"},
            }),
            &context,
        )
        .await;
    assert!(!execute.is_error, "unexpected error: {}", execute.as_text());
    assert_eq!(
        obsidian.recorded_calls(),
        vec![("search-notes".to_string(), json!({"query": "test"}))]
    );
    assert!(gmail.recorded_calls().is_empty());
}

// Capability-index budget at scale.
#[tokio::test]
async fn discover_stays_under_budget_with_a_dozen_active_integrations() {
    let integrations: Vec<Arc<dyn Integration>> = (0..12)
        .map(|index| {
            MockIntegration::new(&format!("integration-{index:02}"), &["search", "read"])
                as Arc<dyn Integration>
        })
        .collect();
    let (service, tool_registry) = build_service(integrations);
    service.start().await.expect("start");
    for index in 0..12 {
        service
            .enable_integration(&format!("integration-{index:02}"))
            .await
            .expect("enable");
    }

    let meta = tool_registry
        .get(reins_integration::META_TOOL_NAME)
        .expect("meta tool mounted");
    let discover = meta
        .execute(
            json!({"action": "discover"}),
            &reins_tools::ToolCallContext::default(),
        )
        .await;
    assert!(!discover.is_error);
    assert_eq!(
        discover.content["capabilityIndex"]
            .as_array()
            .expect("index")
            .len(),
        12
    );
    let serialized = discover.content.to_string();
    assert!(
        fits_token_budget(&serialized, reins_integration::DISCOVER_TOKEN_BUDGET),
        "discover response blew the budget at {} chars",
        serialized.len()
    );
}

// Scenario: daemon runtime shutdown ordering.
#[tokio::test]
async fn daemon_stops_services_in_reverse_order_with_the_signal() {
    struct OrderedService {
        id: String,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ManagedService for OrderedService {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self) -> anyhow::Result<()> {
            self.journal
                .lock()
                .expect("journal lock")
                .push(format!("{}:start", self.id));
            Ok(())
        }

        async fn stop(&self, signal: Option<&str>) -> anyhow::Result<()> {
            self.journal
                .lock()
                .expect("journal lock")
                .push(format!("{}:stop:{}", self.id, signal.unwrap_or("none")));
            Ok(())
        }
    }

    let journal = Arc::new(Mutex::new(Vec::new()));
    let runtime = DaemonRuntime::new(
        DaemonRuntimeOptions::default(),
        Arc::new(TracingEventSink) as Arc<dyn DaemonEventSink>,
    );
    for id in ["a", "b", "c"] {
        runtime
            .register_service(Arc::new(OrderedService {
                id: id.to_string(),
                journal: journal.clone(),
            }))
            .expect("register");
    }

    runtime.start().await.expect("start");
    runtime.stop(Some("SIGTERM")).await.expect("stop");

    let entries = journal.lock().expect("journal lock").clone();
    assert_eq!(
        entries,
        vec![
            "a:start",
            "b:start",
            "c:start",
            "c:stop:SIGTERM",
            "b:stop:SIGTERM",
            "a:stop:SIGTERM",
        ]
    );
}

// The runtime's stop cascades through the integration service.
#[tokio::test]
async fn daemon_stop_cascades_into_integration_teardown() {
    let mock = MockIntegration::new("mock", &["search"]);
    let (service, tool_registry) = build_service(vec![mock.clone()]);
    let runtime = DaemonRuntime::default();
    runtime
        .register_service(ManagedIntegrationService::new(service.clone()))
        .expect("register");

    runtime.start().await.expect("start");
    service.enable_integration("mock").await.expect("enable");
    assert!(tool_registry.contains("mock.search"));

    runtime.stop(Some("SIGTERM")).await.expect("stop");
    assert!(!service.is_started());
    assert!(!tool_registry.contains("mock.search"));
    assert!(!tool_registry.contains(reins_integration::META_TOOL_NAME));
    assert_eq!(mock.disconnects.load(Ordering::SeqCst), 1);
}

// Scenario: encrypted-at-rest proof.
#[tokio::test]
async fn stored_credentials_never_reach_disk_in_plaintext() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileCredentialStore::new(
        dir.path().join("credentials.json"),
        FileCredentialStoreOptions::default(),
    ));
    let vault = EncryptedCredentialVault::new(
        store.clone(),
        Arc::new(KeyEncryption::new("vault-master-secret")),
    );

    vault
        .store(
            "gmail",
            Credential::OAuth {
                access_token: "super-secret-123".to_string(),
                refresh_token: "refresh-secret-456".to_string(),
                expires_at: rfc3339_in(ChronoDuration::hours(1)),
                scopes: vec!["mail.read".to_string()],
                token_type: "Bearer".to_string(),
            },
        )
        .await
        .expect("store");

    let raw = std::fs::read_to_string(dir.path().join("credentials.json")).expect("read raw");
    assert!(!raw.contains("super-secret-123"));
    assert!(!raw.contains("refresh-secret-456"));
    assert!(raw.contains("\"ciphertext\""));
    assert!(raw.contains("\"iv\""));
    assert!(raw.contains("\"v\": 1"));

    // The record round-trips through both envelopes.
    let record = store
        .get("integration:gmail:oauth")
        .await
        .expect("get")
        .expect("record present");
    assert_eq!(record.metadata.get("credential_type").map(String::as_str), Some("oauth"));
    let retrieved = vault
        .retrieve("gmail")
        .await
        .expect("retrieve")
        .expect("credential present");
    match retrieved {
        Credential::OAuth { access_token, .. } => assert_eq!(access_token, "super-secret-123"),
        other => panic!("expected oauth credential, got {other:?}"),
    }
}

// The meta-tool can be probed directly for its budget without a service.
#[tokio::test]
async fn bare_meta_tool_reports_an_empty_index() {
    let registry = reins_integration::IntegrationRegistry::shared();
    let machine = reins_integration::IntegrationStateMachine::shared();
    let meta = IntegrationMetaTool::new(registry, machine);
    let response = meta.discover_response();
    assert_eq!(response["capabilityIndex"], json!([]));
}
