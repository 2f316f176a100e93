//! The integration meta-tool and per-operation tools.
//!
//! The meta-tool is the only integration-facing entry in the LLM's base
//! schema. `discover` answers with an entity-compact capability index whose
//! size stays flat as integrations are installed; `activate` expands one
//! integration's operation schemas on demand; `execute` validates arguments
//! against the declared schema and routes to the integration.

use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::{json, Value};

use reins_core::{IntegrationError, IntegrationResult, INTEGRATION_ERROR_CODE};
use reins_tools::{Tool, ToolCallContext, ToolDefinition, ToolExecutionResult};

use crate::contract::Integration;
use crate::manifest::OperationDescriptor;
use crate::registry::IntegrationRegistry;
use crate::state::{IntegrationState, IntegrationStateMachine};

/// Registry name of the meta-tool.
pub const META_TOOL_NAME: &str = "integrations";

/// Token ceiling for a `discover` response, by the conservative estimator.
pub const DISCOVER_TOKEN_BUDGET: usize = 200;

const META_ACTION_DISCOVER: &str = "discover";
const META_ACTION_ACTIVATE: &str = "activate";
const META_ACTION_EXECUTE: &str = "execute";

/// Builds one capability index entry: `"<id>:<op1>,<op2>,…"`.
pub fn capability_index_entry(integration_id: &str, operations: &[OperationDescriptor]) -> String {
    let names: Vec<&str> = operations
        .iter()
        .map(|descriptor| descriptor.name.as_str())
        .collect();
    format!("{integration_id}:{}", names.join(","))
}

/// The single tool multiplexing every integration operation.
pub struct IntegrationMetaTool {
    registry: Arc<IntegrationRegistry>,
    state_machine: Arc<IntegrationStateMachine>,
}

impl IntegrationMetaTool {
    /// Builds the meta-tool over the integration catalogue.
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        state_machine: Arc<IntegrationStateMachine>,
    ) -> Self {
        Self {
            registry,
            state_machine,
        }
    }

    /// Capability index entries for every active integration, id-sorted.
    pub fn capability_index(&self) -> Vec<String> {
        let mut entries = Vec::new();
        for id in self.registry.ids() {
            if self.state_machine.state(&id) != Some(IntegrationState::Active) {
                continue;
            }
            if !self.registry.is_enabled(&id).unwrap_or(false) {
                continue;
            }
            let Some(integration) = self.registry.get(&id) else {
                continue;
            };
            entries.push(capability_index_entry(&id, &integration.operations()));
        }
        entries
    }

    /// The full `discover` response value, exposed so the token budget can
    /// be probed directly.
    pub fn discover_response(&self) -> Value {
        json!({
            "action": META_ACTION_DISCOVER,
            "capabilityIndex": self.capability_index(),
        })
    }

    async fn run(&self, arguments: &Value) -> IntegrationResult<Value> {
        let action = arguments
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::validation("meta-tool call is missing 'action'"))?;
        match action {
            META_ACTION_DISCOVER => Ok(self.discover_response()),
            META_ACTION_ACTIVATE => self.activate(arguments),
            META_ACTION_EXECUTE => self.execute_operation(arguments).await,
            other => Err(IntegrationError::validation(format!(
                "unknown meta-tool action '{other}'; expected discover, activate, or execute"
            ))),
        }
    }

    fn activate(&self, arguments: &Value) -> IntegrationResult<Value> {
        let id = required_str(arguments, "integration_id")?;
        let integration = self.active_integration(id)?;
        let operations: Vec<Value> = integration
            .operations()
            .iter()
            .map(|descriptor| {
                json!({
                    "name": descriptor.name,
                    "description": descriptor.description,
                    "parameters": descriptor.parameters,
                })
            })
            .collect();
        Ok(json!({
            "action": META_ACTION_ACTIVATE,
            "integrationId": integration.manifest().normalized_id()?,
            "operations": operations,
        }))
    }

    async fn execute_operation(&self, arguments: &Value) -> IntegrationResult<Value> {
        let id = required_str(arguments, "integration_id")?;
        let operation = required_str(arguments, "operation")?;
        let args = arguments.get("args").cloned().unwrap_or_else(|| json!({}));

        let integration = self.active_integration(id)?;
        let descriptor = integration
            .operations()
            .into_iter()
            .find(|candidate| candidate.name == operation)
            .ok_or_else(|| {
                IntegrationError::validation(format!(
                    "integration '{id}' has no operation '{operation}'"
                ))
            })?;
        validate_operation_arguments(&descriptor, &args)
            .map_err(IntegrationError::validation)?;

        let started = std::time::Instant::now();
        let result = integration.execute(&descriptor.name, args).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(value) => tracing::debug!(
                integration_id = %id,
                operation = %descriptor.name,
                elapsed_ms,
                is_error = value.is_error(),
                "integration operation executed"
            ),
            Err(error) => tracing::warn!(
                integration_id = %id,
                operation = %descriptor.name,
                elapsed_ms,
                error = %error,
                "integration operation failed"
            ),
        }
        let result = result?;

        Ok(json!({
            "action": META_ACTION_EXECUTE,
            "integrationId": id,
            "operation": descriptor.name,
            "result": result,
        }))
    }

    fn active_integration(&self, id: &str) -> IntegrationResult<Arc<dyn Integration>> {
        let integration = self.registry.get(id).ok_or_else(|| {
            IntegrationError::validation(format!("integration '{id}' is not registered"))
        })?;
        if !self.registry.is_enabled(id)? {
            return Err(IntegrationError::validation(format!(
                "integration '{id}' is disabled"
            )));
        }
        match self.state_machine.state(id) {
            Some(IntegrationState::Active) => Ok(integration),
            Some(state) => Err(IntegrationError::state_transition(format!(
                "integration '{id}' is '{}', not active",
                state.as_str()
            ))),
            None => Err(IntegrationError::validation(format!(
                "integration '{id}' is not tracked by the state machine"
            ))),
        }
    }
}

#[async_trait]
impl Tool for IntegrationMetaTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: META_TOOL_NAME.to_string(),
            description: "Work with installed integrations. Use action 'discover' to list \
                          active integrations and their operation names, 'activate' to fetch \
                          one integration's full operation schemas, and 'execute' to run an \
                          operation."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [META_ACTION_DISCOVER, META_ACTION_ACTIVATE, META_ACTION_EXECUTE],
                        "description": "What to do.",
                    },
                    "integration_id": {
                        "type": "string",
                        "description": "Target integration (activate/execute).",
                    },
                    "operation": {
                        "type": "string",
                        "description": "Operation name (execute).",
                    },
                    "args": {
                        "type": "object",
                        "description": "Operation arguments (execute).",
                    },
                },
                "required": ["action"],
                "additionalProperties": false,
            }),
        }
    }

    async fn execute(&self, arguments: Value, _context: &ToolCallContext) -> ToolExecutionResult {
        match self.run(&arguments).await {
            Ok(response) => ToolExecutionResult::ok(response),
            Err(error) => ToolExecutionResult::error(json!({
                "code": INTEGRATION_ERROR_CODE,
                "kind": error.kind().as_str(),
                "message": error.message(),
            })),
        }
    }
}

/// Direct-invocation tool for one integration operation, registered as
/// `"<integration_id>.<operation>"` while the integration is active.
pub struct OperationTool {
    integration_id: String,
    integration: Arc<dyn Integration>,
    descriptor: OperationDescriptor,
}

impl OperationTool {
    /// Binds `descriptor` of `integration` under the dotted tool name.
    pub fn new(
        integration_id: impl Into<String>,
        integration: Arc<dyn Integration>,
        descriptor: OperationDescriptor,
    ) -> Self {
        Self {
            integration_id: integration_id.into(),
            integration,
            descriptor,
        }
    }
}

#[async_trait]
impl Tool for OperationTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: format!("{}.{}", self.integration_id, self.descriptor.name),
            description: self.descriptor.description.clone(),
            parameters: self.descriptor.parameters.clone(),
        }
    }

    async fn execute(&self, arguments: Value, _context: &ToolCallContext) -> ToolExecutionResult {
        if let Err(message) = validate_operation_arguments(&self.descriptor, &arguments) {
            return ToolExecutionResult::error(json!({
                "code": INTEGRATION_ERROR_CODE,
                "kind": "validation",
                "message": message,
            }));
        }
        match self
            .integration
            .execute(&self.descriptor.name, arguments)
            .await
        {
            Ok(result) => match serde_json::to_value(&result) {
                Ok(value) => ToolExecutionResult::ok(value),
                Err(error) => ToolExecutionResult::error(json!({
                    "code": INTEGRATION_ERROR_CODE,
                    "kind": "operation",
                    "message": format!("failed to serialize operation result: {error}"),
                })),
            },
            Err(error) => ToolExecutionResult::error(json!({
                "code": INTEGRATION_ERROR_CODE,
                "kind": error.kind().as_str(),
                "message": error.message(),
            })),
        }
    }
}

fn required_str<'a>(arguments: &'a Value, field: &str) -> IntegrationResult<&'a str> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            IntegrationError::validation(format!("meta-tool call is missing '{field}'"))
        })
}

fn validate_operation_arguments(
    descriptor: &OperationDescriptor,
    arguments: &Value,
) -> Result<(), String> {
    let validator = validator_for(&descriptor.parameters)
        .map_err(|error| format!("invalid JSON schema for '{}': {error}", descriptor.name))?;

    let mut errors = validator.iter_errors(arguments);
    if let Some(first) = errors.next() {
        return Err(format!(
            "invalid arguments for '{}': {}",
            descriptor.name, first
        ));
    }

    Ok(())
}
