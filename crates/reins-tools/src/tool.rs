//! The callable tool contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema surfaced to hosts for one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments object.
    pub parameters: Value,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    /// Creates a successful tool result.
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Creates a failed tool result.
    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool message.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Per-call context threaded into every tool execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallContext {
    pub conversation_id: Option<String>,
    pub assistant_message_id: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl ToolCallContext {
    /// Returns the stream key `<conversation_id>:<assistant_message_id>`
    /// when both halves are present.
    pub fn stream_key(&self) -> Option<String> {
        match (&self.conversation_id, &self.assistant_message_id) {
            (Some(conversation), Some(message)) => Some(format!("{conversation}:{message}")),
            _ => None,
        }
    }
}

/// A named, schema'd callable hosted by the tool registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value, context: &ToolCallContext) -> ToolExecutionResult;
}
