//! Dual-channel operation results.
//!
//! Every integration operation yields one value with two projections: a
//! compact `for_model` payload that keeps the LLM context small, and a rich
//! `for_user` payload for UI rendering. Both projections are pure functions
//! supplied by the integration author.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use reins_core::{IntegrationError, INTEGRATION_ERROR_CODE};

/// Tagged result value with the three operation shapes.
///
/// The channel fields serialize as `forModel`/`forUser`, the names hosts
/// read off the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum DualChannelResult {
    List {
        count: usize,
        summary: String,
        #[serde(rename = "forModel")]
        for_model: Value,
        #[serde(rename = "forUser")]
        for_user: Value,
    },
    Detail {
        #[serde(rename = "forModel")]
        for_model: Value,
        #[serde(rename = "forUser")]
        for_user: Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl DualChannelResult {
    /// Creates a list result with its item count and one-line summary.
    pub fn list(
        count: usize,
        summary: impl Into<String>,
        for_model: Value,
        for_user: Value,
    ) -> Self {
        Self::List {
            count,
            summary: summary.into(),
            for_model,
            for_user,
        }
    }

    /// Creates a single-item detail result.
    pub fn detail(for_model: Value, for_user: Value) -> Self {
        Self::Detail { for_model, for_user }
    }

    /// Creates an error result.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Projects a domain error into the error shape.
    pub fn from_integration_error(error: &IntegrationError) -> Self {
        Self::Error {
            code: INTEGRATION_ERROR_CODE.to_string(),
            message: error.message().to_string(),
        }
    }

    /// Returns true for the error shape.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns the model-facing projection of this result.
    pub fn for_model(&self) -> Value {
        match self {
            Self::List {
                count,
                summary,
                for_model,
                ..
            } => json!({
                "shape": "list",
                "count": count,
                "summary": summary,
                "items": for_model,
            }),
            Self::Detail { for_model, .. } => json!({
                "shape": "detail",
                "item": for_model,
            }),
            Self::Error { code, message } => json!({
                "shape": "error",
                "code": code,
                "message": message,
            }),
        }
    }
}
