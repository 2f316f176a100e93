//! Integration domain error shared by credential custody, lifecycle, and
//! tool routing crates.
//!
//! Every public integration-runtime API reports failures through
//! [`IntegrationError`]: one wire code, five sub-kinds, and an optional
//! preserved cause for wrapped lower-layer failures.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable wire code carried by every integration-runtime failure.
pub const INTEGRATION_ERROR_CODE: &str = "INTEGRATION_ERROR";

/// Convenience alias for results produced by integration-runtime APIs.
pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Enumerates the failure sub-kinds distinguishable under the single
/// `INTEGRATION_ERROR` code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationErrorKind {
    /// Connect/disconnect side effects against the external service failed.
    Connection,
    /// Credential material is invalid, expired, or failed to decrypt.
    Auth,
    /// An integration operation failed during execution.
    Operation,
    /// Caller input was rejected before any side effect ran.
    Validation,
    /// A lifecycle transition was requested outside the allowed table.
    StateTransition,
}

impl IntegrationErrorKind {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Operation => "operation",
            Self::Validation => "validation",
            Self::StateTransition => "state_transition",
        }
    }
}

/// Domain error for every integration-runtime failure.
///
/// Cloneable so deduplicated concurrent callers (for example two refresh
/// waiters sharing one in-flight slot) can each own the same outcome.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct IntegrationError {
    message: String,
    kind: IntegrationErrorKind,
    #[source]
    cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl IntegrationError {
    /// Creates an error of the given kind with no underlying cause.
    pub fn new(kind: IntegrationErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            cause: None,
        }
    }

    /// Creates an error wrapping a lower-layer failure as its cause.
    pub fn with_cause(
        kind: IntegrationErrorKind,
        message: impl Into<String>,
        cause: anyhow::Error,
    ) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = cause.into();
        Self {
            message: message.into(),
            kind,
            cause: Some(Arc::from(boxed)),
        }
    }

    /// Shorthand for a `Connection` failure.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Connection, message)
    }

    /// Shorthand for an `Auth` failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Auth, message)
    }

    /// Shorthand for an `Operation` failure.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Operation, message)
    }

    /// Shorthand for a `Validation` failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::Validation, message)
    }

    /// Shorthand for a `StateTransition` failure.
    pub fn state_transition(message: impl Into<String>) -> Self {
        Self::new(IntegrationErrorKind::StateTransition, message)
    }

    /// Returns the stable wire code (`INTEGRATION_ERROR` for every kind).
    pub fn code(&self) -> &'static str {
        INTEGRATION_ERROR_CODE
    }

    /// Returns the failure sub-kind.
    pub fn kind(&self) -> IntegrationErrorKind {
        self.kind
    }

    /// Returns the human-readable failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the preserved underlying cause, when one was wrapped.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Returns true when either the message or the cause chain contains
    /// `needle` case-insensitively. Used by transient-failure classifiers.
    pub fn message_chain_contains(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        if self.message.to_ascii_lowercase().contains(&needle) {
            return true;
        }
        let Some(cause) = self.cause.as_deref() else {
            return false;
        };
        let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(cause);
        while let Some(error) = cursor {
            if error.to_string().to_ascii_lowercase().contains(&needle) {
                return true;
            }
            cursor = error.source();
        }
        false
    }
}
