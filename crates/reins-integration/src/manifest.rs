//! Integration manifests, configuration, and runtime status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use reins_core::IntegrationResult;
use reins_credentials::normalize_integration_id;

use crate::state::IntegrationState;

/// One callable operation declared by an integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted arguments object.
    pub parameters: Value,
}

/// Authentication scheme an integration needs before connecting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationAuthKind {
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
    LocalPath,
    None,
}

/// Static description of an installed integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationManifest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub category: String,
    pub auth: IntegrationAuthKind,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    pub operations: Vec<OperationDescriptor>,
}

impl IntegrationManifest {
    /// Returns the canonical identity: trimmed + lowercased id.
    pub fn normalized_id(&self) -> IntegrationResult<String> {
        normalize_integration_id(&self.id)
    }
}

/// Mutable per-integration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationConfig {
    pub id: String,
    pub enabled: bool,
}

/// Enumerates the connection-health indicators reported for integrations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusIndicator {
    Connected,
    Disconnected,
    AuthExpired,
    Error,
    Unknown,
}

impl StatusIndicator {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthExpired => "auth_expired",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a wire token back into an indicator.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            "auth_expired" => Some(Self::AuthExpired),
            "error" => Some(Self::Error),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Point-in-time runtime health of one integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationRuntimeStatus {
    pub indicator: StatusIndicator,
    pub state: IntegrationState,
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl IntegrationRuntimeStatus {
    /// Initial status for a freshly installed integration.
    pub fn installed(now_unix_ms: u64) -> Self {
        Self {
            indicator: StatusIndicator::Unknown,
            state: IntegrationState::Installed,
            updated_unix_ms: now_unix_ms,
            last_error: None,
        }
    }
}
