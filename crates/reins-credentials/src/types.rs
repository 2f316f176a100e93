//! Credential shapes and derived status classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retrieval preference when an integration holds more than one credential.
/// Priority is data, not code: callers walk this slice in order.
pub const CREDENTIAL_TYPE_PRIORITY: [CredentialType; 3] = [
    CredentialType::OAuth,
    CredentialType::ApiKey,
    CredentialType::LocalPath,
];

/// Enumerates the credential shapes a vault can hold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
    LocalPath,
}

impl CredentialType {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OAuth => "oauth",
            Self::ApiKey => "api_key",
            Self::LocalPath => "local_path",
        }
    }

    /// Parses a wire token back into a credential type.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "oauth" => Some(Self::OAuth),
            "api_key" => Some(Self::ApiKey),
            "local_path" => Some(Self::LocalPath),
            _ => None,
        }
    }
}

/// Tagged credential value. The tag doubles as the store record type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        refresh_token: String,
        /// ISO-8601 instant after which the access token is stale.
        expires_at: String,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default = "default_token_type")]
        token_type: String,
    },
    ApiKey {
        key: String,
        #[serde(default)]
        label: String,
    },
    LocalPath {
        path: String,
        #[serde(default)]
        validated: bool,
    },
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Returns the shape tag of this credential.
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::OAuth { .. } => CredentialType::OAuth,
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::LocalPath { .. } => CredentialType::LocalPath,
        }
    }
}

/// Derived (never stored) health of an integration's credential material.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Valid,
    Expired,
    Missing,
    Error,
}

impl CredentialStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::Missing => "missing",
            Self::Error => "error",
        }
    }
}

/// Classifies a credential against `now`.
///
/// OAuth tokens are `expired` once `expires_at` lies strictly before `now`
/// and `error` when the instant does not parse; API keys are `valid` iff the
/// key trims non-empty; local paths are `valid` iff they were validated.
pub fn classify_credential(credential: Option<&Credential>, now: DateTime<Utc>) -> CredentialStatus {
    let Some(credential) = credential else {
        return CredentialStatus::Missing;
    };
    match credential {
        Credential::OAuth { expires_at, .. } => {
            match DateTime::parse_from_rfc3339(expires_at) {
                Ok(expires) => {
                    if expires.with_timezone(&Utc) < now {
                        CredentialStatus::Expired
                    } else {
                        CredentialStatus::Valid
                    }
                }
                Err(_) => CredentialStatus::Error,
            }
        }
        Credential::ApiKey { key, .. } => {
            if key.trim().is_empty() {
                CredentialStatus::Error
            } else {
                CredentialStatus::Valid
            }
        }
        Credential::LocalPath { validated, .. } => {
            if *validated {
                CredentialStatus::Valid
            } else {
                CredentialStatus::Error
            }
        }
    }
}
