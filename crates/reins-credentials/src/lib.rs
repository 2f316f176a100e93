//! Per-integration credential custody and OAuth token refresh.
//!
//! Defines the credential sum type and derived status classification, the
//! vault contract with encrypted and in-memory variants, and the refresh
//! manager that keeps OAuth tokens fresh with bounded retry and terminal
//! failure escalation.

pub mod memory;
pub mod refresh;
pub mod types;
pub mod vault;

pub use memory::InMemoryCredentialVault;
pub use refresh::{
    compute_refresh_delay_ms, RefreshContext, RefreshManager, RefreshOptions, RefreshedTokens,
    StatusUpdater, TokenRefresher, DEFAULT_TRANSIENT_ERROR_MARKERS, MAX_TIMER_DELAY_MS,
    STATUS_INDICATOR_AUTH_EXPIRED,
};
pub use types::{
    classify_credential, Credential, CredentialStatus, CredentialType, CREDENTIAL_TYPE_PRIORITY,
};
pub use vault::{
    normalize_integration_id, CredentialVault, EncryptedCredentialVault, VAULT_PROVIDER,
};
