//! Vault contract and the encrypted store-backed variant.
//!
//! The encrypted vault wraps each JSON-serialized credential in its own
//! `{v, ciphertext, iv}` envelope before handing it to the record store,
//! which applies a second, independent envelope. The two layers evolve
//! separately: the store never learns the vault's master secret.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use reins_core::{IntegrationError, IntegrationErrorKind, IntegrationResult};
use reins_crypto::KeyEncryption;
use reins_store::{record_id, CredentialStore};

use crate::types::{
    classify_credential, Credential, CredentialStatus, CredentialType, CREDENTIAL_TYPE_PRIORITY,
};

/// Store provider under which every vault record is filed.
pub const VAULT_PROVIDER: &str = "integration";

const VAULT_ENVELOPE_VERSION: u32 = 1;
const METADATA_INTEGRATION_ID: &str = "integration_id";
const METADATA_CREDENTIAL_TYPE: &str = "credential_type";

#[derive(Debug, Serialize, Deserialize)]
struct VaultEnvelope {
    v: u32,
    ciphertext: String,
    iv: String,
}

/// Normalizes an integration id: trim + lowercase, empty is a validation
/// error. Uniform across every vault operation.
pub fn normalize_integration_id(raw: &str) -> IntegrationResult<String> {
    let id = raw.trim().to_lowercase();
    if id.is_empty() {
        return Err(IntegrationError::validation(
            "integration id must not be empty",
        ));
    }
    Ok(id)
}

/// Per-integration credential custody.
///
/// `retrieve` walks [`CREDENTIAL_TYPE_PRIORITY`] and returns the first
/// match; `revoke` removes every type and reports whether anything was
/// deleted. Returned credentials are owned copies; mutating them never
/// affects stored state.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Stores `credential` under the integration, replacing any prior value
    /// of the same type.
    async fn store(&self, integration_id: &str, credential: Credential) -> IntegrationResult<()>;

    /// Returns the highest-priority credential for the integration.
    async fn retrieve(&self, integration_id: &str) -> IntegrationResult<Option<Credential>> {
        for credential_type in CREDENTIAL_TYPE_PRIORITY {
            if let Some(credential) = self
                .retrieve_of_type(integration_id, credential_type)
                .await?
            {
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }

    /// Returns the credential of exactly `credential_type`, if present.
    async fn retrieve_of_type(
        &self,
        integration_id: &str,
        credential_type: CredentialType,
    ) -> IntegrationResult<Option<Credential>>;

    /// Deletes every credential type for the integration. True iff at least
    /// one was deleted.
    async fn revoke(&self, integration_id: &str) -> IntegrationResult<bool>;

    /// Returns true when any credential type exists for the integration.
    async fn has_credentials(&self, integration_id: &str) -> IntegrationResult<bool>;

    /// Retrieves then classifies the integration's credential material.
    async fn status(&self, integration_id: &str) -> IntegrationResult<CredentialStatus> {
        let credential = self.retrieve(integration_id).await?;
        Ok(classify_credential(credential.as_ref(), Utc::now()))
    }
}

/// Vault composing the encrypted record store with [`KeyEncryption`].
pub struct EncryptedCredentialVault {
    store: Arc<dyn CredentialStore>,
    crypto: Arc<KeyEncryption>,
}

impl EncryptedCredentialVault {
    /// Builds a vault over `store`, sealing payloads with `crypto`.
    pub fn new(store: Arc<dyn CredentialStore>, crypto: Arc<KeyEncryption>) -> Self {
        Self { store, crypto }
    }
}

#[async_trait]
impl CredentialVault for EncryptedCredentialVault {
    async fn store(&self, integration_id: &str, credential: Credential) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let credential_type = credential.credential_type();
        let serialized = serde_json::to_vec(&credential).map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Operation,
                "failed to serialize credential",
                error.into(),
            )
        })?;
        let sealed = self.crypto.encrypt(&serialized).map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Auth,
                "credential encryption failed",
                error.into(),
            )
        })?;
        let envelope = serde_json::to_value(VaultEnvelope {
            v: VAULT_ENVELOPE_VERSION,
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
        })
        .map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Operation,
                "failed to encode credential envelope",
                error.into(),
            )
        })?;

        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_INTEGRATION_ID.to_string(), id.clone());
        metadata.insert(
            METADATA_CREDENTIAL_TYPE.to_string(),
            credential_type.as_str().to_string(),
        );
        self.store
            .put(
                VAULT_PROVIDER,
                &id,
                credential_type.as_str(),
                metadata,
                envelope,
            )
            .await
            .map_err(|error| {
                IntegrationError::with_cause(
                    IntegrationErrorKind::Operation,
                    format!("failed to persist credential for '{id}'"),
                    error,
                )
            })?;
        tracing::debug!(
            integration_id = %id,
            credential_type = credential_type.as_str(),
            "stored credential"
        );
        Ok(())
    }

    async fn retrieve_of_type(
        &self,
        integration_id: &str,
        credential_type: CredentialType,
    ) -> IntegrationResult<Option<Credential>> {
        let id = normalize_integration_id(integration_id)?;
        let key = record_id(VAULT_PROVIDER, &id, credential_type.as_str());
        let Some(record) = self.store.get(&key).await.map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Operation,
                format!("failed to read credential for '{id}'"),
                error,
            )
        })?
        else {
            return Ok(None);
        };

        let payload = self.store.decrypt_payload(&record).await.map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Auth,
                format!("failed to open stored credential for '{id}'"),
                error,
            )
        })?;
        let envelope: VaultEnvelope = serde_json::from_value(payload).map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Auth,
                format!("stored credential envelope for '{id}' is malformed"),
                error.into(),
            )
        })?;
        if envelope.v != VAULT_ENVELOPE_VERSION {
            return Err(IntegrationError::auth(format!(
                "unsupported credential envelope version {} for '{id}'",
                envelope.v
            )));
        }
        let plaintext = self
            .crypto
            .decrypt(&envelope.ciphertext, &envelope.iv)
            .map_err(|error| {
                IntegrationError::with_cause(
                    IntegrationErrorKind::Auth,
                    format!("credential decryption failed for '{id}'"),
                    error.into(),
                )
            })?;
        let credential: Credential = serde_json::from_slice(&plaintext).map_err(|error| {
            IntegrationError::with_cause(
                IntegrationErrorKind::Auth,
                format!("decrypted credential for '{id}' is not valid JSON"),
                error.into(),
            )
        })?;
        Ok(Some(credential))
    }

    async fn revoke(&self, integration_id: &str) -> IntegrationResult<bool> {
        let id = normalize_integration_id(integration_id)?;
        let mut any = false;
        for credential_type in CREDENTIAL_TYPE_PRIORITY {
            let key = record_id(VAULT_PROVIDER, &id, credential_type.as_str());
            let revoked = self.store.revoke(&key).await.map_err(|error| {
                IntegrationError::with_cause(
                    IntegrationErrorKind::Operation,
                    format!("failed to revoke credential for '{id}'"),
                    error,
                )
            })?;
            any = any || revoked;
        }
        if any {
            tracing::debug!(integration_id = %id, "revoked credentials");
        }
        Ok(any)
    }

    async fn has_credentials(&self, integration_id: &str) -> IntegrationResult<bool> {
        let id = normalize_integration_id(integration_id)?;
        for credential_type in CREDENTIAL_TYPE_PRIORITY {
            let key = record_id(VAULT_PROVIDER, &id, credential_type.as_str());
            let present = self
                .store
                .get(&key)
                .await
                .map_err(|error| {
                    IntegrationError::with_cause(
                        IntegrationErrorKind::Operation,
                        format!("failed to read credential for '{id}'"),
                        error,
                    )
                })?
                .is_some();
            if present {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
