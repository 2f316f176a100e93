//! In-memory vault for tests and ephemeral deployments.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use reins_core::{IntegrationError, IntegrationResult};

use crate::types::{Credential, CredentialType, CREDENTIAL_TYPE_PRIORITY};
use crate::vault::{normalize_integration_id, CredentialVault};

/// Mirror of the vault contract over a process-local map.
///
/// Retrieval hands out owned clones so callers can never mutate stored
/// state through a returned credential.
#[derive(Default)]
pub struct InMemoryCredentialVault {
    entries: Mutex<HashMap<(String, CredentialType), Credential>>,
}

impl InMemoryCredentialVault {
    /// Creates an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty vault behind a shared handle.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(
        &self,
    ) -> IntegrationResult<std::sync::MutexGuard<'_, HashMap<(String, CredentialType), Credential>>>
    {
        self.entries
            .lock()
            .map_err(|_| IntegrationError::operation("credential vault lock poisoned"))
    }
}

#[async_trait]
impl CredentialVault for InMemoryCredentialVault {
    async fn store(&self, integration_id: &str, credential: Credential) -> IntegrationResult<()> {
        let id = normalize_integration_id(integration_id)?;
        let credential_type = credential.credential_type();
        self.lock()?.insert((id, credential_type), credential);
        Ok(())
    }

    async fn retrieve_of_type(
        &self,
        integration_id: &str,
        credential_type: CredentialType,
    ) -> IntegrationResult<Option<Credential>> {
        let id = normalize_integration_id(integration_id)?;
        Ok(self.lock()?.get(&(id, credential_type)).cloned())
    }

    async fn revoke(&self, integration_id: &str) -> IntegrationResult<bool> {
        let id = normalize_integration_id(integration_id)?;
        let mut entries = self.lock()?;
        let mut any = false;
        for credential_type in CREDENTIAL_TYPE_PRIORITY {
            any |= entries.remove(&(id.clone(), credential_type)).is_some();
        }
        Ok(any)
    }

    async fn has_credentials(&self, integration_id: &str) -> IntegrationResult<bool> {
        let id = normalize_integration_id(integration_id)?;
        let entries = self.lock()?;
        Ok(CREDENTIAL_TYPE_PRIORITY
            .iter()
            .any(|credential_type| entries.contains_key(&(id.clone(), *credential_type))))
    }
}
