//! Record schema and the async store contract.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version written into every stored payload.
pub const STORE_ENVELOPE_VERSION: u32 = 1;

/// Builds the deterministic record id for `(provider, account_id, record_type)`.
///
/// Integration credentials land under `integration:<id>:<credential_type>`.
pub fn record_id(provider: &str, account_id: &str, record_type: &str) -> String {
    format!("{provider}:{account_id}:{record_type}")
}

/// Store-level AEAD envelope around a serialized payload.
///
/// The `salt` feeds the per-record store key derivation; `iv` and
/// `ciphertext` are base64. Inner envelopes applied by callers (for example
/// the credential vault's own crypto) ride inside `ciphertext` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub v: u32,
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
}

/// Sync metadata bumped on every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordSyncState {
    pub version: u64,
    pub checksum: String,
    pub updated_unix_ms: u64,
}

/// One versioned encrypted record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredentialRecord {
    pub id: String,
    pub provider: String,
    pub account_id: String,
    pub record_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub encrypted_payload: EncryptedEnvelope,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub revoked_unix_ms: Option<u64>,
    pub sync: RecordSyncState,
}

impl StoredCredentialRecord {
    /// Returns true once the record has been terminally revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_unix_ms.is_some()
    }
}

/// Async contract for the encrypted record store.
///
/// `put` upserts: at most one live record exists per
/// `(provider, account_id, record_type)`, and a write over a revoked id
/// resurrects it as a fresh version. Revoked records are never returned by
/// `get` or `find`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Serializes `payload` through the store envelope and upserts the record.
    async fn put(
        &self,
        provider: &str,
        account_id: &str,
        record_type: &str,
        metadata: BTreeMap<String, String>,
        payload: Value,
    ) -> Result<StoredCredentialRecord>;

    /// Looks up a record by id; revoked records resolve to `None`.
    async fn get(&self, id: &str) -> Result<Option<StoredCredentialRecord>>;

    /// Returns every live record for `(provider, account_id)`.
    async fn find(&self, provider: &str, account_id: &str) -> Result<Vec<StoredCredentialRecord>>;

    /// Marks the record terminal. Returns true when a live record existed.
    async fn revoke(&self, id: &str) -> Result<bool>;

    /// Recovers the original payload object from a record's envelope.
    async fn decrypt_payload(&self, record: &StoredCredentialRecord) -> Result<Value>;
}
