//! File-backed credential store with a keyed AES-GCM envelope.
//!
//! The whole store is one schema-versioned JSON document written atomically.
//! Each record's payload is sealed under a per-record salt so the store key
//! never repeats across records; the key seed comes from an operator
//! passphrase or, absent one, stable machine identity inputs.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use reins_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::records::{
    record_id, CredentialStore, EncryptedEnvelope, RecordSyncState, StoredCredentialRecord,
    STORE_ENVELOPE_VERSION,
};

const STORE_FILE_SCHEMA_VERSION: u32 = 1;
const STORE_AES_GCM_NONCE_BYTES: usize = 12;
const STORE_SALT_BYTES: usize = 16;
const STORE_AES_GCM_AAD: &[u8] = b"reins-credential-store-v1";
const STORE_MACHINE_KEY_CONTEXT: &str = "reins-credential-store-machine-key-v1";
const STORE_MACHINE_ID_CANDIDATE_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialStoreFile {
    schema_version: u32,
    records: BTreeMap<String, StoredCredentialRecord>,
}

impl CredentialStoreFile {
    fn empty() -> Self {
        Self {
            schema_version: STORE_FILE_SCHEMA_VERSION,
            records: BTreeMap::new(),
        }
    }
}

/// Construction options for [`FileCredentialStore`].
#[derive(Debug, Clone, Default)]
pub struct FileCredentialStoreOptions {
    /// Operator passphrase seeding the store key. Machine-derived when absent.
    pub passphrase: Option<String>,
}

/// Single-file JSON store; writes are serialized behind one lock.
pub struct FileCredentialStore {
    path: PathBuf,
    key_seed: String,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Opens (or lazily creates) the store at `path`.
    pub fn new(path: impl Into<PathBuf>, options: FileCredentialStoreOptions) -> Self {
        let key_seed = match options
            .passphrase
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(value) => value.to_string(),
            None => machine_derived_key_seed(),
        };
        Self {
            path: path.into(),
            key_seed,
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_file(&self) -> Result<CredentialStoreFile> {
        if !self.path.exists() {
            return Ok(CredentialStoreFile::empty());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read credential store {}", self.path.display()))?;
        let parsed = serde_json::from_str::<CredentialStoreFile>(&raw)
            .with_context(|| format!("failed to parse credential store {}", self.path.display()))?;
        if parsed.schema_version != STORE_FILE_SCHEMA_VERSION {
            bail!(
                "unsupported credential store schema_version {} in {} (expected {})",
                parsed.schema_version,
                self.path.display(),
                STORE_FILE_SCHEMA_VERSION
            );
        }
        Ok(parsed)
    }

    fn save_file(&self, file: &CredentialStoreFile) -> Result<()> {
        let mut encoded =
            serde_json::to_string_pretty(file).context("failed to encode credential store")?;
        encoded.push('\n');
        write_text_atomic(&self.path, &encoded)
    }

    fn seal_payload(&self, payload: &Value) -> Result<EncryptedEnvelope> {
        let mut salt = [0u8; STORE_SALT_BYTES];
        let mut nonce = [0u8; STORE_AES_GCM_NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let cipher = self.record_cipher(&salt)?;
        let serialized =
            serde_json::to_vec(payload).context("failed to serialize credential payload")?;
        let ciphertext = cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: &serialized,
                    aad: STORE_AES_GCM_AAD,
                },
            )
            .map_err(|_| anyhow!("credential payload encryption failed"))?;

        Ok(EncryptedEnvelope {
            v: STORE_ENVELOPE_VERSION,
            salt: BASE64_STANDARD.encode(salt),
            iv: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        })
    }

    fn open_payload(&self, envelope: &EncryptedEnvelope) -> Result<Value> {
        if envelope.v != STORE_ENVELOPE_VERSION {
            bail!(
                "unsupported credential envelope version {} (expected {})",
                envelope.v,
                STORE_ENVELOPE_VERSION
            );
        }
        let salt = BASE64_STANDARD
            .decode(&envelope.salt)
            .map_err(|_| anyhow!("credential envelope salt encoding is invalid"))?;
        let nonce = BASE64_STANDARD
            .decode(&envelope.iv)
            .map_err(|_| anyhow!("credential envelope iv encoding is invalid"))?;
        if nonce.len() != STORE_AES_GCM_NONCE_BYTES {
            bail!("credential envelope iv is truncated");
        }
        let ciphertext = BASE64_STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|_| anyhow!("credential envelope ciphertext encoding is invalid"))?;

        let cipher = self.record_cipher(&salt)?;
        let plaintext = cipher
            .decrypt(
                nonce.as_slice().into(),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: STORE_AES_GCM_AAD,
                },
            )
            .map_err(|_| anyhow!("credential payload integrity check failed"))?;
        serde_json::from_slice(&plaintext).context("credential payload is not valid JSON")
    }

    fn record_cipher(&self, salt: &[u8]) -> Result<Aes256Gcm> {
        let mut hasher = Sha256::new();
        hasher.update(self.key_seed.as_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();
        Aes256Gcm::new_from_slice(&digest)
            .map_err(|_| anyhow!("credential key material has invalid length"))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn put(
        &self,
        provider: &str,
        account_id: &str,
        record_type: &str,
        metadata: BTreeMap<String, String>,
        payload: Value,
    ) -> Result<StoredCredentialRecord> {
        let id = record_id(provider, account_id, record_type);
        let envelope = self.seal_payload(&payload)?;
        let checksum = format!("{:x}", Sha256::digest(envelope.ciphertext.as_bytes()));
        let now_ms = current_unix_timestamp_ms();

        let _guard = self.write_lock.lock().await;
        let mut file = self.load_file()?;
        let (created_unix_ms, version) = match file.records.get(&id) {
            Some(existing) => (existing.created_unix_ms, existing.sync.version + 1),
            None => (now_ms, 1),
        };
        let record = StoredCredentialRecord {
            id: id.clone(),
            provider: provider.to_string(),
            account_id: account_id.to_string(),
            record_type: record_type.to_string(),
            metadata,
            encrypted_payload: envelope,
            created_unix_ms,
            updated_unix_ms: now_ms,
            revoked_unix_ms: None,
            sync: RecordSyncState {
                version,
                checksum,
                updated_unix_ms: now_ms,
            },
        };
        file.records.insert(id.clone(), record.clone());
        self.save_file(&file)?;
        tracing::debug!(
            credential_store = %self.path.display(),
            record_id = %id,
            version,
            "stored credential record"
        );
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<StoredCredentialRecord>> {
        let file = self.load_file()?;
        Ok(file
            .records
            .get(id)
            .filter(|record| !record.is_revoked())
            .cloned())
    }

    async fn find(&self, provider: &str, account_id: &str) -> Result<Vec<StoredCredentialRecord>> {
        let file = self.load_file()?;
        Ok(file
            .records
            .values()
            .filter(|record| {
                record.provider == provider
                    && record.account_id == account_id
                    && !record.is_revoked()
            })
            .cloned()
            .collect())
    }

    async fn revoke(&self, id: &str) -> Result<bool> {
        let now_ms = current_unix_timestamp_ms();
        let _guard = self.write_lock.lock().await;
        let mut file = self.load_file()?;
        let Some(record) = file.records.get_mut(id) else {
            return Ok(false);
        };
        if record.is_revoked() {
            return Ok(false);
        }
        record.revoked_unix_ms = Some(now_ms);
        record.updated_unix_ms = now_ms;
        record.sync.version += 1;
        record.sync.updated_unix_ms = now_ms;
        self.save_file(&file)?;
        tracing::debug!(
            credential_store = %self.path.display(),
            record_id = %id,
            "revoked credential record"
        );
        Ok(true)
    }

    async fn decrypt_payload(&self, record: &StoredCredentialRecord) -> Result<Value> {
        self.open_payload(&record.encrypted_payload)
    }
}

fn machine_derived_key_seed() -> String {
    let mut segments = vec![
        STORE_MACHINE_KEY_CONTEXT.to_string(),
        format!("os={}", std::env::consts::OS),
        format!("arch={}", std::env::consts::ARCH),
    ];
    for variable in [
        "HOSTNAME",
        "COMPUTERNAME",
        "USER",
        "USERNAME",
        "HOME",
        "USERPROFILE",
    ] {
        if let Ok(value) = std::env::var(variable) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                segments.push(format!("{variable}={trimmed}"));
            }
        }
    }
    if let Some(machine_id) = read_machine_id_file() {
        segments.push(format!("machine_id={machine_id}"));
    }
    segments.join("|")
}

fn read_machine_id_file() -> Option<String> {
    for path in STORE_MACHINE_ID_CANDIDATE_PATHS {
        if let Ok(raw) = std::fs::read_to_string(path) {
            let value = raw.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileCredentialStore {
        FileCredentialStore::new(
            dir.path().join("credentials.json"),
            FileCredentialStoreOptions {
                passphrase: Some("store-passphrase".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn put_get_round_trips_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let record = store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "super-secret-123"}),
            )
            .await
            .expect("put");
        assert_eq!(record.id, "integration:gmail:oauth");
        assert_eq!(record.sync.version, 1);

        let fetched = store
            .get("integration:gmail:oauth")
            .await
            .expect("get")
            .expect("record present");
        let payload = store.decrypt_payload(&fetched).await.expect("decrypt");
        assert_eq!(payload["access_token"], "super-secret-123");
    }

    #[tokio::test]
    async fn raw_file_never_contains_secret_material() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "super-secret-123"}),
            )
            .await
            .expect("put");
        let raw = std::fs::read_to_string(store.path()).expect("read raw store");
        assert!(!raw.contains("super-secret-123"));
        assert!(raw.contains("ciphertext"));
        assert!(raw.contains("\"iv\""));
    }

    #[tokio::test]
    async fn rewrites_bump_version_and_keep_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let first = store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "one"}),
            )
            .await
            .expect("put");
        let second = store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "two"}),
            )
            .await
            .expect("put again");
        assert_eq!(second.sync.version, first.sync.version + 1);
        assert_eq!(second.created_unix_ms, first.created_unix_ms);
        assert_ne!(second.sync.checksum, first.sync.checksum);
    }

    #[tokio::test]
    async fn revoked_records_disappear_from_get_and_find() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "one"}),
            )
            .await
            .expect("put");
        assert!(store
            .revoke("integration:gmail:oauth")
            .await
            .expect("revoke"));
        assert!(store
            .get("integration:gmail:oauth")
            .await
            .expect("get")
            .is_none());
        assert!(store
            .find("integration", "gmail")
            .await
            .expect("find")
            .is_empty());
        // A second revoke of the same id reports nothing left to revoke.
        assert!(!store
            .revoke("integration:gmail:oauth")
            .await
            .expect("revoke again"));
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_decrypt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        let store = FileCredentialStore::new(
            &path,
            FileCredentialStoreOptions {
                passphrase: Some("store-passphrase".to_string()),
            },
        );
        let record = store
            .put(
                "integration",
                "gmail",
                "oauth",
                BTreeMap::new(),
                json!({"access_token": "one"}),
            )
            .await
            .expect("put");

        let other = FileCredentialStore::new(
            &path,
            FileCredentialStoreOptions {
                passphrase: Some("different-passphrase".to_string()),
            },
        );
        let error = other
            .decrypt_payload(&record)
            .await
            .expect_err("wrong key must fail");
        assert!(error.to_string().contains("integrity check failed"));
    }
}
