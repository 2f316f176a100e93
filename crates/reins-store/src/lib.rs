//! Durable, query-addressable storage of versioned encrypted records.
//!
//! Records are keyed by a deterministic id derived from
//! `(provider, account_id, record_type)`, carry sync metadata (version,
//! checksum over the encrypted payload, update timestamp), and support
//! terminal revocation. Payloads pass through the store's own AES-GCM
//! envelope, independent of any inner envelope the caller applies.

pub mod file;
pub mod records;

pub use file::{FileCredentialStore, FileCredentialStoreOptions};
pub use records::{
    record_id, CredentialStore, EncryptedEnvelope, RecordSyncState, StoredCredentialRecord,
    STORE_ENVELOPE_VERSION,
};
