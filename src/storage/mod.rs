//! C1 (`BlobStore`) and C2 (`MetaStore`) contracts (spec §4.1, §4.2).
//!
//! The core never assumes cross-key atomicity through `BlobStore`, and
//! relies on `MetaStore`'s serializable write transaction for the one
//! critical section that needs it (spec §5).

pub mod blob_fs;
pub mod meta_sqlite;

use async_trait::async_trait;

use crate::errors::LogError;
use crate::hash::Hash;

/// Opaque key -> bytes object store (C1). Backends: filesystem
/// ([`blob_fs::FsBlobStore`]), S3-compatible (external, not in this crate —
/// spec §1 scopes object-store backends out of the core).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write-or-overwrite. No atomic compare-and-swap is required or used.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), LogError>;

    /// Returns [`LogError::NotFound`] if the key has never been written.
    async fn get(&self, key: &str) -> Result<Vec<u8>, LogError>;

    async fn exists(&self, key: &str) -> Result<bool, LogError>;

    /// Lazily-usable key listing under `prefix`. Only used for recovery and
    /// audit tooling, never on the hot append/read paths.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, LogError>;
}

/// A persisted entry row (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRow {
    pub position: u64,
    pub statement_bytes: Vec<u8>,
    pub leaf_hash: Hash,
    pub issuer_id: Option<String>,
    pub subject_id: Option<String>,
    pub content_type: Option<String>,
    pub registered_at: i64,
    pub statement_hash: Hash,
}

/// A stored checkpoint row, keyed by the tree size it commits to.
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub tree_size: u64,
    pub root_hash: Hash,
    pub cose_sign1_bytes: Vec<u8>,
    pub created_at: i64,
}

/// Prepends a fixed prefix to every key before delegating to an inner
/// `BlobStore` (spec §6.3 `storage_prefix`, for multi-tenant single-store
/// deployments).
pub struct PrefixedBlobStore {
    inner: std::sync::Arc<dyn BlobStore>,
    prefix: String,
}

impl PrefixedBlobStore {
    pub fn new(inner: std::sync::Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn prefixed(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        }
    }
}

#[async_trait]
impl BlobStore for PrefixedBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), LogError> {
        self.inner.put(&self.prefixed(key), bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, LogError> {
        self.inner.get(&self.prefixed(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, LogError> {
        self.inner.exists(&self.prefixed(key)).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        self.inner.list_prefix(&self.prefixed(prefix)).await
    }
}

/// A registered issuer signing key (spec §6.2 `service_keys`), looked up by
/// [`crate::registrar::ServiceKeyStoreResolver`] to verify submitted
/// statements.
#[derive(Debug, Clone)]
pub struct ServiceKeyRow {
    pub kid: String,
    /// SEC1 uncompressed point encoding of the issuer's ES256 public key.
    pub cose_key: Vec<u8>,
    pub status: String,
    pub created_at: i64,
}
