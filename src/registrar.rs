//! C6: the registration pipeline — Validate → Dedupe-and-persist → Prove
//! (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use p256::ecdsa::VerifyingKey;
use rand::Rng;

use crate::checkpoint::CheckpointSigner;
use crate::cose::{self, ReceiptPayload};
use crate::errors::LogError;
use crate::hash::{leaf_hash, sha256};
use crate::metrics::ApiMetrics;
use crate::proof;
use crate::storage::meta_sqlite::SqliteMetaStore;
use crate::storage::{EntryRow, ServiceKeyRow};
use crate::tilelog::TileLog;

/// Resolves a statement's `kid` header to the issuer's verifying key (spec
/// §4.6 step 1, "Resolve issuer public key (policy callback; default:
/// accept)"). Swappable for an allowlist or revocation-aware policy without
/// touching [`Registrar`].
#[async_trait]
pub trait IssuerKeyResolver: Send + Sync {
    async fn resolve(&self, kid: &[u8]) -> Result<VerifyingKey, LogError>;
}

/// Default resolver: any `kid` with an `active` row in `service_keys` is
/// trusted (spec §6.2). This is the "accept-all" default the spec names —
/// accept-all means no additional allowlist is layered on top of key
/// registration, not that signatures go unchecked.
pub struct ServiceKeyStoreResolver {
    meta: Arc<SqliteMetaStore>,
}

impl ServiceKeyStoreResolver {
    pub fn new(meta: Arc<SqliteMetaStore>) -> Self {
        Self { meta }
    }
}

#[async_trait]
impl IssuerKeyResolver for ServiceKeyStoreResolver {
    async fn resolve(&self, kid: &[u8]) -> Result<VerifyingKey, LogError> {
        let row: ServiceKeyRow = self
            .meta
            .lookup_service_key(kid)
            .await?
            .ok_or(LogError::InvalidSignature)?;
        if row.status != "active" {
            return Err(LogError::InvalidSignature);
        }
        VerifyingKey::from_sec1_bytes(&row.cose_key).map_err(|_| LogError::InvalidSignature)
    }
}

/// Outcome of [`Registrar::register`] (spec §4.6).
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    Accepted {
        position: u64,
        receipt_bytes: Option<Vec<u8>>,
    },
    Duplicate {
        position: u64,
        receipt_bytes: Option<Vec<u8>>,
    },
    Rejected(LogError),
}

/// Tuning knobs from spec §6.3 that bound the registration pipeline itself
/// (as opposed to ambient config like bind addresses).
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub max_statement_bytes: usize,
    pub retry_budget: u32,
    pub retry_base_backoff: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            max_statement_bytes: 1024 * 1024,
            retry_budget: 3,
            retry_base_backoff: Duration::from_millis(5),
        }
    }
}

pub struct Registrar {
    meta: Arc<SqliteMetaStore>,
    tile_log: Arc<TileLog>,
    checkpoint_signer: Arc<CheckpointSigner>,
    key_resolver: Arc<dyn IssuerKeyResolver>,
    config: RegistrarConfig,
    /// Serializes the dedupe-and-persist critical section in-process. Pure
    /// efficiency measure: correctness comes from `MetaStore`'s serializable
    /// transaction, not this lock (spec §5).
    append_mutex: tokio::sync::Mutex<()>,
}

impl Registrar {
    pub fn new(
        meta: Arc<SqliteMetaStore>,
        tile_log: Arc<TileLog>,
        checkpoint_signer: Arc<CheckpointSigner>,
        key_resolver: Arc<dyn IssuerKeyResolver>,
        config: RegistrarConfig,
    ) -> Self {
        Self {
            meta,
            tile_log,
            checkpoint_signer,
            key_resolver,
            config,
            append_mutex: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn register(&self, statement_bytes: Vec<u8>, now: u64) -> RegistrationOutcome {
        let metadata = match self.validate(&statement_bytes).await {
            Ok(metadata) => metadata,
            Err(e) => return RegistrationOutcome::Rejected(e),
        };

        let statement_hash = sha256(&statement_bytes);

        match self
            .dedupe_and_persist(statement_hash, &statement_bytes, &metadata, now)
            .await
        {
            Ok(DedupeOutcome::Inserted { position }) => {
                let receipt = self.prove(position, now).await;
                RegistrationOutcome::Accepted {
                    position,
                    receipt_bytes: receipt.ok(),
                }
            }
            Ok(DedupeOutcome::AlreadyExists { position }) => {
                let receipt = self.prove(position, now).await;
                RegistrationOutcome::Duplicate {
                    position,
                    receipt_bytes: receipt.ok(),
                }
            }
            Err(e) => RegistrationOutcome::Rejected(e),
        }
    }

    /// Step 1: Validate (spec §4.6 step 1).
    async fn validate(&self, statement_bytes: &[u8]) -> Result<cose::DecodedStatement, LogError> {
        if statement_bytes.len() > self.config.max_statement_bytes {
            return Err(LogError::OutOfRange(format!(
                "statement of {} bytes exceeds maximum of {} bytes",
                statement_bytes.len(),
                self.config.max_statement_bytes
            )));
        }
        let (sign1, decoded) = cose::decode_statement(statement_bytes)?;
        let kid = decoded
            .kid
            .clone()
            .ok_or_else(|| LogError::InvalidCose("missing kid header".into()))?;
        let verifying_key = self.key_resolver.resolve(&kid).await?;
        cose::verify_statement(&sign1, &verifying_key)?;
        Ok(decoded)
    }

    /// Step 2: Dedupe-and-persist, atomic under one `MetaStore` transaction
    /// with bounded retry on serialization conflict (spec §4.6 step 2, §5).
    async fn dedupe_and_persist(
        &self,
        statement_hash: [u8; 32],
        statement_bytes: &[u8],
        metadata: &cose::DecodedStatement,
        now: u64,
    ) -> Result<DedupeOutcome, LogError> {
        let mut attempt = 0;
        loop {
            let _permit = self.append_mutex.lock().await;
            match self
                .try_dedupe_and_persist_once(statement_hash, statement_bytes, metadata, now)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(LogError::DuplicateStatement) => {
                    drop(_permit);
                    let mut tx = self.meta.begin().await?;
                    let existing = tx
                        .lookup_by_statement_hash(&statement_hash)
                        .await?
                        .ok_or_else(|| LogError::Storage("duplicate statement_hash vanished on re-lookup".into()))?;
                    tx.commit().await?;
                    return Ok(DedupeOutcome::AlreadyExists {
                        position: existing.position,
                    });
                }
                Err(LogError::Transient(reason)) => {
                    attempt += 1;
                    ApiMetrics::increment_append_conflict_retries();
                    if attempt >= self.config.retry_budget {
                        return Err(LogError::Transient(format!(
                            "retry budget exhausted after {attempt} attempts: {reason}"
                        )));
                    }
                    let backoff = self.config.retry_base_backoff * 2u32.pow(attempt - 1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..5));
                    drop(_permit);
                    tokio::time::sleep(backoff + jitter).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_dedupe_and_persist_once(
        &self,
        statement_hash: [u8; 32],
        statement_bytes: &[u8],
        metadata: &cose::DecodedStatement,
        now: u64,
    ) -> Result<DedupeOutcome, LogError> {
        let mut tx = self.meta.begin().await?;

        if let Some(existing) = tx.lookup_by_statement_hash(&statement_hash).await? {
            tx.commit().await?;
            return Ok(DedupeOutcome::AlreadyExists {
                position: existing.position,
            });
        }

        let size = tx.tree_size().await?;
        let leaf = leaf_hash(&statement_hash);

        // Tiles are written before the tree_size increment commits (spec
        // §4.6): if the process dies after this append but before `commit`,
        // the orphaned tiles are tolerated and ignored by readers bounded
        // by the pre-crash tree_size.
        self.tile_log.append(size, &statement_hash).await?;

        let row = EntryRow {
            position: size,
            statement_bytes: statement_bytes.to_vec(),
            leaf_hash: leaf,
            issuer_id: metadata.kid.as_ref().map(hex::encode),
            subject_id: metadata.subject_id.clone(),
            content_type: metadata.content_type.clone(),
            registered_at: now as i64,
            statement_hash,
        };
        tx.insert_entry(&row).await?;
        tx.set_tree_size(size + 1).await?;
        tx.commit().await?;

        Ok(DedupeOutcome::Inserted { position: size })
    }

    /// Step 3: Prove (spec §4.6 step 3). A failure here is not fatal to the
    /// write; the caller gets `Accepted`/`Duplicate` with no receipt, and a
    /// later GET against the same position reconstructs it deterministically.
    async fn prove(&self, position: u64, now: u64) -> Result<Vec<u8>, LogError> {
        let size = position + 1;
        let inclusion_path = proof::inclusion_proof(self.tile_log.as_ref(), position, size).await?;
        let root = self.tile_log.root_at(size).await?;

        if self.meta.get_checkpoint(size).await?.is_none() {
            let checkpoint_bytes = self.checkpoint_signer.make_checkpoint(size, root, now)?;
            self.meta
                .insert_checkpoint(&crate::storage::CheckpointRow {
                    tree_size: size,
                    root_hash: root,
                    cose_sign1_bytes: checkpoint_bytes,
                    created_at: now as i64,
                })
                .await?;
            ApiMetrics::set_checkpoint_tree_size(size);
        }

        let receipt_payload = ReceiptPayload {
            leaf_index: position,
            inclusion_path,
        };
        self.checkpoint_signer.sign_receipt(size, &receipt_payload)
    }
}

enum DedupeOutcome {
    Inserted { position: u64 },
    AlreadyExists { position: u64 },
}
