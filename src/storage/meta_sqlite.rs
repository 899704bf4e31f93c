//! SQLite-backed `MetaStore` (C2, spec §4.2) via `sqlx`.
//!
//! The append path needs one thing `BlobStore` cannot give it: a
//! serializable write transaction over `entries` and the `tree_size`
//! singleton (spec §5). SQLite gives us that with `BEGIN IMMEDIATE`, which
//! takes the write lock up front rather than on first write, so two
//! concurrent transactions racing to append both see the conflict at
//! `BEGIN` time instead of one silently clobbering the other's read of
//! `tree_size`.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::errors::LogError;
use crate::hash::Hash;
use crate::storage::{CheckpointRow, EntryRow, ServiceKeyRow};

#[derive(Debug, Clone)]
pub struct SqliteMetaStore {
    pool: SqlitePool,
}

impl SqliteMetaStore {
    pub async fn open(database_url: &str) -> Result<Self, LogError> {
        let options: SqliteConnectOptions = database_url
            .parse()
            .map_err(|e| LogError::Storage(format!("invalid meta store url: {e}")))?;
        let options = options.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await
            .map_err(|e| LogError::Storage(format!("opening meta store: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), LogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                position        INTEGER PRIMARY KEY,
                statement_bytes BLOB NOT NULL,
                statement_hash  BLOB NOT NULL UNIQUE,
                leaf_hash       BLOB NOT NULL,
                issuer_id       TEXT,
                subject_id      TEXT,
                content_type    TEXT,
                registered_at   INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tree_state (
                id   INTEGER PRIMARY KEY CHECK (id = 0),
                size INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("INSERT OR IGNORE INTO tree_state (id, size) VALUES (0, 0);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                tree_size       INTEGER PRIMARY KEY,
                root_hash       BLOB NOT NULL,
                cose_sign1_bytes BLOB NOT NULL,
                created_at      INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_keys (
                kid        TEXT PRIMARY KEY,
                cose_key   BLOB NOT NULL,
                status     TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Point-in-time read of `tree_size`, outside any transaction. Used by
    /// read-only endpoints that don't need serializability.
    pub async fn read_tree_size(&self) -> Result<u64, LogError> {
        let row = sqlx::query("SELECT size FROM tree_state WHERE id = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>("size").map_err(storage_err)? as u64)
    }

    pub async fn lookup_entry(&self, position: u64) -> Result<Option<EntryRow>, LogError> {
        let row = sqlx::query(
            "SELECT position, statement_bytes, statement_hash, leaf_hash, issuer_id, \
             subject_id, content_type, registered_at FROM entries WHERE position = ?",
        )
        .bind(position as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(row_to_entry).transpose()
    }

    pub async fn lookup_entry_by_statement_hash(
        &self,
        statement_hash: &Hash,
    ) -> Result<Option<EntryRow>, LogError> {
        let row = sqlx::query(
            "SELECT position, statement_bytes, statement_hash, leaf_hash, issuer_id, \
             subject_id, content_type, registered_at FROM entries WHERE statement_hash = ?",
        )
        .bind(statement_hash.as_slice())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(row_to_entry).transpose()
    }

    pub async fn get_checkpoint(&self, tree_size: u64) -> Result<Option<CheckpointRow>, LogError> {
        let row = sqlx::query(
            "SELECT tree_size, root_hash, cose_sign1_bytes, created_at FROM checkpoints \
             WHERE tree_size = ?",
        )
        .bind(tree_size as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(row_to_checkpoint).transpose()
    }

    pub async fn get_latest_checkpoint(&self) -> Result<Option<CheckpointRow>, LogError> {
        let row = sqlx::query(
            "SELECT tree_size, root_hash, cose_sign1_bytes, created_at FROM checkpoints \
             ORDER BY tree_size DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(row_to_checkpoint).transpose()
    }

    /// Idempotent: a checkpoint already stored for this size is left as-is
    /// (spec invariant: at most one checkpoint value per tree_size).
    pub async fn insert_checkpoint(&self, row: &CheckpointRow) -> Result<(), LogError> {
        sqlx::query(
            "INSERT OR IGNORE INTO checkpoints (tree_size, root_hash, cose_sign1_bytes, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(row.tree_size as i64)
        .bind(row.root_hash.as_slice())
        .bind(&row.cose_sign1_bytes)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    pub async fn lookup_service_key(&self, kid: &[u8]) -> Result<Option<ServiceKeyRow>, LogError> {
        let kid_text = String::from_utf8_lossy(kid).into_owned();
        let row = sqlx::query("SELECT kid, cose_key, status, created_at FROM service_keys WHERE kid = ?")
            .bind(&kid_text)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(row_to_service_key).transpose()
    }

    /// Register an issuer signing key. Idempotent on `kid`: re-registering
    /// the same `kid` with different bytes leaves the original row in
    /// place, since `service_keys` is not meant to be rewritten silently.
    pub async fn insert_service_key(&self, row: &ServiceKeyRow) -> Result<(), LogError> {
        sqlx::query(
            "INSERT OR IGNORE INTO service_keys (kid, cose_key, status, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&row.kid)
        .bind(&row.cose_key)
        .bind(&row.status)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    /// Begin the one serializable write transaction the append path needs.
    pub async fn begin(&self) -> Result<MetaTx, LogError> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(conflict_or_storage_err)?;
        Ok(MetaTx {
            conn: Some(conn),
            finished: false,
        })
    }
}

/// A handle to the in-flight serializable transaction. Must be finished
/// with [`MetaTx::commit`] or [`MetaTx::rollback`]; dropping it unfinished
/// rolls back on a best-effort basis via the connection pool's own cleanup.
pub struct MetaTx {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Sqlite>>,
    finished: bool,
}

impl MetaTx {
    fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        self.conn.as_mut().expect("transaction already finished")
    }

    pub async fn tree_size(&mut self) -> Result<u64, LogError> {
        let row = sqlx::query("SELECT size FROM tree_state WHERE id = 0")
            .fetch_one(self.conn())
            .await
            .map_err(storage_err)?;
        Ok(row.try_get::<i64, _>("size").map_err(storage_err)? as u64)
    }

    pub async fn lookup_by_statement_hash(
        &mut self,
        statement_hash: &Hash,
    ) -> Result<Option<EntryRow>, LogError> {
        let row = sqlx::query(
            "SELECT position, statement_bytes, statement_hash, leaf_hash, issuer_id, \
             subject_id, content_type, registered_at FROM entries WHERE statement_hash = ?",
        )
        .bind(statement_hash.as_slice())
        .fetch_optional(self.conn())
        .await
        .map_err(storage_err)?;
        row.map(row_to_entry).transpose()
    }

    pub async fn insert_entry(&mut self, row: &EntryRow) -> Result<(), LogError> {
        sqlx::query(
            "INSERT INTO entries (position, statement_bytes, statement_hash, leaf_hash, \
             issuer_id, subject_id, content_type, registered_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.position as i64)
        .bind(&row.statement_bytes)
        .bind(row.statement_hash.as_slice())
        .bind(row.leaf_hash.as_slice())
        .bind(&row.issuer_id)
        .bind(&row.subject_id)
        .bind(&row.content_type)
        .bind(row.registered_at)
        .execute(self.conn())
        .await
        .map_err(conflict_or_storage_err)?;
        Ok(())
    }

    pub async fn set_tree_size(&mut self, new_size: u64) -> Result<(), LogError> {
        sqlx::query("UPDATE tree_state SET size = ? WHERE id = 0")
            .bind(new_size as i64)
            .execute(self.conn())
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), LogError> {
        let mut conn = self.conn.take().expect("transaction already finished");
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(conflict_or_storage_err)?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), LogError> {
        let mut conn = self.conn.take().expect("transaction already finished");
        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for MetaTx {
    fn drop(&mut self) {
        if !self.finished && self.conn.is_some() {
            tracing::warn!("MetaTx dropped without commit or rollback; connection returns to pool mid-transaction");
        }
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<EntryRow, LogError> {
    let statement_hash: Vec<u8> = row.try_get("statement_hash").map_err(storage_err)?;
    let leaf_hash: Vec<u8> = row.try_get("leaf_hash").map_err(storage_err)?;
    Ok(EntryRow {
        position: row.try_get::<i64, _>("position").map_err(storage_err)? as u64,
        statement_bytes: row.try_get("statement_bytes").map_err(storage_err)?,
        leaf_hash: to_hash(&leaf_hash)?,
        issuer_id: row.try_get("issuer_id").map_err(storage_err)?,
        subject_id: row.try_get("subject_id").map_err(storage_err)?,
        content_type: row.try_get("content_type").map_err(storage_err)?,
        registered_at: row.try_get("registered_at").map_err(storage_err)?,
        statement_hash: to_hash(&statement_hash)?,
    })
}

fn row_to_checkpoint(row: sqlx::sqlite::SqliteRow) -> Result<CheckpointRow, LogError> {
    let root_hash: Vec<u8> = row.try_get("root_hash").map_err(storage_err)?;
    Ok(CheckpointRow {
        tree_size: row.try_get::<i64, _>("tree_size").map_err(storage_err)? as u64,
        root_hash: to_hash(&root_hash)?,
        cose_sign1_bytes: row.try_get("cose_sign1_bytes").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
    })
}

fn row_to_service_key(row: sqlx::sqlite::SqliteRow) -> Result<ServiceKeyRow, LogError> {
    Ok(ServiceKeyRow {
        kid: row.try_get("kid").map_err(storage_err)?,
        cose_key: row.try_get("cose_key").map_err(storage_err)?,
        status: row.try_get("status").map_err(storage_err)?,
        created_at: row.try_get("created_at").map_err(storage_err)?,
    })
}

fn to_hash(bytes: &[u8]) -> Result<Hash, LogError> {
    bytes
        .try_into()
        .map_err(|_| LogError::Integrity(format!("expected 32-byte hash, got {} bytes", bytes.len())))
}

fn storage_err(e: sqlx::Error) -> LogError {
    LogError::Storage(e.to_string())
}

/// SQLite reports both unique-constraint hits and `BEGIN IMMEDIATE` lock
/// contention as `SQLITE_BUSY`/constraint errors; the registrar treats both
/// as retryable or duplicate-shaped, so we surface them distinctly from a
/// hard storage failure.
fn conflict_or_storage_err(e: sqlx::Error) -> LogError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.is_unique_violation() {
            return LogError::DuplicateStatement;
        }
        if db_err.code().as_deref() == Some("5") {
            // SQLITE_BUSY
            return LogError::Transient("database is locked".into());
        }
    }
    LogError::Storage(e.to_string())
}
