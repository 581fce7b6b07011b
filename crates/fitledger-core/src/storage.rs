use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::EconomyError;
use crate::session::{validate_user_id, SessionSnapshot};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session store database error: {0}")]
    Database(String),
    #[error(transparent)]
    Economy(#[from] EconomyError),
}

/// Session persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep sessions in process memory only.
    #[default]
    Memory,
    /// One JSON document per user under `dir`.
    File { dir: PathBuf },
    /// Session documents and a transaction journal in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::File { dir: dir.into() }
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Durable home of session snapshots.
///
/// `save` must be atomic per snapshot: a reader sees either the previous or
/// the new state, never a mix.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn label(&self) -> &'static str;

    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, StorageError>;

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError>;
}

pub async fn connect(config: StorageConfig) -> Result<Arc<dyn SessionStore>, StorageError> {
    let store: Arc<dyn SessionStore> = match config {
        StorageConfig::Memory => Arc::new(MemorySessionStore::default()),
        StorageConfig::File { dir } => Arc::new(FileSessionStore::new(dir)?),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresSessionStore::connect(&database_url, max_connections).await?;
            store.ensure_schema().await?;
            Arc::new(store)
        }
    };
    Ok(store)
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, StorageError> {
        Ok(self.sessions.lock().await.get(user_id).cloned())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        self.sessions
            .lock()
            .await
            .insert(snapshot.user_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// File-backed store: `<dir>/<user_id>.json`, replaced via write-then-rename.
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, user_id: &str) -> Result<PathBuf, StorageError> {
        validate_user_id(user_id)?;
        Ok(self.dir.join(format!("{user_id}.json")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn label(&self) -> &'static str {
        "file"
    }

    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, StorageError> {
        let path = self.path_for(user_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        let path = self.path_for(&snapshot.user_id)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(tmp_path, &path).await?;
        Ok(())
    }
}

/// PostgreSQL store.
///
/// The session document is the source of truth on load. Transactions are
/// additionally journaled row by row, keyed by transaction id, so a retried
/// save never inserts a transaction twice.
#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Database(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fitledger_sessions (
                user_id TEXT PRIMARY KEY,
                balance_minor BIGINT NOT NULL,
                experience_points BIGINT NOT NULL,
                snapshot JSONB NOT NULL,
                saved_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fitledger_transactions (
                transaction_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                ledger_index BIGINT NOT NULL,
                kind TEXT NOT NULL,
                amount_minor BIGINT NOT NULL,
                description TEXT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                entry_hash TEXT NOT NULL,
                UNIQUE (user_id, ledger_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(format!("postgres schema create failed: {e}")))?;

        Ok(())
    }
}

fn to_bigint(value: u64, field: &str) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Database(format!("{field} exceeds postgres BIGINT range")))
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self, user_id: &str) -> Result<Option<SessionSnapshot>, StorageError> {
        let row = sqlx::query("SELECT snapshot FROM fitledger_sessions WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("postgres load failed: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: serde_json::Value = row
            .try_get("snapshot")
            .map_err(|e| StorageError::Database(format!("postgres decode snapshot failed: {e}")))?;
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        let document = serde_json::to_value(snapshot)?;
        let balance_minor = to_bigint(snapshot.ledger.balance.minor(), "balance")?;
        let experience_points = to_bigint(snapshot.ledger.experience_points, "experience")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Database(format!("postgres begin failed: {e}")))?;

        let journaled: i64 = sqlx::query(
            "SELECT COUNT(*) AS journaled FROM fitledger_transactions WHERE user_id = $1",
        )
        .bind(&snapshot.user_id)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("journaled"))
        .map_err(|e| StorageError::Database(format!("postgres journal count failed: {e}")))?;

        let skip = usize::try_from(journaled).unwrap_or(0);
        for transaction in snapshot.ledger.transactions.iter().skip(skip) {
            sqlx::query(
                r#"
                INSERT INTO fitledger_transactions (
                    transaction_id,
                    user_id,
                    ledger_index,
                    kind,
                    amount_minor,
                    description,
                    entry_timestamp,
                    entry_hash
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (transaction_id) DO NOTHING
                "#,
            )
            .bind(transaction.id.to_string())
            .bind(&snapshot.user_id)
            .bind(to_bigint(transaction.index, "ledger index")?)
            .bind(transaction.kind.as_str())
            .bind(transaction.amount_minor)
            .bind(&transaction.description)
            .bind(transaction.timestamp)
            .bind(&transaction.entry_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Database(format!("postgres journal insert failed: {e}")))?;
        }

        sqlx::query(
            r#"
            INSERT INTO fitledger_sessions
                (user_id, balance_minor, experience_points, snapshot, saved_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                balance_minor = EXCLUDED.balance_minor,
                experience_points = EXCLUDED.experience_points,
                snapshot = EXCLUDED.snapshot,
                saved_at = EXCLUDED.saved_at
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(balance_minor)
        .bind(experience_points)
        .bind(&document)
        .bind(snapshot.saved_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Database(format!("postgres session upsert failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Database(format!("postgres commit failed: {e}")))?;
        Ok(())
    }
}
