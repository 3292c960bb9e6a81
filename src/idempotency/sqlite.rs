use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

use super::key::IdempotencyKey;
use super::record::{IdempotencyRecord, IdempotencyStatus};
use super::store::{IdempotencyStore, StoreError};
use crate::clock::UnixTimeMs;
use crate::sqlite::{from_sql_time, to_sql_time, SharedConnection};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS idempotency_records (
        key TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        result_ref TEXT,
        last_error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_idempotency_expires ON idempotency_records(expires_at);
";

/// SQLite-backed idempotency store.
///
/// Acquisition is one conditional upsert: the row is inserted, or an existing
/// row is overwritten only when its `expires_at` lies before `now`. SQLite
/// serializes writers, so at most one concurrent caller sees a changed row.
#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    conn: SharedConnection,
}

impl SqliteIdempotencyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(unavailable)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        info!("Idempotency store schema ready");
        Ok(Self {
            conn: SharedConnection::new(conn),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.run(op).await
    }

    async fn set_outcome(
        &self,
        key: &IdempotencyKey,
        status: IdempotencyStatus,
        result_ref: Option<String>,
        last_error: Option<String>,
        now: UnixTimeMs,
    ) -> Result<(), StoreError> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE idempotency_records
                     SET status = ?2,
                         result_ref = COALESCE(?3, result_ref),
                         last_error = ?4,
                         updated_at = ?5
                     WHERE key = ?1",
                    params![key, status.as_str(), result_ref, last_error, to_sql_time(now)],
                )
                .map_err(unavailable)?;
            if updated == 0 {
                return Err(StoreError::NotFound(key));
            }
            Ok(())
        })
        .await
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("blocking task failed: {e}"))
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

type RawRecord = (String, String, i64, i64, i64, Option<String>, Option<String>);

fn decode(raw: RawRecord) -> Result<IdempotencyRecord, StoreError> {
    let (key, status, created_at, updated_at, expires_at, result_ref, last_error) = raw;
    let corrupted = |reason: String| StoreError::Corrupted {
        key: key.clone(),
        reason,
    };
    let status = IdempotencyStatus::parse(&status)
        .ok_or_else(|| corrupted(format!("unknown status {status}")))?;
    let parsed_key = IdempotencyKey::new(key.as_str()).map_err(|e| corrupted(e.to_string()))?;
    Ok(IdempotencyRecord {
        key: parsed_key,
        status,
        created_at: from_sql_time(created_at),
        updated_at: from_sql_time(updated_at),
        expires_at: from_sql_time(expires_at),
        result_ref,
        last_error,
    })
}

#[async_trait::async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        let key = key.as_str().to_string();
        let raw: Option<RawRecord> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT key, status, created_at, updated_at, expires_at, result_ref, last_error
                     FROM idempotency_records WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()
                .map_err(unavailable)
            })
            .await?;
        raw.map(decode).transpose()
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn try_acquire(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
        now: UnixTimeMs,
    ) -> Result<bool, StoreError> {
        let key = key.as_str().to_string();
        let created_at = to_sql_time(now);
        let expires_at = to_sql_time(now.saturating_add(ttl));
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "INSERT INTO idempotency_records
                        (key, status, created_at, updated_at, expires_at, result_ref, last_error)
                     VALUES (?1, 'IN_PROGRESS', ?2, ?2, ?3, NULL, NULL)
                     ON CONFLICT(key) DO UPDATE SET
                        status = 'IN_PROGRESS',
                        created_at = excluded.created_at,
                        updated_at = excluded.updated_at,
                        expires_at = excluded.expires_at,
                        result_ref = NULL,
                        last_error = NULL
                     WHERE idempotency_records.expires_at < excluded.created_at
                       AND idempotency_records.status <> 'COMPLETED'",
                    params![key, created_at, expires_at],
                )
                .map_err(unavailable)?;
            Ok(changed == 1)
        })
        .await
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        result_ref: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError> {
        self.set_outcome(
            key,
            IdempotencyStatus::Completed,
            Some(result_ref.to_string()),
            None,
            now,
        )
        .await
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError> {
        self.set_outcome(
            key,
            IdempotencyStatus::Failed,
            None,
            Some(reason.to_string()),
            now,
        )
        .await
    }

    async fn purge_expired(&self, now: UnixTimeMs) -> Result<usize, StoreError> {
        let now = to_sql_time(now);
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM idempotency_records
                 WHERE expires_at < ?1 AND status <> 'IN_PROGRESS'",
                params![now],
            )
            .map_err(unavailable)
        })
        .await
    }
}
