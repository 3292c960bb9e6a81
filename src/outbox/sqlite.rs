use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::error::OutboxError;
use super::message::{ClaimLease, MessageId, MessageStatus, OutboxMessage};
use super::repository::{validate_new_message, FailedAttempt, OutboxRepository, QueueDepthSnapshot};
use crate::clock::UnixTimeMs;
use crate::sqlite::{from_sql_time, to_sql_time, SharedConnection};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS outbox_messages (
        id TEXT PRIMARY KEY,
        topic TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        occurred_at INTEGER NOT NULL,
        next_attempt_at INTEGER,
        published_at INTEGER,
        claim_token TEXT,
        claim_expires_at INTEGER,
        data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_claim
        ON outbox_messages(status, priority DESC, occurred_at ASC);
    CREATE INDEX IF NOT EXISTS idx_outbox_published ON outbox_messages(published_at);
";

impl From<rusqlite::Error> for OutboxError {
    fn from(e: rusqlite::Error) -> Self {
        OutboxError::StoreUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for OutboxError {
    fn from(e: tokio::task::JoinError) -> Self {
        OutboxError::StoreUnavailable(format!("blocking task failed: {e}"))
    }
}

/// SQLite-backed outbox repository.
///
/// Indexed columns drive claim selection; the full message is kept as JSON in
/// `data`. Claims run inside a `BEGIN IMMEDIATE` transaction, which takes the
/// write lock up front, so concurrent claimers are serialized.
#[derive(Clone)]
pub struct SqliteOutboxRepository {
    conn: SharedConnection,
}

impl SqliteOutboxRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, OutboxError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OutboxError> {
        conn.execute_batch(SCHEMA)?;
        info!("Outbox schema ready");
        Ok(Self {
            conn: SharedConnection::new(conn),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, OutboxError>
    where
        F: FnOnce(&mut Connection) -> Result<T, OutboxError> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.run(op).await
    }

    /// Loads the claimed message, applies `change` and writes it back atomically.
    async fn update_claimed<F>(
        &self,
        id: &MessageId,
        claim_token: &str,
        change: F,
    ) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut OutboxMessage) -> Result<(), OutboxError> + Send + 'static,
    {
        let id = *id;
        let claim_token = claim_token.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut message = load(&tx, &id)?.ok_or(OutboxError::NotFound(id))?;
            if !message.is_claimed_with(&claim_token) {
                return Err(OutboxError::LeaseLost(id));
            }
            change(&mut message)?;
            write(&tx, &message)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn encode(message: &OutboxMessage) -> Result<String, OutboxError> {
    serde_json::to_string(message).map_err(|e| OutboxError::Corrupted {
        id: message.id.to_string(),
        reason: e.to_string(),
    })
}

fn decode(id: &str, data: &str) -> Result<OutboxMessage, OutboxError> {
    serde_json::from_str(data).map_err(|e| OutboxError::Corrupted {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn load(conn: &Connection, id: &MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
    let id = id.to_string();
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM outbox_messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    data.map(|data| decode(&id, &data)).transpose()
}

fn write(tx: &Transaction<'_>, message: &OutboxMessage) -> Result<(), OutboxError> {
    let data = encode(message)?;
    tx.execute(
        "UPDATE outbox_messages
         SET status = ?2,
             next_attempt_at = ?3,
             published_at = ?4,
             claim_token = ?5,
             claim_expires_at = ?6,
             data = ?7
         WHERE id = ?1",
        params![
            message.id.to_string(),
            message.status.as_str(),
            message.next_attempt_at.map(to_sql_time),
            message.published_at.map(to_sql_time),
            message.claim.as_ref().map(|lease| lease.token.clone()),
            message.claim.as_ref().map(|lease| to_sql_time(lease.expires_at)),
            data,
        ],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), OutboxError> {
        validate_new_message(&message)?;
        let data = encode(&message)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO outbox_messages
                    (id, topic, status, priority, occurred_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    message.topic,
                    message.status.as_str(),
                    message.priority,
                    to_sql_time(message.occurred_at),
                    data,
                ],
            )?;
            if inserted == 0 {
                return Err(OutboxError::DuplicateMessage(message.id));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let id = *id;
        self.with_conn(move |conn| load(conn, &id)).await
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        holder_id: &str,
        limit: usize,
        now: UnixTimeMs,
        lease_ms: u64,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let holder_id = holder_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, data FROM outbox_messages
                     WHERE status IN ('PENDING', 'FAILED')
                       AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                       AND (claim_expires_at IS NULL OR claim_expires_at <= ?1)
                     ORDER BY priority DESC, occurred_at ASC, id ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![to_sql_time(now), limit], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<_, _>>()?;
                rows
            };

            let mut claimed = Vec::with_capacity(rows.len());
            for (id, data) in rows {
                let mut message = match decode(&id, &data) {
                    Ok(message) => message,
                    Err(e) => {
                        // Quarantine so the row cannot starve every later batch.
                        warn!(message_id = %id, error = %e, "Quarantining corrupted outbox row");
                        tx.execute(
                            "UPDATE outbox_messages SET status = 'DEAD' WHERE id = ?1",
                            params![id],
                        )?;
                        continue;
                    }
                };
                message.claim = Some(ClaimLease::new(holder_id.as_str(), now, lease_ms));
                write(&tx, &message)?;
                claimed.push(message);
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn mark_published(
        &self,
        id: &MessageId,
        claim_token: &str,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        self.update_claimed(id, claim_token, move |message| {
            message.status = MessageStatus::Published;
            message.published_at = Some(now);
            message.next_attempt_at = None;
            message.claim = None;
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &MessageId,
        claim_token: &str,
        attempt: &FailedAttempt,
    ) -> Result<(), OutboxError> {
        let attempt = attempt.clone();
        self.update_claimed(id, claim_token, move |message| attempt.apply(message))
            .await
    }

    async fn release(&self, id: &MessageId, claim_token: &str) -> Result<(), OutboxError> {
        self.update_claimed(id, claim_token, |message| {
            message.claim = None;
            Ok(())
        })
        .await
    }

    async fn queue_depth(&self) -> Result<QueueDepthSnapshot, OutboxError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, topic, claim_token IS NOT NULL, COUNT(*)
                 FROM outbox_messages
                 GROUP BY status, topic, claim_token IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut snapshot = QueueDepthSnapshot::default();
            for row in rows {
                let (status, topic, claimed, count) = row?;
                let count = usize::try_from(count).unwrap_or(0);
                let status = MessageStatus::parse(&status).ok_or_else(|| OutboxError::Corrupted {
                    id: format!("status:{status}"),
                    reason: "unknown status".into(),
                })?;
                snapshot.total += count;
                match status {
                    MessageStatus::Pending => snapshot.pending += count,
                    MessageStatus::Failed => snapshot.failed += count,
                    MessageStatus::Published => snapshot.published += count,
                    MessageStatus::Dead => snapshot.dead += count,
                }
                if claimed && !status.is_terminal() {
                    snapshot.claimed += count;
                }
                *snapshot.by_topic.entry(topic).or_insert(0) += count;
            }
            Ok(snapshot)
        })
        .await
    }

    async fn prune_published(&self, older_than: UnixTimeMs) -> Result<usize, OutboxError> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM outbox_messages WHERE status = 'PUBLISHED' AND published_at < ?1",
                params![to_sql_time(older_than)],
            )?;
            Ok(removed)
        })
        .await
    }
}

impl SqliteOutboxRepository {
    /// Time of the earliest scheduled retry, if any message is waiting on backoff.
    pub async fn next_retry_at(&self) -> Result<Option<UnixTimeMs>, OutboxError> {
        self.with_conn(|conn| {
            let raw: Option<i64> = conn.query_row(
                "SELECT MIN(next_attempt_at) FROM outbox_messages WHERE status = 'FAILED'",
                [],
                |row| row.get(0),
            )?;
            Ok(raw.map(from_sql_time))
        })
        .await
    }
}
