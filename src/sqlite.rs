//! Connection handling and column encoding shared by the SQLite adapters.

use rusqlite::Connection;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinError;

use crate::clock::UnixTimeMs;

/// One connection behind a mutex, driven from `spawn_blocking`.
#[derive(Clone)]
pub(crate) struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `op` on the blocking pool. A poisoned lock is recovered, since
    /// every write happens inside a transaction or a single statement.
    pub(crate) async fn run<T, E, F>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut guard)
        })
        .await?
    }

    /// Direct lock on the connection, for tests that poke at raw rows.
    #[cfg(test)]
    pub(crate) fn lock(&self) -> std::sync::LockResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock()
    }
}

pub(crate) fn to_sql_time(time: UnixTimeMs) -> i64 {
    i64::try_from(time.0).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_time(raw: i64) -> UnixTimeMs {
    UnixTimeMs(u64::try_from(raw).unwrap_or(0))
}
