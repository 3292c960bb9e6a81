use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use super::key::IdempotencyKey;
use super::record::{IdempotencyRecord, IdempotencyStatus};
use crate::clock::UnixTimeMs;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),

    #[error("idempotency record not found: {0}")]
    NotFound(String),

    #[error("corrupted idempotency record: {key}, reason: {reason}")]
    Corrupted { key: String, reason: String },
}

/// Storage port for idempotency records.
///
/// `try_acquire` must be linearizable across every process sharing the store:
/// it creates an `IN_PROGRESS` record only when no record exists for the key or
/// the existing one has expired (`now > expires_at`), and reports whether it did.
/// `COMPLETED` records are never taken over; only `purge_expired` removes them.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn try_acquire(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
        now: UnixTimeMs,
    ) -> Result<bool, StoreError>;

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        result_ref: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError>;

    /// Removes settled (`COMPLETED` or `FAILED`) records whose TTL has elapsed.
    /// `IN_PROGRESS` records stay so a slow owner can still record its outcome;
    /// an abandoned one is taken over by the next `try_acquire` instead.
    async fn purge_expired(&self, now: UnixTimeMs) -> Result<usize, StoreError>;
}

/// Process-local store. Atomicity comes from holding the write lock across the
/// check and the insert.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn update<F>(&self, key: &IdempotencyKey, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut IdempotencyRecord) + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.as_str().to_string()))?;
        apply(record);
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn try_acquire(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
        now: UnixTimeMs,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(key) {
            if existing.is_completed() || !existing.is_expired(now) {
                return Ok(false);
            }
        }
        records.insert(
            key.clone(),
            IdempotencyRecord::in_progress(key.clone(), now, ttl),
        );
        Ok(true)
    }

    async fn mark_completed(
        &self,
        key: &IdempotencyKey,
        result_ref: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError> {
        let result_ref = result_ref.to_string();
        self.update(key, move |record| {
            record.status = IdempotencyStatus::Completed;
            record.result_ref = Some(result_ref);
            record.last_error = None;
            record.updated_at = now;
        })
        .await
    }

    async fn mark_failed(
        &self,
        key: &IdempotencyKey,
        reason: &str,
        now: UnixTimeMs,
    ) -> Result<(), StoreError> {
        let reason = reason.to_string();
        self.update(key, move |record| {
            record.status = IdempotencyStatus::Failed;
            record.last_error = Some(reason);
            record.updated_at = now;
        })
        .await
    }

    async fn purge_expired(&self, now: UnixTimeMs) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record.status == IdempotencyStatus::InProgress || !record.is_expired(now)
        });
        Ok(before - records.len())
    }
}
