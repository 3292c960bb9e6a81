use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::key::IdempotencyKey;
use super::store::{IdempotencyStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::error::error_descriptor;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencyConfig {
    /// TTL applied when a caller passes none, or a zero TTL.
    pub default_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(ConfigError::invalid("default_ttl_ms must be > 0"));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

// ============================================================================
// Outcomes and Errors
// ============================================================================

/// Result of an idempotent execution that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdempotentOutcome<T> {
    /// This caller acquired the key and ran the action.
    Executed(T),
    /// A previous execution completed; its result reference is handed back.
    AlreadyCompleted { result_ref: Option<String> },
    /// Another execution owns the key and has not completed.
    InProgress,
}

impl<T> IdempotentOutcome<T> {
    pub fn executed(&self) -> bool {
        matches!(self, IdempotentOutcome::Executed(_))
    }

    pub fn existing_result_ref(&self) -> Option<&str> {
        match self {
            IdempotentOutcome::AlreadyCompleted { result_ref } => result_ref.as_deref(),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            IdempotentOutcome::Executed(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            IdempotentOutcome::Executed(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    #[error("idempotency key {key} is owned by another execution")]
    AcquisitionConflict { key: IdempotencyKey },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("idempotent action failed: {0}")]
    Action(#[source] E),
}

impl<E> IdempotencyError<E> {
    /// The action's own error, if that is what failed.
    pub fn into_action_error(self) -> Option<E> {
        match self {
            IdempotencyError::Action(error) => Some(error),
            _ => None,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub executions: AtomicU64,
    pub replays: AtomicU64,
    pub conflicts: AtomicU64,
    pub action_failures: AtomicU64,
    pub store_errors: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn snapshot(&self) -> IdempotencyMetricsSnapshot {
        IdempotencyMetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdempotencyMetricsSnapshot {
    pub executions: u64,
    pub replays: u64,
    pub conflicts: u64,
    pub action_failures: u64,
    pub store_errors: u64,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs an action at most once per key, using the store's atomic acquire.
///
/// Holds no shared mutable state besides metrics; any number of coordinators,
/// in any number of processes, may share one store.
pub struct IdempotencyCoordinator<S: IdempotencyStore> {
    store: Arc<S>,
    config: IdempotencyConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<IdempotencyMetrics>,
}

impl<S: IdempotencyStore> IdempotencyCoordinator<S> {
    pub fn new(store: Arc<S>, config: IdempotencyConfig) -> Result<Self, ConfigError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        config: IdempotencyConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock,
            metrics: Arc::new(IdempotencyMetrics::default()),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> IdempotencyMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Missing TTLs, and TTLs below the store's millisecond resolution, fall
    /// back to the configured default.
    pub fn normalize_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if ttl >= Duration::from_millis(1) => ttl,
            _ => self.config.default_ttl(),
        }
    }

    /// Runs `action` if this caller wins ownership of `key`.
    ///
    /// A completed key returns its stored result reference without running
    /// anything. A key owned by someone else (in progress, or failed and not yet
    /// expired) returns [`IdempotentOutcome::InProgress`]. Action errors are
    /// recorded as `FAILED` and returned unchanged inside
    /// [`IdempotencyError::Action`].
    #[instrument(skip(self, key, action, result_ref), fields(key = %key))]
    pub async fn execute<T, E, F, Fut, M>(
        &self,
        key: &IdempotencyKey,
        ttl: Option<Duration>,
        action: F,
        result_ref: M,
    ) -> Result<IdempotentOutcome<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        M: FnOnce(&T) -> String,
        E: std::fmt::Display,
    {
        if let Some(record) = self.store.find(key).await.map_err(|e| self.store_failure(e))? {
            if record.is_completed() {
                self.metrics.replays.fetch_add(1, Ordering::Relaxed);
                debug!("Key already completed, returning stored result");
                return Ok(IdempotentOutcome::AlreadyCompleted {
                    result_ref: record.result_ref,
                });
            }
        }

        let ttl = self.normalize_ttl(ttl);
        let acquired = self
            .store
            .try_acquire(key, ttl, self.clock.now())
            .await
            .map_err(|e| self.store_failure(e))?;
        if !acquired {
            self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
            info!("Key owned by another execution");
            return Ok(IdempotentOutcome::InProgress);
        }

        match action().await {
            Ok(value) => {
                let reference = result_ref(&value);
                self.store
                    .mark_completed(key, &reference, self.clock.now())
                    .await
                    .map_err(|e| self.store_failure(e))?;
                self.metrics.executions.fetch_add(1, Ordering::Relaxed);
                info!(result_ref = %reference, "Idempotent action completed");
                Ok(IdempotentOutcome::Executed(value))
            }
            Err(action_error) => {
                self.metrics.action_failures.fetch_add(1, Ordering::Relaxed);
                let descriptor = error_descriptor(&action_error);
                warn!(error = %descriptor, "Idempotent action failed");
                if let Err(store_error) = self
                    .store
                    .mark_failed(key, &descriptor, self.clock.now())
                    .await
                {
                    self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %store_error, "Failed to record action failure");
                }
                Err(IdempotencyError::Action(action_error))
            }
        }
    }

    /// Like [`execute`](Self::execute), but reports an owned key as
    /// [`IdempotencyError::AcquisitionConflict`] instead of `InProgress`.
    pub async fn execute_strict<T, E, F, Fut, M>(
        &self,
        key: &IdempotencyKey,
        ttl: Option<Duration>,
        action: F,
        result_ref: M,
    ) -> Result<IdempotentOutcome<T>, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        M: FnOnce(&T) -> String,
        E: std::fmt::Display,
    {
        match self.execute(key, ttl, action, result_ref).await? {
            IdempotentOutcome::InProgress => {
                Err(IdempotencyError::AcquisitionConflict { key: key.clone() })
            }
            outcome => Ok(outcome),
        }
    }

    /// Removes expired records, ending reuse of completed results past their TTL.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let purged = self.store.purge_expired(self.clock.now()).await?;
        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }

    fn store_failure(&self, error: StoreError) -> StoreError {
        self.metrics.store_errors.fetch_add(1, Ordering::Relaxed);
        error!(error = %error, "Idempotency store failure");
        error
    }
}
