use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{OutboxError, PublishError};
use super::message::{MessageId, MessageStatus, OutboxMessage};
use super::publisher::OutboxPublisher;
use super::repository::{FailedAttempt, OutboxRepository, QueueDepthSnapshot};
use crate::backoff::ExponentialBackoff;
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigError;
use crate::error::{error_descriptor, ErrorCategory, Retryable};
use crate::resilience::{
    CircuitBreakerConfig, CircuitState, ResilienceError, ResilienceExecutor, ResiliencePolicySet,
};

// ============================================================================
// Configuration
// ============================================================================

/// Granularity of the publish circuit breaker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// One breaker shared by every topic.
    #[default]
    Global,
    /// One breaker per topic, so a failing topic does not stall the others.
    PerTopic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxConfig {
    pub batch_size: usize,
    /// Failed publishes allowed before a message is dead-lettered.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub use_circuit_breaker: bool,
    pub breaker_scope: BreakerScope,
    pub circuit_breaker: CircuitBreakerConfig,
    /// How long a claim protects a message from other processors.
    pub claim_lease_ms: u64,
    /// Claim holder identity. A random one is generated when unset.
    pub worker_id: Option<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            backoff_multiplier: 2.0,
            use_circuit_breaker: false,
            breaker_scope: BreakerScope::Global,
            circuit_breaker: CircuitBreakerConfig::default(),
            claim_lease_ms: 60_000,
            worker_id: None,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be > 0"));
        }
        self.backoff()?;
        if self.claim_lease_ms < 1_000 {
            return Err(ConfigError::invalid("claim_lease_ms should be at least 1000ms"));
        }
        if self.use_circuit_breaker {
            self.circuit_breaker
                .validate()
                .map_err(|e| e.within("circuit_breaker"))?;
        }
        if self
            .worker_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(ConfigError::invalid("worker_id cannot be blank"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Result<ExponentialBackoff, ConfigError> {
        ExponentialBackoff::new(
            self.initial_backoff_ms,
            self.backoff_multiplier,
            self.max_backoff_ms,
        )
    }
}

// ============================================================================
// Metrics and Reports
// ============================================================================

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub claimed: AtomicU64,
    pub published: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub short_circuited: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> OutboxMetricsSnapshot {
        OutboxMetricsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxMetricsSnapshot {
    pub claimed: u64,
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub short_circuited: u64,
    pub storage_errors: u64,
}

/// What one `process_once` call did.
///
/// Per-message failures never abort the batch; they are collected in `errors`
/// as `PublishFailure`, `DeadLettered`, `LeaseLost` or `StoreUnavailable`.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Claims released untouched because the publish circuit was open.
    pub short_circuited: usize,
    pub errors: Vec<(MessageId, OutboxError)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.short_circuited == 0
    }

    pub fn error_for(&self, id: &MessageId) -> Option<&OutboxError> {
        self.errors
            .iter()
            .find_map(|(message_id, error)| (message_id == id).then_some(error))
    }
}

// ============================================================================
// Processor
// ============================================================================

const PUBLISH_OPERATION: &str = "outbox.publish";

/// Claims due messages, publishes them, and records the outcome of each one.
///
/// Safe to run as several instances against one repository; the claim lease
/// keeps them from publishing the same message concurrently.
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: OutboxConfig,
    backoff: ExponentialBackoff,
    worker_id: String,
    clock: Arc<dyn Clock>,
    executor: Arc<ResilienceExecutor>,
    breaker_policies: Option<ResiliencePolicySet>,
    metrics: Arc<OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: OutboxConfig) -> Result<Self, OutboxError> {
        Self::with_clock(repository, publisher, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<R>,
        publisher: Arc<P>,
        config: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        let backoff = config.backoff()?;
        let worker_id = config
            .worker_id
            .as_deref()
            .map_or_else(|| Uuid::new_v4().to_string(), |id| id.trim().to_string());
        let breaker_policies = config
            .use_circuit_breaker
            .then(|| ResiliencePolicySet::new().with_circuit_breaker(config.circuit_breaker.clone()));

        Ok(Self {
            repository,
            publisher,
            config,
            backoff,
            worker_id,
            clock,
            executor: Arc::new(ResilienceExecutor::new()),
            breaker_policies,
            metrics: Arc::new(OutboxMetrics::default()),
        })
    }

    /// Routes publishes through a shared executor, so its telemetry sink and
    /// circuit state are visible alongside other guarded operations.
    pub fn with_executor(mut self, executor: Arc<ResilienceExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn metrics(&self) -> OutboxMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// State of the breaker guarding `topic`, if one has been created.
    pub fn circuit_state(&self, topic: &str) -> Option<CircuitState> {
        self.breaker_policies.as_ref()?;
        self.executor.circuit_state(&self.breaker_operation(topic))
    }

    pub async fn queue_depth(&self) -> Result<QueueDepthSnapshot, OutboxError> {
        self.repository.queue_depth().await
    }

    /// Deletes messages published longer than `retention` ago.
    #[instrument(skip(self))]
    pub async fn prune_published(&self, retention: Duration) -> Result<usize, OutboxError> {
        let cutoff = self
            .clock
            .now()
            .saturating_sub_ms(crate::clock::duration_to_ms(retention));
        let pruned = self.repository.prune_published(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "Pruned published outbox messages");
        }
        Ok(pruned)
    }

    /// Runs [`process_once`](Self::process_once) with the configured batch size.
    pub async fn tick(&self) -> Result<BatchReport, OutboxError> {
        self.process_once(self.config.batch_size).await
    }

    /// Claims up to `batch_size` due messages and tries to publish each once.
    ///
    /// Only a failure to claim aborts the call. Everything after the claim is
    /// isolated per message and reported in the returned [`BatchReport`].
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn process_once(&self, batch_size: usize) -> Result<BatchReport, OutboxError> {
        let mut report = BatchReport::default();
        if batch_size == 0 {
            return Ok(report);
        }

        let batch = self
            .repository
            .claim_batch(
                &self.worker_id,
                batch_size,
                self.clock.now(),
                self.config.claim_lease_ms,
            )
            .await
            .map_err(|e| {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Failed to claim outbox batch");
                e
            })?;

        report.claimed = batch.len();
        self.metrics
            .claimed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        for message in batch {
            self.process_message(message, &mut report).await;
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                published = report.published,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                short_circuited = report.short_circuited,
                "Processed outbox batch"
            );
        }
        Ok(report)
    }

    async fn process_message(&self, message: OutboxMessage, report: &mut BatchReport) {
        let id = message.id;
        let Some(token) = message.claim.as_ref().map(|lease| lease.token.clone()) else {
            report.errors.push((id, OutboxError::LeaseLost(id)));
            return;
        };

        match self.publish(&message).await {
            Ok(()) => match self
                .repository
                .mark_published(&id, &token, self.clock.now())
                .await
            {
                Ok(()) => {
                    report.published += 1;
                    self.metrics.published.fetch_add(1, Ordering::Relaxed);
                    debug!(message_id = %id, topic = %message.topic, "Published outbox message");
                }
                Err(e) => self.storage_error(id, e, report),
            },
            Err(ResilienceError::CircuitOpen { state, .. }) => {
                report.short_circuited += 1;
                self.metrics.short_circuited.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %id, state = %state, "Publish circuit open, releasing claim");
                if let Err(e) = self.repository.release(&id, &token).await {
                    self.storage_error(id, e, report);
                }
            }
            Err(other) => {
                let publish_error = match other {
                    ResilienceError::Operation(error) => error,
                    other => PublishError::new(ErrorCategory::Unknown, error_descriptor(&other)),
                };
                self.record_failure(&message, &token, publish_error, report)
                    .await;
            }
        }
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), ResilienceError<PublishError>> {
        let Some(policies) = &self.breaker_policies else {
            return self
                .publisher
                .publish(message)
                .await
                .map_err(ResilienceError::Operation);
        };
        let operation = self.breaker_operation(&message.topic);
        self.executor
            .supply(&operation, policies, || self.publisher.publish(message))
            .await
    }

    async fn record_failure(
        &self,
        message: &OutboxMessage,
        token: &str,
        error: PublishError,
        report: &mut BatchReport,
    ) {
        let id = message.id;
        let attempts = message.attempts.saturating_add(1);
        let dead = !error.is_retryable() || attempts >= self.config.max_attempts;
        let attempt = if dead {
            FailedAttempt {
                attempts,
                status: MessageStatus::Dead,
                next_attempt_at: None,
                reason: error.message.clone(),
            }
        } else {
            FailedAttempt {
                attempts,
                status: MessageStatus::Failed,
                next_attempt_at: Some(
                    self.clock
                        .now()
                        .saturating_add_ms(self.backoff.delay_ms(attempts)),
                ),
                reason: error.message.clone(),
            }
        };

        if let Err(e) = self.repository.mark_failed(&id, token, &attempt).await {
            self.storage_error(id, e, report);
            return;
        }

        if dead {
            report.dead_lettered += 1;
            self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
            error!(
                message_id = %id,
                topic = %message.topic,
                attempts,
                retryable = error.is_retryable(),
                error = %error,
                "Outbox message dead-lettered"
            );
            report
                .errors
                .push((id, OutboxError::DeadLettered { id, attempts }));
        } else {
            report.retried += 1;
            self.metrics.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_id = %id,
                topic = %message.topic,
                attempts,
                next_attempt_at = ?attempt.next_attempt_at,
                error = %error,
                "Outbox publish failed, will retry"
            );
            report.errors.push((id, OutboxError::PublishFailure(error)));
        }
    }

    fn storage_error(&self, id: MessageId, error: OutboxError, report: &mut BatchReport) {
        self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
        error!(message_id = %id, error = %error, "Failed to record outbox outcome");
        report.errors.push((id, error));
    }

    fn breaker_operation(&self, topic: &str) -> String {
        match self.config.breaker_scope {
            BreakerScope::Global => PUBLISH_OPERATION.to_string(),
            BreakerScope::PerTopic => format!("{PUBLISH_OPERATION}.{topic}"),
        }
    }
}
