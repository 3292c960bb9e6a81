use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::bulkhead::Bulkhead;
use super::cache::ResultCache;
use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use super::error::ResilienceError;
use super::fallback::FallbackStrategy;
use super::policy::ResiliencePolicySet;
use super::rate_limiter::RateLimiter;
use super::retry::run_with_retry;
use super::telemetry::{TelemetrySink, TracingTelemetry};
use crate::config::ConfigError;
use crate::error::Retryable;

/// Stateful guards built once per `(operation, policy set)` and reused.
struct OperationGuards {
    policies: ResiliencePolicySet,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    bulkhead: Option<Bulkhead>,
    rate_limiter: Option<RateLimiter>,
    cache: Option<ResultCache>,
}

impl OperationGuards {
    fn build(policies: &ResiliencePolicySet) -> Result<Self, ConfigError> {
        policies.validate()?;
        Ok(Self {
            policies: policies.clone(),
            circuit_breaker: policies
                .circuit_breaker
                .clone()
                .map(|config| Arc::new(CircuitBreaker::new(config))),
            bulkhead: policies.bulkhead.as_ref().map(Bulkhead::new),
            rate_limiter: policies.rate_limiter.as_ref().map(RateLimiter::new),
            cache: policies.cache.as_ref().map(ResultCache::new),
        })
    }
}

/// Wraps units of work in the policies of a [`ResiliencePolicySet`].
///
/// Layers run outer to inner as cache, circuit breaker, bulkhead, rate
/// limiter, then retry around a per-attempt timeout. Each operation name owns
/// its own guard state; calls for different operations never contend.
pub struct ResilienceExecutor {
    registry: DashMap<String, Arc<OperationGuards>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Default for ResilienceExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResilienceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceExecutor")
            .field("operations", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl ResilienceExecutor {
    pub fn new() -> Self {
        Self::with_telemetry(Arc::new(TracingTelemetry))
    }

    pub fn with_telemetry(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            registry: DashMap::new(),
            telemetry,
        }
    }

    /// Validates `policies` and builds the guards for `operation` ahead of the first call.
    pub fn register(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
    ) -> Result<(), ConfigError> {
        self.guards_for(operation, policies).map(drop)
    }

    pub async fn supply<T, E, F, Fut>(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
        work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let guards = self.guards(operation, policies)?;
        self.guarded(operation, &guards, work).await
    }

    pub async fn supply_with_fallback<T, E, F, Fut>(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
        work: F,
        fallback: &dyn FallbackStrategy<T, E>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let result = self.supply(operation, policies, work).await;
        self.recover(operation, result, fallback).await
    }

    /// Like [`supply`](Self::supply), answering from the policy set's cache when
    /// `cache_key` holds a fresh result. Only successful results are cached.
    pub async fn supply_cached<T, E, F, Fut>(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
        cache_key: &str,
        work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let guards = self.guards(operation, policies)?;
        let Some(cache) = &guards.cache else {
            debug!(operation, "No cache policy, calling through");
            return self.guarded(operation, &guards, work).await;
        };

        if let Some(hit) = cache.get::<T>(cache_key) {
            self.telemetry.cache_hit(operation);
            return Ok(hit);
        }
        self.telemetry.cache_miss(operation);

        let value = self.guarded(operation, &guards, work).await?;
        cache.insert(cache_key, value.clone());
        Ok(value)
    }

    pub async fn supply_cached_with_fallback<T, E, F, Fut>(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
        cache_key: &str,
        work: F,
        fallback: &dyn FallbackStrategy<T, E>,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let result = self.supply_cached(operation, policies, cache_key, work).await;
        self.recover(operation, result, fallback).await
    }

    pub fn circuit_state(&self, operation: &str) -> Option<CircuitState> {
        self.circuit_snapshot(operation).map(|snapshot| snapshot.state)
    }

    pub fn circuit_snapshot(&self, operation: &str) -> Option<CircuitSnapshot> {
        let guards = self.registry.get(operation)?;
        guards.circuit_breaker.as_ref().map(|cb| cb.snapshot())
    }

    pub fn invalidate_cache(&self, operation: &str, cache_key: &str) -> bool {
        self.registry
            .get(operation)
            .and_then(|guards| guards.cache.as_ref().map(|cache| cache.invalidate(cache_key)))
            .unwrap_or(false)
    }

    pub fn operations(&self) -> Vec<String> {
        self.registry.iter().map(|e| e.key().clone()).collect()
    }

    fn guards<E>(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
    ) -> Result<Arc<OperationGuards>, ResilienceError<E>> {
        self.guards_for(operation, policies)
            .map_err(|source| ResilienceError::InvalidPolicy {
                operation: operation.to_string(),
                source,
            })
    }

    fn guards_for(
        &self,
        operation: &str,
        policies: &ResiliencePolicySet,
    ) -> Result<Arc<OperationGuards>, ConfigError> {
        if let Some(existing) = self.registry.get(operation) {
            if existing.policies == *policies {
                return Ok(Arc::clone(existing.value()));
            }
        }

        let built = Arc::new(OperationGuards::build(policies)?);
        let mut entry = self
            .registry
            .entry(operation.to_string())
            .or_insert_with(|| Arc::clone(&built));
        if entry.policies != *policies {
            warn!(operation, "Policy set changed, rebuilding guards");
            *entry = built;
        }
        Ok(Arc::clone(entry.value()))
    }

    #[instrument(skip_all, fields(operation = operation))]
    async fn guarded<T, E, F, Fut>(
        &self,
        operation: &str,
        guards: &OperationGuards,
        mut work: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let started = Instant::now();
        self.telemetry.call_started(operation);

        let result = self.through_circuit(operation, guards, &mut work).await;
        match &result {
            Ok(_) => self.telemetry.call_succeeded(operation, started.elapsed()),
            Err(error) => self
                .telemetry
                .call_failed(operation, error.kind(), started.elapsed()),
        }
        result
    }

    async fn through_circuit<T, E, F, Fut>(
        &self,
        operation: &str,
        guards: &OperationGuards,
        work: &mut F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let Some(breaker) = &guards.circuit_breaker else {
            return self.admitted(operation, guards, work).await;
        };

        let guard = breaker.acquire().map_err(|rejected| ResilienceError::CircuitOpen {
            operation: operation.to_string(),
            state: rejected.state,
        })?;
        if let Some(transition) = guard.admission_transition() {
            self.telemetry.circuit_transition(operation, transition);
        }

        let result = self.admitted(operation, guards, work).await;
        let transition = match &result {
            Ok(_) => guard.success(),
            Err(error) if error.kind().counts_against_circuit() => guard.failure(),
            Err(_) => {
                guard.ignore();
                None
            }
        };
        if let Some(transition) = transition {
            self.telemetry.circuit_transition(operation, transition);
        }
        result
    }

    async fn admitted<T, E, F, Fut>(
        &self,
        operation: &str,
        guards: &OperationGuards,
        work: &mut F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let _permit = match &guards.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire().await.map_err(|full| {
                self.telemetry.bulkhead_rejected(operation);
                ResilienceError::BulkheadRejected {
                    operation: operation.to_string(),
                    max_concurrent: full.max_concurrent,
                }
            })?),
            None => None,
        };

        if let Some(rate_limiter) = &guards.rate_limiter {
            rate_limiter.acquire().await.map_err(|exceeded| {
                self.telemetry.rate_limited(operation);
                ResilienceError::RateLimited {
                    operation: operation.to_string(),
                    limit: exceeded.limit,
                    window: exceeded.window,
                }
            })?;
        }

        let timeout = guards.policies.timeout.as_ref().map(|t| t.duration());
        run_with_retry(
            operation,
            guards.policies.retry.as_ref(),
            timeout,
            self.telemetry.as_ref(),
            work,
        )
        .await
    }

    async fn recover<T, E>(
        &self,
        operation: &str,
        result: Result<T, ResilienceError<E>>,
        fallback: &dyn FallbackStrategy<T, E>,
    ) -> Result<T, ResilienceError<E>> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                self.telemetry.fallback_invoked(operation, error.kind());
                fallback.recover(error).await
            }
        }
    }
}
