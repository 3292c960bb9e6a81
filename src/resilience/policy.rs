use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::config::ConfigError;

// ============================================================================
// Individual Policies
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    /// Whether a per-attempt timeout counts as retryable.
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
            jitter: true,
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts must be > 0"));
        }
        self.backoff().validate().map_err(|e| e.within("retry"))
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_ms: self.initial_backoff_ms,
            multiplier: self.backoff_multiplier,
            max_ms: self.max_backoff_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("timeout.timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failure fraction in `(0, 1]` that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Outcomes required in the window before the rate is evaluated.
    pub minimum_samples: u32,
    /// Number of most recent outcomes considered.
    pub window_size: u32,
    /// Time spent OPEN before a probe is allowed.
    pub open_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_samples: 10,
            window_size: 20,
            open_cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "circuit_breaker.failure_rate_threshold must be in (0, 1], got {}",
                self.failure_rate_threshold
            )));
        }
        if self.minimum_samples == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.minimum_samples must be > 0",
            ));
        }
        if self.window_size < self.minimum_samples {
            return Err(ConfigError::invalid(
                "circuit_breaker.window_size must be >= minimum_samples",
            ));
        }
        if self.open_cooldown_ms == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.open_cooldown_ms must be > 0",
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.open_cooldown_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadConfig {
    pub permits: u32,
    /// Zero rejects immediately when no permit is free.
    pub max_wait_ms: u64,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            permits: 10,
            max_wait_ms: 0,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.permits == 0 {
            return Err(ConfigError::invalid("bulkhead.permits must be > 0"));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterConfig {
    /// Calls admitted per window.
    pub limit: u32,
    pub window_ms: u64,
    /// Zero rejects immediately when the window is exhausted.
    pub max_wait_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_ms: 1_000,
            max_wait_ms: 0,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::invalid("rate_limiter.limit must be > 0"));
        }
        if self.window_ms == 0 {
            return Err(ConfigError::invalid("rate_limiter.window_ms must be > 0"));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries must be > 0"));
        }
        if self.ttl_ms == 0 {
            return Err(ConfigError::invalid("cache.ttl_ms must be > 0"));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// ============================================================================
// Policy Set
// ============================================================================

/// Immutable bundle of up to six policies guarding one named operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResiliencePolicySet {
    pub retry: Option<RetryConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub cache: Option<CacheConfig>,
}

impl ResiliencePolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(TimeoutConfig {
            timeout_ms: crate::clock::duration_to_ms(timeout),
        });
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn with_bulkhead(mut self, permits: u32, max_wait: Duration) -> Self {
        self.bulkhead = Some(BulkheadConfig {
            permits,
            max_wait_ms: crate::clock::duration_to_ms(max_wait),
        });
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_cache(mut self, max_entries: usize, ttl: Duration) -> Self {
        self.cache = Some(CacheConfig {
            max_entries,
            ttl_ms: crate::clock::duration_to_ms(ttl),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        Ok(())
    }
}
