//! Composable call guards: cache, circuit breaker, bulkhead, rate limiter,
//! timeout, retry and fallback.

mod bulkhead;
mod cache;
mod circuit_breaker;
mod error;
mod executor;
mod fallback;
mod policy;
mod rate_limiter;
mod retry;
mod telemetry;
mod timeout;

pub use bulkhead::{Bulkhead, BulkheadFull};
pub use cache::ResultCache;
pub use circuit_breaker::{
    CircuitBreaker, CircuitGuard, CircuitRejected, CircuitSnapshot, CircuitState,
    StateTransition,
};
pub use error::{AttemptError, FailureKind, ResilienceError};
pub use executor::ResilienceExecutor;
pub use fallback::{FallbackStrategy, FunctionFallback, ValueFallback};
pub use policy::{
    BulkheadConfig, CacheConfig, CircuitBreakerConfig, RateLimiterConfig, ResiliencePolicySet,
    RetryConfig, TimeoutConfig,
};
pub use rate_limiter::{RateLimitExceeded, RateLimiter};
pub use retry::run_with_retry;
pub use telemetry::{
    NoopTelemetry, OperationMetricsSnapshot, ResilienceMetrics, TelemetrySink, TracingTelemetry,
};
pub use timeout::with_timeout;
