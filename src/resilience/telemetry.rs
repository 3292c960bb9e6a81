use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitState, StateTransition};
use super::error::FailureKind;
use crate::clock::duration_to_ms;

/// Receives resilience events. Every method defaults to a no-op.
pub trait TelemetrySink: Send + Sync {
    fn call_started(&self, _operation: &str) {}
    fn call_succeeded(&self, _operation: &str, _elapsed: Duration) {}
    fn call_failed(&self, _operation: &str, _kind: FailureKind, _elapsed: Duration) {}
    fn retry_scheduled(&self, _operation: &str, _attempt: u32, _delay: Duration) {}
    fn circuit_transition(&self, _operation: &str, _transition: StateTransition) {}
    fn bulkhead_rejected(&self, _operation: &str) {}
    fn rate_limited(&self, _operation: &str) {}
    fn cache_hit(&self, _operation: &str) {}
    fn cache_miss(&self, _operation: &str) {}
    fn fallback_invoked(&self, _operation: &str, _kind: FailureKind) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Logs resilience events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn call_failed(&self, operation: &str, kind: FailureKind, elapsed: Duration) {
        warn!(operation, kind = %kind, elapsed_ms = duration_to_ms(elapsed), "Guarded call failed");
    }

    fn retry_scheduled(&self, operation: &str, attempt: u32, delay: Duration) {
        debug!(operation, attempt, delay_ms = duration_to_ms(delay), "Retrying guarded call");
    }

    fn circuit_transition(&self, operation: &str, transition: StateTransition) {
        if transition.to == CircuitState::Open {
            warn!(operation, transition = %transition, "Circuit opened");
        } else {
            info!(operation, transition = %transition, "Circuit state changed");
        }
    }

    fn bulkhead_rejected(&self, operation: &str) {
        warn!(operation, "Bulkhead full, call rejected");
    }

    fn rate_limited(&self, operation: &str) {
        warn!(operation, "Rate limit exceeded, call rejected");
    }

    fn fallback_invoked(&self, operation: &str, kind: FailureKind) {
        info!(operation, kind = %kind, "Serving fallback");
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
struct OperationCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    circuit_opened: AtomicU64,
    short_circuited: AtomicU64,
    bulkhead_rejections: AtomicU64,
    rate_limited: AtomicU64,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallbacks: AtomicU64,
    total_latency_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationMetricsSnapshot {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub circuit_opened: u64,
    pub short_circuited: u64,
    pub bulkhead_rejections: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks: u64,
    pub total_latency_ms: u64,
}

/// Per-operation counters, safe to share across every executor.
#[derive(Debug, Default)]
pub struct ResilienceMetrics {
    operations: DashMap<String, OperationCounters>,
}

impl ResilienceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, operation: &str) -> Option<OperationMetricsSnapshot> {
        self.operations.get(operation).map(|c| OperationMetricsSnapshot {
            calls: c.calls.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            circuit_opened: c.circuit_opened.load(Ordering::Relaxed),
            short_circuited: c.short_circuited.load(Ordering::Relaxed),
            bulkhead_rejections: c.bulkhead_rejections.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            total_latency_ms: c.total_latency_ms.load(Ordering::Relaxed),
        })
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.iter().map(|e| e.key().clone()).collect()
    }

    fn bump(&self, operation: &str, counter: impl Fn(&OperationCounters) -> &AtomicU64) {
        self.add(operation, counter, 1);
    }

    fn add(&self, operation: &str, counter: impl Fn(&OperationCounters) -> &AtomicU64, n: u64) {
        if let Some(counters) = self.operations.get(operation) {
            counter(counters.value()).fetch_add(n, Ordering::Relaxed);
            return;
        }
        let counters = self.operations.entry(operation.to_string()).or_default();
        counter(counters.value()).fetch_add(n, Ordering::Relaxed);
    }
}

impl TelemetrySink for ResilienceMetrics {
    fn call_started(&self, operation: &str) {
        self.bump(operation, |c| &c.calls);
    }

    fn call_succeeded(&self, operation: &str, elapsed: Duration) {
        self.bump(operation, |c| &c.successes);
        self.add(operation, |c| &c.total_latency_ms, duration_to_ms(elapsed));
    }

    fn call_failed(&self, operation: &str, kind: FailureKind, elapsed: Duration) {
        self.bump(operation, |c| &c.failures);
        self.add(operation, |c| &c.total_latency_ms, duration_to_ms(elapsed));
        match kind {
            FailureKind::CircuitOpen => self.bump(operation, |c| &c.short_circuited),
            FailureKind::TimeoutExceeded => self.bump(operation, |c| &c.timeouts),
            _ => {}
        }
    }

    fn retry_scheduled(&self, operation: &str, _attempt: u32, _delay: Duration) {
        self.bump(operation, |c| &c.retries);
    }

    fn circuit_transition(&self, operation: &str, transition: StateTransition) {
        if transition.to == CircuitState::Open {
            self.bump(operation, |c| &c.circuit_opened);
        }
    }

    fn bulkhead_rejected(&self, operation: &str) {
        self.bump(operation, |c| &c.bulkhead_rejections);
    }

    fn rate_limited(&self, operation: &str) {
        self.bump(operation, |c| &c.rate_limited);
    }

    fn cache_hit(&self, operation: &str) {
        self.bump(operation, |c| &c.cache_hits);
    }

    fn cache_miss(&self, operation: &str) {
        self.bump(operation, |c| &c.cache_misses);
    }

    fn fallback_invoked(&self, operation: &str, _kind: FailureKind) {
        self.bump(operation, |c| &c.fallbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_operation() {
        let metrics = ResilienceMetrics::new();
        metrics.call_started("a");
        metrics.call_started("a");
        metrics.call_succeeded("a", Duration::from_millis(20));
        metrics.call_failed("a", FailureKind::TimeoutExceeded, Duration::from_millis(5));
        metrics.call_started("b");
        metrics.bulkhead_rejected("b");

        let a = metrics.snapshot("a").unwrap();
        assert_eq!(a.calls, 2);
        assert_eq!(a.successes, 1);
        assert_eq!(a.failures, 1);
        assert_eq!(a.timeouts, 1);
        assert_eq!(a.total_latency_ms, 25);
        assert_eq!(a.bulkhead_rejections, 0);

        let b = metrics.snapshot("b").unwrap();
        assert_eq!(b.bulkhead_rejections, 1);
        assert!(metrics.snapshot("c").is_none());

        let mut names = metrics.operations();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_only_open_transitions_counted() {
        let metrics = ResilienceMetrics::new();
        metrics.circuit_transition(
            "op",
            StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
            },
        );
        metrics.circuit_transition(
            "op",
            StateTransition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Closed,
            },
        );
        assert_eq!(metrics.snapshot("op").unwrap().circuit_opened, 1);
    }
}
