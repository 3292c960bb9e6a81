//! Failure-rate circuit breaker.
//!
//! ```text
//! Closed → Open: failure rate >= threshold over >= minimum samples
//! Open → HalfOpen: first call after the cooldown becomes the probe
//! HalfOpen → Closed: probe succeeds
//! HalfOpen → Open: probe fails
//! ```
//!
//! State lives in an atomic and every transition is a compare-and-swap, so
//! readers never block. Only one probe is in flight while half-open.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

use super::policy::CircuitBreakerConfig;
use crate::clock::duration_to_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Returned when the circuit refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitRejected {
    pub state: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub samples: u32,
    pub failures: u32,
}

#[derive(Debug, Default)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    failures: u32,
}

impl OutcomeWindow {
    fn record(&mut self, success: bool, capacity: usize) {
        if self.outcomes.len() == capacity {
            if let Some(false) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(success);
        if !success {
            self.failures += 1;
        }
    }

    fn samples(&self) -> u32 {
        u32::try_from(self.outcomes.len()).unwrap_or(u32::MAX)
    }

    #[allow(clippy::cast_precision_loss)]
    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        f64::from(self.failures) / self.outcomes.len() as f64
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    epoch: Instant,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    window: Mutex<OutcomeWindow>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            epoch: Instant::now(),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            window: Mutex::new(OutcomeWindow::default()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        CircuitSnapshot {
            state: self.state(),
            samples: window.samples(),
            failures: window.failures,
        }
    }

    /// Admits a call, returning a guard that must be settled with its outcome.
    ///
    /// A guard dropped without being settled releases its permit without
    /// recording anything, so a cancelled probe never wedges the circuit.
    pub fn acquire(self: &Arc<Self>) -> Result<CircuitGuard, CircuitRejected> {
        let (probe, transition) = self.try_admit()?;
        Ok(CircuitGuard {
            breaker: Arc::clone(self),
            probe,
            transition,
            settled: false,
        })
    }

    fn try_admit(&self) -> Result<(bool, Option<StateTransition>), CircuitRejected> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok((false, None)),
                CircuitState::HalfOpen => {
                    return if self.claim_probe() {
                        Ok((true, None))
                    } else {
                        Err(CircuitRejected {
                            state: CircuitState::HalfOpen,
                        })
                    };
                }
                CircuitState::Open => {
                    if !self.cooldown_elapsed() || !self.claim_probe() {
                        return Err(CircuitRejected {
                            state: CircuitState::Open,
                        });
                    }
                    if let Some(transition) =
                        self.transition(CircuitState::Open, CircuitState::HalfOpen)
                    {
                        return Ok((true, Some(transition)));
                    }
                    self.probe_in_flight.store(false, Ordering::Release);
                }
            }
        }
    }

    fn claim_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        self.elapsed_ms().saturating_sub(opened_at) >= self.config.open_cooldown_ms
    }

    fn elapsed_ms(&self) -> u64 {
        duration_to_ms(self.epoch.elapsed())
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> Option<StateTransition> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StateTransition { from, to })
    }

    fn open_from(&self, from: CircuitState) -> Option<StateTransition> {
        self.opened_at_ms.store(self.elapsed_ms(), Ordering::Release);
        self.transition(from, CircuitState::Open)
    }

    fn record_success(&self, probe: bool) -> Option<StateTransition> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if probe {
            let transition = self.transition(CircuitState::HalfOpen, CircuitState::Closed);
            window.clear();
            self.probe_in_flight.store(false, Ordering::Release);
            return transition;
        }
        if self.state() == CircuitState::Closed {
            window.record(true, self.window_capacity());
        }
        None
    }

    fn record_failure(&self, probe: bool) -> Option<StateTransition> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if probe {
            let transition = self.open_from(CircuitState::HalfOpen);
            self.probe_in_flight.store(false, Ordering::Release);
            return transition;
        }
        if self.state() != CircuitState::Closed {
            return None;
        }
        window.record(false, self.window_capacity());
        if window.samples() >= self.config.minimum_samples
            && window.failure_rate() >= self.config.failure_rate_threshold
        {
            window.clear();
            return self.open_from(CircuitState::Closed);
        }
        None
    }

    fn release(&self, probe: bool) {
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }

    fn window_capacity(&self) -> usize {
        usize::try_from(self.config.window_size).unwrap_or(usize::MAX)
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "settle the guard with the call's outcome"]
pub struct CircuitGuard {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    transition: Option<StateTransition>,
    settled: bool,
}

impl CircuitGuard {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The OPEN to HALF_OPEN transition caused by admitting this call, if any.
    pub fn admission_transition(&self) -> Option<StateTransition> {
        self.transition
    }

    pub fn success(mut self) -> Option<StateTransition> {
        self.settled = true;
        self.breaker.record_success(self.probe)
    }

    pub fn failure(mut self) -> Option<StateTransition> {
        self.settled = true;
        self.breaker.record_failure(self.probe)
    }

    /// Releases the permit without counting the outcome.
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.release(self.probe);
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(minimum_samples: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_rate_threshold: 0.5,
            minimum_samples,
            window_size: 10,
            open_cooldown_ms: 1_000,
        }))
    }

    fn fail(breaker: &Arc<CircuitBreaker>) -> Option<StateTransition> {
        breaker.acquire().unwrap().failure()
    }

    fn succeed(breaker: &Arc<CircuitBreaker>) -> Option<StateTransition> {
        breaker.acquire().unwrap().success()
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_only_after_minimum_samples() {
        let cb = breaker(4);
        assert_eq!(fail(&cb), None);
        assert_eq!(fail(&cb), None);
        assert_eq!(succeed(&cb), None);
        assert_eq!(cb.state(), CircuitState::Closed);

        let transition = fail(&cb).unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(cb.acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_below_threshold() {
        let cb = breaker(4);
        for _ in 0..3 {
            succeed(&cb);
        }
        fail(&cb);
        for _ in 0..6 {
            succeed(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.samples, 10);
        assert_eq!(snapshot.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_forgets_old_outcomes() {
        let cb = breaker(10);
        for _ in 0..4 {
            fail(&cb);
        }
        for _ in 0..10 {
            succeed(&cb);
        }
        assert_eq!(cb.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_circuit() {
        let cb = breaker(1);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cb.acquire().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        let probe = cb.acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(
            probe.admission_transition(),
            Some(StateTransition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen
            })
        );

        // Only one probe at a time
        assert_eq!(
            cb.acquire().unwrap_err(),
            CircuitRejected {
                state: CircuitState::HalfOpen
            }
        );

        let transition = probe.success().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(cb.snapshot().samples, 0);
        assert!(cb.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_cooldown() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let transition = cb.acquire().unwrap().failure().unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.acquire().is_err());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_is_released() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        drop(cb.acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let probe = cb.acquire().unwrap();
        assert!(probe.is_probe());
        probe.ignore();
        assert!(cb.acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_ignored_while_open() {
        let cb = breaker(2);
        let slow = cb.acquire().unwrap();
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(slow.failure(), None);
        assert_eq!(cb.snapshot().samples, 0);
    }
}
