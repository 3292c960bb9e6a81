use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

use super::policy::RateLimiterConfig;

/// Fixed-window limiter: `limit` admissions per window, refilled in full when
/// the window rolls over.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Semaphore,
    refill_every: Duration,
    last_refill: RwLock<Instant>,
    max_permits: usize,
    max_wait: Duration,
}

/// Returned when no slot opened within the configured wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    pub limit: usize,
    pub window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimiterConfig) -> Self {
        let max_permits = usize::try_from(config.limit).unwrap_or(usize::MAX);
        Self {
            permits: Semaphore::new(max_permits),
            refill_every: config.window(),
            last_refill: RwLock::new(Instant::now()),
            max_permits,
            max_wait: config.max_wait(),
        }
    }

    /// Admits one call, waiting at most `max_wait` for the next window.
    pub async fn acquire(&self) -> Result<(), RateLimitExceeded> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let next_refill = self.maybe_refill().await;
            if let Ok(permit) = self.permits.try_acquire() {
                // Admissions are consumed, only a refill gives them back
                permit.forget();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline || next_refill > deadline {
                return Err(RateLimitExceeded {
                    limit: self.max_permits,
                    window: self.refill_every,
                });
            }
            tokio::time::sleep_until(next_refill).await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.permits.available_permits()
    }

    /// Refills the window if it has rolled over; returns when the next refill is due.
    async fn maybe_refill(&self) -> Instant {
        let mut last = self.last_refill.write().await;
        if last.elapsed() >= self.refill_every {
            let available = self.permits.available_permits();
            let to_add = self.max_permits.saturating_sub(available);
            self.permits.add_permits(to_add);
            *last = Instant::now();
        }
        *last + self.refill_every
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window_ms: u64, max_wait_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimiterConfig {
            limit,
            window_ms,
            max_wait_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_per_window() {
        let limiter = limiter(2, 1_000, 0);
        assert!(limiter.acquire().await.is_ok());
        assert!(limiter.acquire().await.is_ok());
        assert_eq!(limiter.remaining(), 0);
        assert!(limiter.acquire().await.is_err());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(limiter.acquire().await.is_ok());
        assert_eq!(limiter.remaining(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_next_window_within_max_wait() {
        let limiter = limiter(1, 200, 500);
        limiter.acquire().await.unwrap();

        let started = Instant::now();
        assert!(limiter.acquire().await.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_when_window_is_beyond_max_wait() {
        let limiter = limiter(1, 1_000, 100);
        limiter.acquire().await.unwrap();

        let started = Instant::now();
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err.limit, 1);
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
