use rand::Rng;
use std::time::Duration;

use crate::config::ConfigError;

/// Exponential backoff schedule: `min(initial * multiplier^attempt, max)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl ExponentialBackoff {
    /// Upper bound on the random jitter, as a fraction of the computed delay.
    pub const MAX_JITTER_FRACTION: f64 = 0.1;

    pub fn new(initial_ms: u64, multiplier: f64, max_ms: u64) -> Result<Self, ConfigError> {
        let backoff = Self {
            initial_ms,
            multiplier,
            max_ms,
        };
        backoff.validate()?;
        Ok(backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(ConfigError::invalid("initial backoff must be > 0"));
        }
        if self.max_ms == 0 {
            return Err(ConfigError::invalid("max backoff must be > 0"));
        }
        if self.max_ms < self.initial_ms {
            return Err(ConfigError::invalid(format!(
                "max backoff ({}ms) must be >= initial backoff ({}ms)",
                self.max_ms, self.initial_ms
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(ConfigError::invalid(format!(
                "backoff multiplier must be a finite value > 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay in milliseconds after `attempt` failures.
    ///
    /// Non-decreasing in `attempt` and never above `max_ms`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_ms as f64 * self.multiplier.powi(exponent);
        if !raw.is_finite() || raw >= self.max_ms as f64 {
            return self.max_ms;
        }
        (raw as u64).min(self.max_ms)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    /// Delay with up to ten percent of random jitter added on top, still capped at `max_ms`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_ms(attempt);
        let spread = (base as f64 * Self::MAX_JITTER_FRACTION) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_schedule_doubles_then_caps() {
        let backoff = ExponentialBackoff::new(100, 2.0, 1_000).unwrap();
        assert_eq!(backoff.delay_ms(0), 100);
        assert_eq!(backoff.delay_ms(1), 200);
        assert_eq!(backoff.delay_ms(2), 400);
        assert_eq!(backoff.delay_ms(3), 800);
        assert_eq!(backoff.delay_ms(4), 1_000);
        assert_eq!(backoff.delay_ms(u32::MAX), 1_000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ExponentialBackoff::new(0, 2.0, 1_000).is_err());
        assert!(ExponentialBackoff::new(100, 1.0, 1_000).is_err());
        assert!(ExponentialBackoff::new(100, f64::NAN, 1_000).is_err());
        assert!(ExponentialBackoff::new(100, f64::INFINITY, 1_000).is_err());
        assert!(ExponentialBackoff::new(100, 2.0, 50).is_err());
        assert!(ExponentialBackoff::new(100, 2.0, 0).is_err());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(1_000, 2.0, 60_000).unwrap();
        for _ in 0..100 {
            let delay = backoff.jittered_delay(1).as_millis();
            assert!((2_000..=2_200).contains(&delay));
        }
        assert_eq!(backoff.jittered_delay(30).as_millis(), 60_000);
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_capped(
            initial in 1u64..10_000,
            multiplier in 1.01f64..10.0,
            extra in 0u64..1_000_000,
            attempt in 0u32..200,
        ) {
            let backoff = ExponentialBackoff::new(initial, multiplier, initial + extra).unwrap();
            let current = backoff.delay_ms(attempt);
            let next = backoff.delay_ms(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next <= backoff.max_ms);
            prop_assert!(current >= initial.min(backoff.max_ms));
        }
    }
}
