use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_to_ms(duration)))
    }

    pub fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: UnixTimeMs) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

pub(crate) fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Source of wall-clock time for persisted timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(duration_to_ms(by), Ordering::SeqCst);
    }

    pub fn set(&self, to: UnixTimeMs) {
        self.now_ms.store(to.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_arithmetic() {
        let t = UnixTimeMs(u64::MAX - 5);
        assert_eq!(t.saturating_add_ms(10), UnixTimeMs(u64::MAX));
        assert_eq!(UnixTimeMs(3).saturating_sub_ms(10), UnixTimeMs(0));
        assert_eq!(
            UnixTimeMs(1_000).saturating_add(Duration::from_secs(2)),
            UnixTimeMs(3_000)
        );
    }

    #[test]
    fn test_since_never_negative() {
        assert_eq!(UnixTimeMs(10).since(UnixTimeMs(50)), Duration::ZERO);
        assert_eq!(
            UnixTimeMs(50).since(UnixTimeMs(10)),
            Duration::from_millis(40)
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(UnixTimeMs(1_700_000_000_000));
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), UnixTimeMs(1_700_000_001_000));
        clock.set(UnixTimeMs(5));
        assert_eq!(clock.now(), UnixTimeMs(5));
    }
}
