use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::policy::BulkheadConfig;

/// Bounds concurrent in-flight calls for one operation.
#[derive(Debug)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    max_permits: usize,
    max_wait: Duration,
}

/// Returned when no permit became free within the configured wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadFull {
    pub max_concurrent: usize,
}

impl Bulkhead {
    pub fn new(config: &BulkheadConfig) -> Self {
        let max_permits = usize::try_from(config.permits).unwrap_or(usize::MAX);
        Self {
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            max_wait: config.max_wait(),
        }
    }

    /// Takes a permit, held until the returned value is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        let rejected = BulkheadFull {
            max_concurrent: self.max_permits,
        };
        if self.max_wait.is_zero() {
            return Arc::clone(&self.permits)
                .try_acquire_owned()
                .map_err(|_| rejected);
        }
        match tokio::time::timeout(self.max_wait, Arc::clone(&self.permits).acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(rejected),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_permits.saturating_sub(self.available())
    }
}
