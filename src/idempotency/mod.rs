//! At-most-once execution per caller-supplied key.

mod coordinator;
mod key;
mod record;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;
mod store;

pub use coordinator::{
    IdempotencyConfig, IdempotencyCoordinator, IdempotencyError, IdempotencyMetrics,
    IdempotencyMetricsSnapshot, IdempotentOutcome,
};
pub use key::{IdempotencyKey, InvalidKey};
pub use record::{IdempotencyRecord, IdempotencyStatus};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteIdempotencyStore;
pub use store::{IdempotencyStore, InMemoryIdempotencyStore, StoreError};
