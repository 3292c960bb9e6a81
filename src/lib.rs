//! Reliable execution primitives for services that call side-effecting
//! operations under concurrency and partial failure.
//!
//! - [`idempotency`]: run an action at most once per caller-supplied key.
//! - [`outbox`]: relay persisted messages to a broker with bounded retry and
//!   dead-lettering.
//! - [`resilience`]: wrap calls in cache, circuit breaker, bulkhead, rate
//!   limiter, timeout and retry policies, applied in that order.
//!
//! All three talk to the outside world only through async ports
//! ([`IdempotencyStore`], [`OutboxRepository`], [`OutboxPublisher`],
//! [`TelemetrySink`]). In-memory and SQLite adapters ship with the crate.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod outbox;
pub mod resilience;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use backoff::ExponentialBackoff;
pub use clock::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use config::{ConfigError, ReliabilityConfig};
pub use error::{ErrorCategory, Retryable};
pub use idempotency::{
    IdempotencyConfig, IdempotencyCoordinator, IdempotencyError, IdempotencyKey, IdempotencyStore,
    IdempotentOutcome, InMemoryIdempotencyStore,
};
pub use outbox::{
    BatchReport, InMemoryOutboxRepository, MessageStatus, OutboxConfig, OutboxError,
    OutboxMessage, OutboxProcessor, OutboxPublisher, OutboxRepository, PublishError,
};
pub use resilience::{
    FallbackStrategy, FailureKind, ResilienceError, ResilienceExecutor, ResiliencePolicySet,
    TelemetrySink,
};
