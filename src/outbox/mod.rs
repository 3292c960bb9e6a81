//! Transactional outbox relay: claim persisted messages, publish them, and
//! retry or dead-letter the ones that fail.

mod error;
mod message;
mod processor;
mod publisher;
mod repository;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use error::{OutboxError, PublishError};
pub use message::{ClaimLease, MessageId, MessageStatus, OutboxMessage};
pub use processor::{
    BatchReport, BreakerScope, OutboxConfig, OutboxMetrics, OutboxMetricsSnapshot,
    OutboxProcessor,
};
pub use publisher::{ChannelPublisher, OutboxPublisher};
pub use repository::{FailedAttempt, InMemoryOutboxRepository, OutboxRepository, QueueDepthSnapshot};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteOutboxRepository;
