use thiserror::Error;

use super::message::MessageId;
use crate::config::ConfigError;
use crate::error::{truncate_utf8_safe, ErrorCategory, Retryable, MAX_ERROR_DESCRIPTOR_BYTES};

/// Delivery failure reported by an [`OutboxPublisher`](super::OutboxPublisher).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("publish failed ({category:?}): {message}")]
pub struct PublishError {
    pub category: ErrorCategory,
    pub message: String,
}

impl PublishError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, MAX_ERROR_DESCRIPTOR_BYTES);
        Self { category, message }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    /// A failure that no amount of retrying will fix, e.g. a rejected payload.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ClientError, message)
    }
}

impl Retryable for PublishError {
    fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("outbox store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("duplicate message: {0}")]
    DuplicateMessage(MessageId),

    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("claim on message {0} was lost")]
    LeaseLost(MessageId),

    #[error("corrupted message {id}: {reason}")]
    Corrupted { id: String, reason: String },

    #[error(transparent)]
    PublishFailure(#[from] PublishError),

    #[error("message {id} dead-lettered after {attempts} attempts")]
    DeadLettered { id: MessageId, attempts: u32 },
}

impl Retryable for OutboxError {
    fn is_retryable(&self) -> bool {
        match self {
            OutboxError::StoreUnavailable(_) => true,
            OutboxError::PublishFailure(error) => error.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_error_classification() {
        assert!(PublishError::transient("broker down").is_retryable());
        assert!(!PublishError::permanent("schema rejected").is_retryable());
        assert!(PublishError::new(ErrorCategory::RateLimited, "slow down").is_retryable());
    }

    #[test]
    fn test_publish_error_message_is_bounded() {
        let error = PublishError::transient("x".repeat(MAX_ERROR_DESCRIPTOR_BYTES * 2));
        assert_eq!(error.message.len(), MAX_ERROR_DESCRIPTOR_BYTES);
    }

    #[test]
    fn test_outbox_error_retryability() {
        assert!(OutboxError::StoreUnavailable("io".into()).is_retryable());
        assert!(!OutboxError::LeaseLost(MessageId::generate()).is_retryable());
        assert!(!OutboxError::DeadLettered {
            id: MessageId::generate(),
            attempts: 3
        }
        .is_retryable());
    }
}
