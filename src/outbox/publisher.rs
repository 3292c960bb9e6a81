use tokio::sync::mpsc;

use super::error::PublishError;
use super::message::OutboxMessage;
use crate::error::ErrorCategory;

/// Delivers a claimed message to its downstream broker.
#[async_trait::async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError>;
}

/// In-process publisher that forwards messages onto a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::Sender<OutboxMessage>,
}

impl ChannelPublisher {
    pub fn new(sender: mpsc::Sender<OutboxMessage>) -> Self {
        Self { sender }
    }

    /// Creates a publisher with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboxMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait::async_trait]
impl OutboxPublisher for ChannelPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        self.sender.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::new(
                ErrorCategory::RateLimited,
                format!("channel for topic {} is full", message.topic),
            ),
            mpsc::error::TrySendError::Closed(_) => PublishError::new(
                ErrorCategory::NetworkError,
                format!("channel for topic {} is closed", message.topic),
            ),
        })
    }
}
