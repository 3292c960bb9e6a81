use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::error::OutboxError;
use super::message::{claim_order, ClaimLease, MessageId, MessageStatus, OutboxMessage};
use crate::clock::UnixTimeMs;

/// Outcome of a failed publish, decided by the processor and persisted as given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedAttempt {
    pub attempts: u32,
    /// Either `Failed` (retry later) or `Dead` (terminal).
    pub status: MessageStatus,
    pub next_attempt_at: Option<UnixTimeMs>,
    pub reason: String,
}

impl FailedAttempt {
    pub(crate) fn apply(&self, message: &mut OutboxMessage) -> Result<(), OutboxError> {
        if !matches!(self.status, MessageStatus::Failed | MessageStatus::Dead) {
            return Err(OutboxError::Validation(format!(
                "failed attempt cannot move message {} to {}",
                message.id, self.status
            )));
        }
        message.status = self.status;
        message.attempts = self.attempts;
        message.next_attempt_at = match self.status {
            MessageStatus::Failed => self.next_attempt_at,
            _ => None,
        };
        message.last_error = Some(self.reason.clone());
        message.claim = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepthSnapshot {
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
    pub published: usize,
    pub dead: usize,
    /// Non-terminal messages currently holding a claim, live or expired.
    pub claimed: usize,
    pub by_topic: BTreeMap<String, usize>,
}

impl QueueDepthSnapshot {
    pub(crate) fn count(&mut self, message: &OutboxMessage) {
        self.total += 1;
        match message.status {
            MessageStatus::Pending => self.pending += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Published => self.published += 1,
            MessageStatus::Dead => self.dead += 1,
        }
        if message.claim.is_some() && !message.is_terminal() {
            self.claimed += 1;
        }
        *self.by_topic.entry(message.topic.clone()).or_insert(0) += 1;
    }

    /// Messages that still need publishing.
    pub fn backlog(&self) -> usize {
        self.pending + self.failed
    }
}

/// Persistence port for outbox messages.
///
/// `claim_batch` must be atomic per message: two processors calling it
/// concurrently never receive the same message while its claim is live.
#[async_trait::async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stores a new PENDING message. Producers normally write these in their
    /// own transaction; this entry point serves in-process producers and tests.
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), OutboxError>;

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Claims up to `limit` due messages, ordered by priority descending then
    /// occurrence time ascending. Each returned message carries its claim.
    async fn claim_batch(
        &self,
        holder_id: &str,
        limit: usize,
        now: UnixTimeMs,
        lease_ms: u64,
    ) -> Result<Vec<OutboxMessage>, OutboxError>;

    async fn mark_published(
        &self,
        id: &MessageId,
        claim_token: &str,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError>;

    async fn mark_failed(
        &self,
        id: &MessageId,
        claim_token: &str,
        attempt: &FailedAttempt,
    ) -> Result<(), OutboxError>;

    /// Drops the claim without touching status or attempts.
    async fn release(&self, id: &MessageId, claim_token: &str) -> Result<(), OutboxError>;

    async fn queue_depth(&self) -> Result<QueueDepthSnapshot, OutboxError>;

    /// Deletes PUBLISHED messages published before `older_than`.
    async fn prune_published(&self, older_than: UnixTimeMs) -> Result<usize, OutboxError>;
}

pub(crate) fn validate_new_message(message: &OutboxMessage) -> Result<(), OutboxError> {
    if message.topic.trim().is_empty() {
        return Err(OutboxError::Validation(format!(
            "message {} has a blank topic",
            message.id
        )));
    }
    if message.status != MessageStatus::Pending || message.attempts != 0 {
        return Err(OutboxError::Validation(format!(
            "message {} must be enqueued as PENDING with no attempts",
            message.id
        )));
    }
    Ok(())
}

/// Process-local repository for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryOutboxRepository {
    messages: RwLock<HashMap<MessageId, OutboxMessage>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    fn claimed_mut<'a>(
        messages: &'a mut HashMap<MessageId, OutboxMessage>,
        id: &MessageId,
        claim_token: &str,
    ) -> Result<&'a mut OutboxMessage, OutboxError> {
        let message = messages.get_mut(id).ok_or(OutboxError::NotFound(*id))?;
        if !message.is_claimed_with(claim_token) {
            return Err(OutboxError::LeaseLost(*id));
        }
        Ok(message)
    }
}

#[async_trait::async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn enqueue(&self, message: OutboxMessage) -> Result<(), OutboxError> {
        validate_new_message(&message)?;
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(OutboxError::DuplicateMessage(message.id));
        }
        messages.insert(message.id, message);
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        holder_id: &str,
        limit: usize,
        now: UnixTimeMs,
        lease_ms: u64,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let mut messages = self.messages.write().await;

        let mut due: Vec<&mut OutboxMessage> = messages
            .values_mut()
            .filter(|message| message.is_claimable(now))
            .collect();
        due.sort_by(|a, b| claim_order(a, b));
        due.truncate(limit);

        let claimed: Vec<OutboxMessage> = due
            .into_iter()
            .map(|message| {
                message.claim = Some(ClaimLease::new(holder_id, now, lease_ms));
                message.clone()
            })
            .collect();

        debug!(claimed = claimed.len(), "Claimed outbox batch");
        Ok(claimed)
    }

    async fn mark_published(
        &self,
        id: &MessageId,
        claim_token: &str,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        let mut messages = self.messages.write().await;
        let message = Self::claimed_mut(&mut messages, id, claim_token)?;
        message.status = MessageStatus::Published;
        message.published_at = Some(now);
        message.next_attempt_at = None;
        message.claim = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &MessageId,
        claim_token: &str,
        attempt: &FailedAttempt,
    ) -> Result<(), OutboxError> {
        let mut messages = self.messages.write().await;
        let message = Self::claimed_mut(&mut messages, id, claim_token)?;
        attempt.apply(message)
    }

    async fn release(&self, id: &MessageId, claim_token: &str) -> Result<(), OutboxError> {
        let mut messages = self.messages.write().await;
        let message = Self::claimed_mut(&mut messages, id, claim_token)?;
        message.claim = None;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<QueueDepthSnapshot, OutboxError> {
        let messages = self.messages.read().await;
        let mut snapshot = QueueDepthSnapshot::default();
        for message in messages.values() {
            snapshot.count(message);
        }
        Ok(snapshot)
    }

    async fn prune_published(&self, older_than: UnixTimeMs) -> Result<usize, OutboxError> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, message| {
            !(message.status == MessageStatus::Published
                && message.published_at.is_some_and(|at| at < older_than))
        });
        Ok(before - messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    fn message(topic: &str, priority: i32, occurred_at: UnixTimeMs) -> OutboxMessage {
        OutboxMessage::new("Order", "123", "OrderPlaced", topic, b"{}".to_vec(), occurred_at)
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicates_and_blank_topics() {
        let repo = InMemoryOutboxRepository::new();
        let msg = message("orders", 0, make_now());
        repo.enqueue(msg.clone()).await.unwrap();

        let err = repo.enqueue(msg.clone()).await.unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateMessage(id) if id == msg.id));

        let err = repo.enqueue(message("  ", 0, make_now())).await.unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let repo = InMemoryOutboxRepository::new();
        let now = make_now();
        let oldest = message("orders", 0, now);
        let urgent = message("orders", 9, now.saturating_add_ms(50));
        let newest = message("orders", 0, now.saturating_add_ms(100));
        for msg in [newest.clone(), urgent.clone(), oldest.clone()] {
            repo.enqueue(msg).await.unwrap();
        }

        let batch = repo.claim_batch("w1", 2, now, 30_000).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![urgent.id, oldest.id]);
        assert!(batch.iter().all(|m| m.claim.as_ref().unwrap().is_held_by("w1")));

        // Already claimed messages are skipped until their lease expires.
        let rest = repo.claim_batch("w2", 10, now, 30_000).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, newest.id);

        let reclaimed = repo
            .claim_batch("w2", 10, now.saturating_add_ms(30_000), 30_000)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let repo = Arc::new(InMemoryOutboxRepository::new());
        let now = make_now();
        for i in 0..50 {
            repo.enqueue(message("orders", 0, now.saturating_add_ms(i)))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..5 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.claim_batch(&format!("w{worker}"), 20, now, 30_000)
                    .await
                    .unwrap()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for msg in handle.await.unwrap() {
                assert!(seen.insert(msg.id), "message {} claimed twice", msg.id);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn test_marks_require_current_claim() {
        let repo = InMemoryOutboxRepository::new();
        let now = make_now();
        let msg = message("orders", 0, now);
        repo.enqueue(msg.clone()).await.unwrap();

        let claimed = repo.claim_batch("w1", 1, now, 1_000).await.unwrap();
        let token = claimed[0].claim.as_ref().unwrap().token.clone();

        let err = repo.mark_published(&msg.id, "stale", now).await.unwrap_err();
        assert!(matches!(err, OutboxError::LeaseLost(_)));

        repo.mark_published(&msg.id, &token, now).await.unwrap();
        let stored = repo.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Published);
        assert_eq!(stored.published_at, Some(now));
        assert!(stored.claim.is_none());

        let missing = MessageId::generate();
        let err = repo.release(&missing, &token).await.unwrap_err();
        assert!(matches!(err, OutboxError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_failed_attempt_persisted_as_given() {
        let repo = InMemoryOutboxRepository::new();
        let now = make_now();
        let msg = message("orders", 0, now);
        repo.enqueue(msg.clone()).await.unwrap();
        let token = repo.claim_batch("w1", 1, now, 1_000).await.unwrap()[0]
            .claim
            .clone()
            .unwrap()
            .token;

        let attempt = FailedAttempt {
            attempts: 1,
            status: MessageStatus::Failed,
            next_attempt_at: Some(now.saturating_add_ms(200)),
            reason: "broker down".into(),
        };
        repo.mark_failed(&msg.id, &token, &attempt).await.unwrap();

        let stored = repo.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
        assert!(repo.claim_batch("w1", 1, now, 1_000).await.unwrap().is_empty());
        assert_eq!(
            repo.claim_batch("w1", 1, now.saturating_add_ms(200), 1_000)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_queue_depth_and_prune() {
        let repo = InMemoryOutboxRepository::new();
        let now = make_now();
        let published = message("orders", 0, now);
        repo.enqueue(published.clone()).await.unwrap();
        repo.enqueue(message("payments", 0, now.saturating_add_ms(1)))
            .await
            .unwrap();

        let token = repo.claim_batch("w1", 1, now, 1_000).await.unwrap()[0]
            .claim
            .clone()
            .unwrap()
            .token;
        repo.mark_published(&published.id, &token, now).await.unwrap();

        let depth = repo.queue_depth().await.unwrap();
        assert_eq!(depth.total, 2);
        assert_eq!(depth.published, 1);
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.backlog(), 1);
        assert_eq!(depth.by_topic.get("payments"), Some(&1));

        assert_eq!(repo.prune_published(now).await.unwrap(), 0);
        assert_eq!(repo.prune_published(now.saturating_add_ms(1)).await.unwrap(), 1);
        assert!(repo.get(&published.id).await.unwrap().is_none());
    }
}
