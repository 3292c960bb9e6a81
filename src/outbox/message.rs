use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::clock::UnixTimeMs;

/// Identifier of an outbox message, assigned by the producing transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Published,
    Failed,
    Dead,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Published,
        MessageStatus::Failed,
        MessageStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Published => "PUBLISHED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Dead => "DEAD",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Published | MessageStatus::Dead)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease token proving which processor currently owns a claimed message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimLease {
    pub token: String,
    pub holder_id: String,
    pub acquired_at: UnixTimeMs,
    pub expires_at: UnixTimeMs,
}

impl ClaimLease {
    pub fn new(holder_id: impl Into<String>, now: UnixTimeMs, duration_ms: u64) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now.saturating_add_ms(duration_ms),
        }
    }

    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }
}

/// A message persisted by the producing transaction, awaiting publication.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub occurred_at: UnixTimeMs,
    pub status: MessageStatus,
    pub attempts: u32,
    /// Higher values are claimed first.
    #[serde(default)]
    pub priority: i32,
    /// Earliest time a FAILED message may be claimed again.
    #[serde(default)]
    pub next_attempt_at: Option<UnixTimeMs>,
    #[serde(default)]
    pub published_at: Option<UnixTimeMs>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub claim: Option<ClaimLease>,
}

impl OutboxMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        occurred_at: UnixTimeMs,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            topic: topic.into(),
            payload: payload.into(),
            headers: BTreeMap::new(),
            occurred_at,
            status: MessageStatus::Pending,
            attempts: 0,
            priority: 0,
            next_attempt_at: None,
            published_at: None,
            last_error: None,
            claim: None,
        }
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a processor may claim this message at `now`.
    pub fn is_claimable(&self, now: UnixTimeMs) -> bool {
        let due = match self.status {
            MessageStatus::Pending => true,
            MessageStatus::Failed => self.next_attempt_at.map_or(true, |at| at <= now),
            MessageStatus::Published | MessageStatus::Dead => false,
        };
        due && self.claim.as_ref().map_or(true, |lease| lease.is_expired(now))
    }

    /// Whether `token` is the most recent claim on this message.
    ///
    /// An expired claim still counts until another processor replaces it.
    pub fn is_claimed_with(&self, token: &str) -> bool {
        self.claim.as_ref().is_some_and(|lease| lease.token == token)
    }
}

/// Claim order: priority descending, then occurrence time ascending.
pub(crate) fn claim_order(a: &OutboxMessage, b: &OutboxMessage) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.occurred_at.cmp(&b.occurred_at))
        .then_with(|| a.id.cmp(&b.id))
}
