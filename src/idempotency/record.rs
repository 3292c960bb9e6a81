use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::IdempotencyKey;
use crate::clock::UnixTimeMs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "IN_PROGRESS",
            IdempotencyStatus::Completed => "COMPLETED",
            IdempotencyStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IN_PROGRESS" => Some(IdempotencyStatus::InProgress),
            "COMPLETED" => Some(IdempotencyStatus::Completed),
            "FAILED" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

/// Ownership record for one idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub status: IdempotencyStatus,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub expires_at: UnixTimeMs,
    pub result_ref: Option<String>,
    pub last_error: Option<String>,
}

impl IdempotencyRecord {
    pub fn in_progress(key: IdempotencyKey, now: UnixTimeMs, ttl: Duration) -> Self {
        Self {
            key,
            status: IdempotencyStatus::InProgress,
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(ttl),
            result_ref: None,
            last_error: None,
        }
    }

    /// Expiry supersedes status for acquisition purposes.
    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        now > self.expires_at
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_strictly_after_deadline() {
        let now = UnixTimeMs(1_700_000_000_000);
        let key = IdempotencyKey::new("k").unwrap();
        let record = IdempotencyRecord::in_progress(key, now, Duration::from_secs(60));

        assert_eq!(record.expires_at, UnixTimeMs(now.0 + 60_000));
        assert!(!record.is_expired(record.expires_at));
        assert!(record.is_expired(record.expires_at.saturating_add_ms(1)));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            IdempotencyStatus::InProgress,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IdempotencyStatus::parse("DONE"), None);
    }
}
