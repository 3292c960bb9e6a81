use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid idempotency key: {0}")]
pub struct InvalidKey(pub String);

/// Validated idempotency key - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LENGTH: usize = 160;

    pub fn new(key: impl Into<String>) -> Result<Self, InvalidKey> {
        let key = key.into().trim().to_string(); // Store trimmed version
        Self::validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), InvalidKey> {
        if key.is_empty() {
            return Err(InvalidKey("key cannot be blank".into()));
        }
        let length = key.chars().count();
        if length > Self::MAX_LENGTH {
            return Err(InvalidKey(format!(
                "key has {length} characters, max {}",
                Self::MAX_LENGTH
            )));
        }
        Ok(())
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = InvalidKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for IdempotencyKey {
    type Error = InvalidKey;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_key_validation() {
        assert!(IdempotencyKey::new("order:123").is_ok());
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("a".repeat(160)).is_ok());
        assert!(IdempotencyKey::new("a".repeat(161)).is_err());
    }

    #[test]
    fn test_inner_characters_are_kept_verbatim() {
        let key = IdempotencyKey::new("tenant\tA\norder:1").unwrap();
        assert_eq!(key.as_str(), "tenant\tA\norder:1");
    }

    #[test]
    fn test_length_counts_characters() {
        assert!(IdempotencyKey::new("é".repeat(160)).is_ok());
    }

    #[test]
    fn test_key_trims_whitespace() {
        let key = IdempotencyKey::new("  order:123 \t").unwrap();
        assert_eq!(key.as_str(), "order:123");
        assert_eq!(key, IdempotencyKey::new("order:123").unwrap());
    }

    #[test]
    fn test_deserialize_validates() {
        let key: IdempotencyKey = serde_json::from_str(r#"" k-1 ""#).unwrap();
        assert_eq!(key.as_str(), "k-1");
        assert!(serde_json::from_str::<IdempotencyKey>(r#""  ""#).is_err());
    }

    proptest! {
        #[test]
        fn prop_surrounding_whitespace_is_ignored(core in "[a-z0-9:_-]{1,64}", pad in " {0,4}") {
            let padded = format!("{pad}{core}{pad}");
            let key = IdempotencyKey::new(padded).unwrap();
            prop_assert_eq!(key.as_str(), core.as_str());
        }
    }
}
