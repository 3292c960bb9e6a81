use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::idempotency::IdempotencyConfig;
use crate::outbox::OutboxConfig;
use crate::resilience::ResiliencePolicySet;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid(reason.into())
    }

    /// Prefixes an `Invalid` reason with the field path it came from.
    pub(crate) fn within(self, scope: &str) -> Self {
        match self {
            ConfigError::Invalid(reason) => ConfigError::Invalid(format!("{scope}: {reason}")),
            other => other,
        }
    }
}

/// Top-level configuration for all three components.
///
/// ```json
/// {
///   "idempotency": { "default_ttl_ms": 300000 },
///   "outbox": { "batch_size": 50, "max_attempts": 5, "use_circuit_breaker": true },
///   "resilience": {
///     "payments.charge": {
///       "timeout": { "timeout_ms": 2000 },
///       "retry": { "max_attempts": 3 }
///     }
///   }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReliabilityConfig {
    pub idempotency: IdempotencyConfig,
    pub outbox: OutboxConfig,
    /// Policy sets keyed by operation name.
    pub resilience: BTreeMap<String, ResiliencePolicySet>,
}

impl ReliabilityConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        info!(
            path = %path.display(),
            operations = config.resilience.len(),
            "Loaded reliability configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.idempotency
            .validate()
            .map_err(|e| e.within("idempotency"))?;
        self.outbox.validate().map_err(|e| e.within("outbox"))?;
        for (operation, policies) in &self.resilience {
            if operation.trim().is_empty() {
                return Err(ConfigError::invalid("resilience: operation name cannot be blank"));
            }
            policies
                .validate()
                .map_err(|e| e.within(&format!("resilience.{operation}")))?;
        }
        Ok(())
    }

    pub fn policies(&self, operation: &str) -> Option<&ResiliencePolicySet> {
        self.resilience.get(operation)
    }
}
