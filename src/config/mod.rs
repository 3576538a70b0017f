//! Engine configuration.
//!
//! The engine reads one small settings document: how remote convergence is
//! retried, what happens when a node task fails, how long a build may take and
//! where key pools and logs live.
//!
//! # Module Structure
//!
//! - `loader`: reads and writes `EngineConfig` as JSON or TOML

pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::orchestrator::{FailurePolicy, RetryPolicy};

/// Engine-wide settings shared by every build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,

    /// Upper bound on a whole build or add-node operation
    pub build_timeout_secs: Option<u64>,

    /// Directory holding pre-generated key pools, one subdirectory per family
    pub key_pool_dir: Option<PathBuf>,

    pub log_dir: Option<PathBuf>,

    /// Pause after starting daemons before peering begins
    pub peering_delay_ms: u64,

    /// Node containers are named `<prefix><absolute index>`
    pub container_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            build_timeout_secs: None,
            key_pool_dir: None,
            log_dir: None,
            peering_delay_ms: 3000,
            container_prefix: "ledgerforge-node".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    pub fn peering_delay(&self) -> Duration {
        Duration::from_millis(self.peering_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.build_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "build_timeout_secs must be positive when set".to_string(),
            ));
        }
        if self.container_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "container_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.attempts, 10);
        assert_eq!(config.failure_policy, FailurePolicy::RunToCompletion);
        assert_eq!(config.peering_delay(), Duration::from_secs(3));
        assert!(config.build_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"failure_policy": "fail_fast", "build_timeout_secs": 90}"#).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.build_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(config.container_prefix, "ledgerforge-node");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = EngineConfig::default();
        config.retry.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));
    }
}
