//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::BridgeError;

/// Service name the native side registers its database handlers under.
pub const DEFAULT_TARGET: &str = "QBridgePlugin";

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Service every envelope is addressed to
    pub target: String,

    /// Per-call reply timeout in milliseconds (none = wait forever)
    pub call_timeout_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            call_timeout_ms: None,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration blob.
    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
        if config.target.is_empty() {
            return Err(BridgeError::Config("target must not be empty".to_string()));
        }
        Ok(config)
    }

    /// Set the service target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Per-call timeout, if one is configured.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.target, "QBridgePlugin");
        assert_eq!(config.call_timeout(), None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = BridgeConfig::from_json(r#"{"callTimeoutMs": 250}"#).unwrap();
        assert_eq!(config.target, DEFAULT_TARGET);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_from_json_rejects_empty_target() {
        let err = BridgeConfig::from_json(r#"{"target": ""}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            BridgeConfig::from_json("not json"),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = BridgeConfig::default()
            .with_target("Db")
            .with_call_timeout(Duration::from_secs(2));
        assert_eq!(config.target, "Db");
        assert_eq!(config.call_timeout_ms, Some(2000));
    }
}
