//! Request envelopes and correlated replies.

use qbridge_common::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Identifier pairing a reply with the call that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb{}", self.0)
    }
}

/// One call on its way to the remote engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Service the call is addressed to.
    pub target: String,
    /// Operation name.
    pub operation: String,
    /// Positional arguments.
    pub arguments: Vec<JsonValue>,
    /// Correlation id echoed by the reply.
    pub correlation_id: CorrelationId,
}

/// The single answer to an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn success(correlation_id: CorrelationId, result: JsonValue) -> Self {
        Self {
            correlation_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse the reply into its outcome. A missing result reads as `null`.
    pub fn into_outcome(self) -> Result<JsonValue, BridgeError> {
        match self.error {
            Some(message) => Err(BridgeError::Remote(message)),
            None => Ok(self.result.unwrap_or(JsonValue::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            target: "QBridgePlugin".into(),
            operation: "get".into(),
            arguments: vec![json!("Notes"), json!("items"), json!("a")],
            correlation_id: CorrelationId::new(7),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "target": "QBridgePlugin",
                "operation": "get",
                "arguments": ["Notes", "items", "a"],
                "correlationId": 7
            })
        );
    }

    #[test]
    fn test_reply_outcomes() {
        let ok: Reply = serde_json::from_value(json!({"correlationId": 1, "result": "OK"})).unwrap();
        assert_eq!(ok.into_outcome().unwrap(), json!("OK"));

        let empty: Reply = serde_json::from_value(json!({"correlationId": 2})).unwrap();
        assert_eq!(empty.into_outcome().unwrap(), JsonValue::Null);

        let err = Reply::failure(CorrelationId::new(3), "Store not found");
        assert!(matches!(err.into_outcome(), Err(BridgeError::Remote(m)) if m == "Store not found"));
    }

    #[test]
    fn test_correlation_display() {
        assert_eq!(CorrelationId::new(12).to_string(), "cb12");
    }
}
