//! Structured reply payloads.

use qbridge_common::{BridgeError, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schema::DatabaseMetadata;

/// Reply to `open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReply {
    #[serde(default)]
    pub old_version: u64,
    pub new_version: u64,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default)]
    pub metadata: Option<DatabaseMetadata>,
}

impl OpenReply {
    pub fn parse(value: JsonValue) -> Result<Self, BridgeError> {
        serde_json::from_value(value).codec_context("open reply")
    }
}

/// One record handed out by a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    pub key: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl CursorRecord {
    /// Primary key, falling back to the cursor key for store cursors.
    pub fn effective_primary_key(&self) -> JsonValue {
        self.primary_key.clone().unwrap_or_else(|| self.key.clone())
    }
}

/// Reply to one of the cursor-opening operations.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorOpened {
    /// The range was empty; no cursor exists.
    Empty,
    /// A cursor positioned on its first record.
    Positioned {
        cursor_id: String,
        record: CursorRecord,
    },
}

impl CursorOpened {
    /// Decode `{cursorId, key, value}`, or `{result: null}` / `{cursorId, result: null}` for an empty range.
    pub fn parse(value: JsonValue) -> Result<Self, BridgeError> {
        let obj = match value {
            JsonValue::Null => return Ok(CursorOpened::Empty),
            JsonValue::Object(obj) => obj,
            other => {
                return Err(BridgeError::codec(format!(
                    "cursor reply is not an object: {}",
                    other
                )))
            }
        };
        if matches!(obj.get("result"), Some(JsonValue::Null)) || !obj.contains_key("key") {
            return Ok(CursorOpened::Empty);
        }
        let cursor_id = match obj.get("cursorId") {
            Some(JsonValue::String(id)) => id.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            _ => return Ok(CursorOpened::Empty),
        };
        let record: CursorRecord =
            serde_json::from_value(JsonValue::Object(obj)).codec_context("cursor record")?;
        Ok(CursorOpened::Positioned { cursor_id, record })
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            CursorOpened::Empty => serde_json::json!({ "result": null }),
            CursorOpened::Positioned { cursor_id, record } => {
                let mut value = serde_json::to_value(record).unwrap_or(JsonValue::Null);
                if let JsonValue::Object(obj) = &mut value {
                    obj.insert("cursorId".into(), JsonValue::String(cursor_id.clone()));
                }
                value
            }
        }
    }
}

/// Reply to `cursorContinue`.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorStep {
    Done,
    Record(CursorRecord),
}

impl CursorStep {
    /// Decode `{done: true}` or `{done: false, key, value}`. `null` means done.
    pub fn parse(value: JsonValue) -> Result<Self, BridgeError> {
        match value {
            JsonValue::Null => Ok(CursorStep::Done),
            JsonValue::Object(obj) => {
                if obj.get("done").and_then(JsonValue::as_bool).unwrap_or(false) {
                    return Ok(CursorStep::Done);
                }
                let record: CursorRecord = serde_json::from_value(JsonValue::Object(obj))
                    .codec_context("cursor step")?;
                Ok(CursorStep::Record(record))
            }
            other => Err(BridgeError::codec(format!(
                "cursor step is not an object: {}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            CursorStep::Done => serde_json::json!({ "done": true }),
            CursorStep::Record(record) => {
                let mut value = serde_json::to_value(record).unwrap_or(JsonValue::Null);
                if let JsonValue::Object(obj) = &mut value {
                    obj.insert("done".into(), JsonValue::Bool(false));
                }
                value
            }
        }
    }
}

/// One row of an `importChunk` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRow {
    #[serde(default)]
    pub key: Option<JsonValue>,
    pub value: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_reply_defaults() {
        let reply = OpenReply::parse(json!({"newVersion": 1, "upgrade": true})).unwrap();
        assert_eq!(reply.old_version, 0);
        assert!(reply.upgrade);
        assert!(reply.metadata.is_none());
    }

    #[test]
    fn test_open_reply_missing_version_is_codec_error() {
        assert!(matches!(
            OpenReply::parse(json!({"upgrade": false})),
            Err(BridgeError::Codec(_))
        ));
    }

    #[test]
    fn test_cursor_opened_empty_forms() {
        assert_eq!(CursorOpened::parse(json!(null)).unwrap(), CursorOpened::Empty);
        assert_eq!(
            CursorOpened::parse(json!({"cursorId": "c1", "result": null})).unwrap(),
            CursorOpened::Empty
        );
    }

    #[test]
    fn test_cursor_opened_positioned() {
        let opened =
            CursorOpened::parse(json!({"cursorId": "c9", "key": "a", "value": {"x": 1}})).unwrap();
        match opened {
            CursorOpened::Positioned { cursor_id, record } => {
                assert_eq!(cursor_id, "c9");
                assert_eq!(record.effective_primary_key(), json!("a"));
                assert_eq!(record.value, Some(json!({"x": 1})));
            }
            CursorOpened::Empty => panic!("expected a positioned cursor"),
        }
    }

    #[test]
    fn test_cursor_step() {
        assert_eq!(CursorStep::parse(json!({"done": true})).unwrap(), CursorStep::Done);
        let step = CursorStep::parse(json!({"done": false, "key": 2, "primaryKey": "p", "value": 5}))
            .unwrap();
        match step {
            CursorStep::Record(record) => assert_eq!(record.effective_primary_key(), json!("p")),
            CursorStep::Done => panic!("expected a record"),
        }
        assert_eq!(CursorStep::Done.to_json(), json!({"done": true}));
    }
}
