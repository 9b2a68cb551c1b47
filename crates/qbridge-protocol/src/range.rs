//! Key ranges and key-or-range queries.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

use crate::key::{compare, validate_key, KeyError};

/// A continuous interval over keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RangeWire", into = "RangeWire")]
pub struct KeyRange {
    lower: Option<JsonValue>,
    upper: Option<JsonValue>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: JsonValue) -> Result<Self, KeyError> {
        validate_key(&key)?;
        Ok(Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        })
    }

    /// Range of keys above `lower`.
    pub fn lower_bound(lower: JsonValue, open: bool) -> Result<Self, KeyError> {
        validate_key(&lower)?;
        Ok(Self {
            lower: Some(lower),
            upper: None,
            lower_open: open,
            upper_open: false,
        })
    }

    /// Range of keys below `upper`.
    pub fn upper_bound(upper: JsonValue, open: bool) -> Result<Self, KeyError> {
        validate_key(&upper)?;
        Ok(Self {
            lower: None,
            upper: Some(upper),
            lower_open: false,
            upper_open: open,
        })
    }

    /// Range of keys between `lower` and `upper`.
    pub fn bound(
        lower: JsonValue,
        upper: JsonValue,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self, KeyError> {
        match compare(&lower, &upper)? {
            Ordering::Greater => {
                return Err(KeyError::InvalidRange(format!(
                    "lower bound {} is greater than upper bound {}",
                    lower, upper
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(KeyError::InvalidRange(format!(
                    "equal bounds {} with an open side",
                    lower
                )))
            }
            _ => {}
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    pub fn lower(&self) -> Option<&JsonValue> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&JsonValue> {
        self.upper.as_ref()
    }

    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// Check whether `key` falls inside the range. Invalid keys never match.
    pub fn includes(&self, key: &JsonValue) -> bool {
        if let Some(lower) = &self.lower {
            match compare(lower, key) {
                Ok(Ordering::Less) => {}
                Ok(Ordering::Equal) if !self.lower_open => {}
                _ => return false,
            }
        }
        if let Some(upper) = &self.upper {
            match compare(key, upper) {
                Ok(Ordering::Less) => {}
                Ok(Ordering::Equal) if !self.upper_open => {}
                _ => return false,
            }
        }
        true
    }

    fn is_single_key(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(l), Some(u)) => {
                !self.lower_open && !self.upper_open && compare(l, u) == Ok(Ordering::Equal)
            }
            _ => false,
        }
    }
}

/// Wire shape: `{only}` | `{lower, lowerOpen}` | `{upper, upperOpen}` | all four bounds.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    only: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lower: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upper: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lower_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upper_open: Option<bool>,
}

impl From<RangeWire> for KeyRange {
    fn from(wire: RangeWire) -> Self {
        if let Some(only) = wire.only {
            return Self {
                lower: Some(only.clone()),
                upper: Some(only),
                lower_open: false,
                upper_open: false,
            };
        }
        Self {
            lower: wire.lower,
            upper: wire.upper,
            lower_open: wire.lower_open.unwrap_or(false),
            upper_open: wire.upper_open.unwrap_or(false),
        }
    }
}

impl From<KeyRange> for RangeWire {
    fn from(range: KeyRange) -> Self {
        if range.is_single_key() {
            return Self {
                only: range.lower,
                lower: None,
                upper: None,
                lower_open: None,
                upper_open: None,
            };
        }
        let lower_open = range.lower.as_ref().map(|_| range.lower_open);
        let upper_open = range.upper.as_ref().map(|_| range.upper_open);
        Self {
            only: None,
            lower: range.lower,
            upper: range.upper,
            lower_open,
            upper_open,
        }
    }
}

/// A single key or a key range.
///
/// On the wire a range is a JSON object and a key is anything else; keys are
/// never objects, so the two cannot collide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueryWire", into = "JsonValue")]
pub enum Query {
    Key(JsonValue),
    Range(KeyRange),
}

impl Query {
    /// Validate the key of a single-key query.
    pub fn validate(&self) -> Result<(), KeyError> {
        match self {
            Query::Key(key) => validate_key(key),
            Query::Range(_) => Ok(()),
        }
    }

    /// Check whether `key` matches the query.
    pub fn matches(&self, key: &JsonValue) -> bool {
        match self {
            Query::Key(k) => compare(k, key) == Ok(Ordering::Equal),
            Query::Range(range) => range.includes(key),
        }
    }
}

/// Raw form of a query as it arrives on the wire.
#[derive(Deserialize)]
#[serde(transparent)]
struct QueryWire(JsonValue);

impl TryFrom<QueryWire> for Query {
    type Error = String;

    fn try_from(QueryWire(value): QueryWire) -> Result<Self, Self::Error> {
        if value.is_object() {
            let range: KeyRange = serde_json::from_value(value).map_err(|e| e.to_string())?;
            Ok(Query::Range(range))
        } else {
            Ok(Query::Key(value))
        }
    }
}

impl From<Query> for JsonValue {
    fn from(query: Query) -> Self {
        match query {
            Query::Key(key) => key,
            Query::Range(range) => {
                serde_json::to_value(RangeWire::from(range)).unwrap_or(JsonValue::Null)
            }
        }
    }
}

impl From<KeyRange> for Query {
    fn from(range: KeyRange) -> Self {
        Query::Range(range)
    }
}

impl From<JsonValue> for Query {
    fn from(key: JsonValue) -> Self {
        Query::Key(key)
    }
}

impl From<&str> for Query {
    fn from(key: &str) -> Self {
        Query::Key(JsonValue::String(key.to_string()))
    }
}

impl From<i64> for Query {
    fn from(key: i64) -> Self {
        Query::Key(JsonValue::from(key))
    }
}
