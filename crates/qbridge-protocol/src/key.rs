//! Keys and key ordering.
//!
//! A valid key is a JSON number, a string, or an array whose elements are
//! all valid keys. Keys of different types order as number < string < array;
//! arrays compare element by element, shorter prefix first.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use thiserror::Error;

/// Key and key range errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key range: {0}")]
    InvalidRange(String),
}

fn type_rank(key: &JsonValue) -> Option<u8> {
    match key {
        JsonValue::Number(_) => Some(0),
        JsonValue::String(_) => Some(1),
        JsonValue::Array(items) => {
            if items.iter().all(is_valid_key) {
                Some(2)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Check whether a value can be used as a key.
pub fn is_valid_key(key: &JsonValue) -> bool {
    type_rank(key).is_some()
}

/// Fail with [`KeyError::InvalidKey`] unless `key` is a valid key.
pub fn validate_key(key: &JsonValue) -> Result<(), KeyError> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(KeyError::InvalidKey(key.to_string()))
    }
}

/// Compare two keys.
pub fn compare(a: &JsonValue, b: &JsonValue) -> Result<Ordering, KeyError> {
    let rank_a = type_rank(a).ok_or_else(|| KeyError::InvalidKey(a.to_string()))?;
    let rank_b = type_rank(b).ok_or_else(|| KeyError::InvalidKey(b.to_string()))?;
    if rank_a != rank_b {
        return Ok(rank_a.cmp(&rank_b));
    }
    Ok(compare_same_type(a, b))
}

fn compare_same_type(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Array(xs), JsonValue::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = match (type_rank(x), type_rank(y)) {
                    (Some(rx), Some(ry)) if rx != ry => rx.cmp(&ry),
                    _ => compare_same_type(x, y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => Ordering::Equal,
    }
}

/// Key wrapper with a total order, for ordered collections of validated keys.
#[derive(Debug, Clone)]
pub struct OrderedKey(JsonValue);

impl OrderedKey {
    /// Wrap a key after validating it.
    pub fn new(key: JsonValue) -> Result<Self, KeyError> {
        validate_key(&key)?;
        Ok(Self(key))
    }

    /// Borrow the wrapped key.
    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// Unwrap the key.
    pub fn into_json(self) -> JsonValue {
        self.0
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Both sides were validated on construction.
        compare(&self.0, &other.0).unwrap_or(Ordering::Equal)
    }
}
