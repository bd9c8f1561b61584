//! Transport messages and the minimal payload contract.
//!
//! A value-bearing payload is a JSON object carrying at least a value and a
//! timestamp. All other keys are passed through to the leaf node as
//! attributes, flattened so that every attribute value is a primitive. An
//! empty payload marks a structural-only message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SyncError;

pub const DEFAULT_VALUE_KEY: &str = "value";
pub const DEFAULT_TIMESTAMP_KEY: &str = "timestamp";
const FLATTEN_JOINER: &str = "_";

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One message as delivered by the transport. Consumed by the pipeline and
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub path: String,
    pub payload: Vec<u8>,
    /// Arrival time, epoch milliseconds.
    pub received_at: i64,
    pub client_id: Option<String>,
}

impl Message {
    pub fn new<P: Into<String>, B: Into<Vec<u8>>>(path: P, payload: B) -> Message {
        Message {
            path: path.into(),
            payload: payload.into(),
            received_at: now_millis(),
            client_id: None,
        }
    }

    pub fn structural<P: Into<String>>(path: P) -> Message {
        Message::new(path, Vec::new())
    }

    pub fn with_received_at(mut self, received_at: i64) -> Message {
        self.received_at = received_at;
        self
    }

    pub fn with_client_id<S: Into<String>>(mut self, client_id: S) -> Message {
        self.client_id = Some(client_id.into());
        self
    }
}

/// A validated value-bearing payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub value: Value,
    /// Source timestamp used for last-write-wins ordering.
    pub timestamp: i64,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRules {
    pub value_key: String,
    pub timestamp_key: String,
    /// Top level keys dropped before the attributes reach the store.
    pub ignored_attributes: Vec<String>,
}

impl Default for PayloadRules {
    fn default() -> Self {
        PayloadRules {
            value_key: DEFAULT_VALUE_KEY.to_string(),
            timestamp_key: DEFAULT_TIMESTAMP_KEY.to_string(),
            ignored_attributes: Vec::new(),
        }
    }
}

impl PayloadRules {
    /// Validate a raw payload. `Ok(None)` means the message is structural-only.
    pub fn parse(&self, raw: &[u8]) -> Result<Option<Payload>, SyncError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let parsed: Value = serde_json::from_slice(raw).map_err(|e| {
            SyncError::PayloadValidation(format!("payload is not valid JSON: {e}"))
        })?;
        let Value::Object(mut object) = parsed else {
            return Err(SyncError::PayloadValidation(
                "payload must be a JSON object".to_string(),
            ));
        };

        let value = object.remove(&self.value_key).ok_or_else(|| {
            SyncError::PayloadValidation(format!("missing required field '{}'", self.value_key))
        })?;
        let timestamp = object
            .remove(&self.timestamp_key)
            .ok_or_else(|| {
                SyncError::PayloadValidation(format!(
                    "missing required field '{}'",
                    self.timestamp_key
                ))
            })
            .and_then(|ts| self.timestamp_from(&ts))?;

        for ignored in self.ignored_attributes.iter() {
            object.remove(ignored);
        }

        Ok(Some(Payload {
            value,
            timestamp,
            attributes: flatten_attributes(object),
        }))
    }

    fn timestamp_from(&self, raw: &Value) -> Result<i64, SyncError> {
        let invalid = || {
            SyncError::PayloadValidation(format!(
                "field '{}' must be a finite number, got {raw}",
                self.timestamp_key
            ))
        };
        match raw {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(ts), _) => Ok(ts),
                (None, Some(ts)) if ts.is_finite() => Ok(ts as i64),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// Flatten nested objects and arrays into a single level map. Nested keys are
/// joined with `_`; array items are suffixed with their index.
///
/// `{"b": [1, 2], "c": {"k": "v"}}` becomes `{"b_0": 1, "b_1": 2, "c_k": "v"}`.
pub fn flatten_attributes(attributes: Map<String, Value>) -> Map<String, Value> {
    let mut flat = Map::new();
    for (key, value) in attributes {
        flatten_into(&mut flat, key, value);
    }
    flat
}

fn flatten_into(flat: &mut Map<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(children) => {
            for (child_key, child) in children {
                flatten_into(flat, format!("{key}{FLATTEN_JOINER}{child_key}"), child);
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.into_iter().enumerate() {
                flatten_into(flat, format!("{key}{FLATTEN_JOINER}{idx}"), item);
            }
        }
        primitive => {
            flat.insert(key, primitive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_empty_payload_is_structural() {
        let rules = PayloadRules::default();
        assert_eq!(rules.parse(b"").unwrap(), None);
        assert_eq!(rules.parse(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_value_payload() {
        let rules = PayloadRules::default();
        let payload = rules
            .parse(br#"{"value": 72.5, "timestamp": 100, "unit": "F"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(payload.value, json!(72.5));
        assert_eq!(payload.timestamp, 100);
        assert_eq!(payload.attributes, as_map(json!({"unit": "F"})));
    }

    #[test]
    fn test_float_timestamp_truncates() {
        let rules = PayloadRules::default();
        let payload = rules
            .parse(br#"{"value": 1, "timestamp": 1486144502122.7}"#)
            .unwrap()
            .unwrap();
        assert_eq!(payload.timestamp, 1486144502122);
    }

    #[test]
    fn test_invalid_payloads() {
        let rules = PayloadRules::default();
        let cases: [&[u8]; 5] = [
            b"not json",
            br#"[1, 2, 3]"#,
            br#"{"timestamp": 1}"#,
            br#"{"value": 1}"#,
            br#"{"value": 1, "timestamp": "yesterday"}"#,
        ];
        for raw in cases {
            let res = rules.parse(raw);
            assert!(
                matches!(res, Err(SyncError::PayloadValidation(_))),
                "{:?} should fail validation, got {res:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_custom_keys_and_ignored_attributes() {
        let rules = PayloadRules {
            value_key: "v".to_string(),
            timestamp_key: "ts".to_string(),
            ignored_attributes: vec!["secret".to_string()],
        };
        let payload = rules
            .parse(br#"{"v": "on", "ts": 7, "secret": "x", "site": "north"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(payload.value, json!("on"));
        assert_eq!(payload.timestamp, 7);
        assert_eq!(payload.attributes, as_map(json!({"site": "north"})));
    }

    #[test]
    fn test_flatten_attributes() {
        let nested = as_map(json!({
            "a": "value1",
            "l1": {
                "l2": {"l3k1": "va1", "l3k2": [10, 12], "l3k3": 3.141},
                "l2kb": 100
            }
        }));
        let expected = as_map(json!({
            "a": "value1",
            "l1_l2_l3k1": "va1",
            "l1_l2_l3k2_0": 10,
            "l1_l2_l3k2_1": 12,
            "l1_l2_l3k3": 3.141,
            "l1_l2kb": 100
        }));
        assert_eq!(flatten_attributes(nested), expected);
        assert_eq!(flatten_attributes(Map::new()), Map::new());
    }
}
