//! Conversions between stored run payloads and JSON values.

use serde_json::Value;

/// Stored form of a JSON payload.
pub fn encode(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// JSON view of stored bytes. Empty or unparsable payloads read as `null`.
pub fn decode(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}
