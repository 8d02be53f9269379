//! JSON text codec for values crossing the engine boundary.
//!
//! Payloads and result values travel as JSON text. An absent or empty payload
//! decodes to `null`.

use serde_json::Value;

use crate::error::PayloadError;

/// Encode a native value as JSON text.
pub fn encode(value: &Value) -> Result<String, PayloadError> {
    serde_json::to_string(value).map_err(PayloadError::Encode)
}

/// Decode JSON text into a native value.
pub fn decode(text: &str) -> Result<Value, PayloadError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(PayloadError::Decode)
}

/// Decode an optional serialized value; `None` is `null`.
pub fn decode_opt(text: Option<&str>) -> Result<Value, PayloadError> {
    match text {
        Some(text) => decode(text),
        None => Ok(Value::Null),
    }
}

/// Decode a value reported by the scheduler. Text that is not valid JSON is
/// surfaced as a string rather than dropped.
pub fn decode_lenient(text: Option<&str>) -> Value {
    match decode_opt(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable work value, passing through as text");
            Value::String(text.unwrap_or_default().to_string())
        }
    }
}
