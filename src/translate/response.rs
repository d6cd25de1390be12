//! One-shot rewriting of a complete (non-streaming) chat completion body.

use super::reasoning::ReasoningFormat;
use crate::error::{ProxyError, Result};
use crate::logging::truncate;
use serde_json::Value;

/// Parse an upstream body and rewrite every `choices[i].message`.
///
/// Unlike the streaming path there is nothing partial to salvage, so a body
/// that is not JSON fails the request.
pub fn rewrite_response_body(format: ReasoningFormat, body: &[u8]) -> Result<Value> {
    let mut payload: Value = serde_json::from_slice(body).map_err(|e| {
        ProxyError::translation(format!(
            "Failed to parse upstream response: {}. Body: {}",
            e,
            truncate(&String::from_utf8_lossy(body), 300)
        ))
    })?;
    format.apply_to_payload(&mut payload);
    Ok(payload)
}

/// Wrap an upstream error body for the caller, keeping it as-is when it is
/// already JSON.
pub fn upstream_error_body(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => serde_json::json!({ "error": String::from_utf8_lossy(body).trim() }),
    }
}
