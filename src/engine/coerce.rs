//! Lenient coercion helpers for model output.
//!
//! Every LLM interaction is a typed request/response with strict coercion
//! on the way in: unknown fields are ignored, wrong types dropped, enums
//! defaulted. These helpers implement the "never trust model output" side
//! of that boundary.

use serde_json::Value;

/// Strips markdown code fences and surrounding whitespace from model
/// output, returning the inner JSON text.
#[must_use]
pub fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    }
}

/// Extracts a non-empty string field; numbers are stringified.
#[must_use]
pub fn field_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extracts an unsigned integer field; numeric strings are accepted.
#[must_use]
pub fn field_u32(value: &Value, key: &str) -> Option<u32> {
    match value.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extracts a float field clamped to `[0, 1]`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn field_unit_f32(value: &Value, key: &str) -> Option<f32> {
    let raw = match value.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some((raw as f32).clamp(0.0, 1.0))
}

/// Extracts a boolean field; `"true"`/`"false"` strings are accepted.
#[must_use]
pub fn field_bool(value: &Value, key: &str) -> Option<bool> {
    match value.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extracts an array of non-empty strings, dropping anything else.
#[must_use]
pub fn field_string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Extracts an array field's raw elements, or empty.
#[must_use]
pub fn field_array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}
