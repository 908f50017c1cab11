//! Redaction of secret-bearing values in result payloads.

use std::collections::HashSet;

use serde_json::Value;

/// Placeholder for a value whose key matches a registered secret name.
pub const MASKED: &str = "<masked>";

/// Placeholder for a value that could not be represented as JSON.
pub const FILTERED: &str = "<filtered: cannot json-serialize>";

/// Replace, at any depth, the value of every object key matching a
/// registered secret name. The payload shape is preserved; only matched
/// values are masked.
pub fn redact_value(value: &mut Value, secrets: &HashSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if secrets.contains(key) {
                    *entry = Value::String(MASKED.to_string());
                } else {
                    redact_value(entry, secrets);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item, secrets);
            }
        }
        _ => {}
    }
}
