// Message Normalization
// Coerces arbitrary nested wire payloads into plain strings before they
// enter application state.

use serde_json::Value;

/// Wire fields that must be plain strings once a record enters the engine.
const TEXT_FIELDS: [&str; 3] = ["content", "output", "message"];

/// Keys probed on objects that are supposed to carry textual content.
const TEXT_KEYS: [&str; 3] = ["text", "content", "value"];

/// Coerce any JSON value into a string.
///
/// Strings pass through, numbers/bools are stringified, null becomes the
/// empty string, objects are probed for conventional text keys, arrays are
/// joined recursively. Anything else falls back to its JSON serialization.
pub fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(coerce_text).collect();
            parts
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Object(map) => {
            for key in TEXT_KEYS {
                if let Some(inner) = map.get(key) {
                    return coerce_text(inner);
                }
            }
            serde_json::to_string(value).unwrap_or_else(|_| format!("{value}"))
        }
    }
}

/// Normalize the textual fields of an inbound wire record in place.
///
/// Fields that are already plain strings are left untouched (no
/// reallocation); everything else is rewritten through [`coerce_text`].
pub fn normalize_record(record: &mut Value) {
    let Some(map) = record.as_object_mut() else {
        return;
    };
    for field in TEXT_FIELDS {
        let Some(value) = map.get(field) else {
            continue;
        };
        if value.is_string() {
            continue;
        }
        let text = coerce_text(value);
        map.insert(field.to_string(), Value::String(text));
    }
}

// ============================================================================
// Tests
// ============================================================================
