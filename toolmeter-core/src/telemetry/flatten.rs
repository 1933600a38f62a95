use std::collections::HashMap;

use serde_json::Value;

use super::otlp::{AnyValue, KeyValue};

/// Flatten OTLP typed attributes into a string map.
///
/// Valueless entries and unsupported kinds (arrays, kvlists, bytes) are
/// dropped. When a key repeats, the first occurrence wins.
pub fn flatten_attributes(attrs: &[KeyValue]) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(attrs.len());
    for kv in attrs {
        if kv.key.is_empty() || out.contains_key(&kv.key) {
            continue;
        }
        if let Some(v) = kv.value.as_ref().and_then(any_value_to_string) {
            out.insert(kv.key.clone(), v);
        }
    }
    out
}

/// Scalar `AnyValue` as its plain string form, `None` for anything unusable.
pub fn any_value_to_string(value: &AnyValue) -> Option<String> {
    if let Some(Value::String(s)) = &value.string_value {
        return Some(s.clone());
    }
    if let Some(v) = &value.int_value {
        match v {
            Value::Number(n) if n.is_i64() || n.is_u64() => return Some(n.to_string()),
            Value::String(s) if s.trim().parse::<i64>().is_ok() => {
                return Some(s.trim().to_string());
            }
            _ => {}
        }
    }
    if let Some(Value::Bool(b)) = &value.bool_value {
        return Some(b.to_string());
    }
    if let Some(v) = &value.double_value {
        let parsed = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(d) = parsed.filter(|d| d.is_finite()) {
            return Some(d.to_string());
        }
    }
    None
}
