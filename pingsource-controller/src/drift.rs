//! One-directional comparison of desired against live state.
//!
//! Live objects carry fields this controller never sets: server defaults,
//! values injected by admission webhooks or other controllers. Only fields
//! that are set in the desired value take part in the comparison.

use serde_json::Value;

/// `true` if every field set in `desired` has the same value in `live`.
///
/// Unset means `null`, `false`, `0`, `""`, `[]` or `{}`. Arrays match when
/// `live` is at least as long and matches element-wise.
pub(crate) fn is_derivative(desired: &Value, live: &Value) -> bool {
    match desired {
        Value::Null => true,
        Value::Bool(false) => true,
        Value::Bool(true) => live == desired,
        Value::Number(n) => n.as_f64() == Some(0.0) || live == desired,
        Value::String(s) => s.is_empty() || live == desired,
        Value::Array(items) => {
            if items.is_empty() {
                return true;
            }
            match live {
                Value::Array(live_items) if live_items.len() >= items.len() => items
                    .iter()
                    .zip(live_items.iter())
                    .all(|(d, l)| is_derivative(d, l)),
                _ => false,
            }
        }
        Value::Object(fields) => {
            if fields.is_empty() {
                return true;
            }
            match live {
                Value::Object(live_fields) => fields
                    .iter()
                    .all(|(k, d)| is_derivative(d, live_fields.get(k).unwrap_or(&Value::Null))),
                _ => false,
            }
        }
    }
}

pub(crate) fn has_drifted(desired: &Value, live: &Value) -> bool {
    !is_derivative(desired, live)
}
