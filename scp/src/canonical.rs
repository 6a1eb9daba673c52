//! Canonical JSON.
//!
//! Object keys are emitted in lexicographic order at every depth and no
//! whitespace is produced. Ticket digests are taken over this form, and the
//! hub compares a resubmitted quote against its stored copy in this form.
//! Ordering is done explicitly rather than relying on `serde_json`'s map
//! type, which changes when the `preserve_order` feature is enabled anywhere
//! in the dependency graph.

use serde::Serialize;
use serde_json::Value;

/// Renders a JSON value with recursively sorted object keys.
#[must_use]
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Serializes `value` and renders it canonically.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(stable_stringify(&serde_json::to_value(value)?))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorts_nested_keys_without_whitespace() {
        let value = json!({
            "totalDebit": "1003010",
            "amount": "1000000",
            "nested": { "z": 1, "a": [ { "y": true, "b": null } ] }
        });
        assert_eq!(
            stable_stringify(&value),
            r#"{"amount":"1000000","nested":{"a":[{"b":null,"y":true}],"z":1},"totalDebit":"1003010"}"#
        );
    }

    #[test]
    fn escapes_strings_like_json() {
        let value = json!({ "memo": "say \"hi\"\n" });
        assert_eq!(stable_stringify(&value), r#"{"memo":"say \"hi\"\n"}"#);
    }
}
