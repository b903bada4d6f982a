// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canonical JSON serialisation.
//!
//! One canonicaliser is used for both cache keys and journal idempotency
//! keys, which is what guarantees the two derivations agree.  Rules:
//!
//! - object keys are emitted in lexicographic order
//! - strings are trimmed of surrounding whitespace
//! - floats are rounded to 10 decimal places (drift from serialisation
//!   round-trips must not change a key)
//! - compact separators, no trailing whitespace
//!
//! The writer emits text directly instead of rebuilding a `serde_json::Map`
//! so the output is independent of whatever map ordering the enclosing
//! binary compiled `serde_json` with.

use serde_json::Value;

/// Serialise `value` to its canonical JSON form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => {
            // serde_json handles escaping; trimming happens first.
            out.push_str(&serde_json::to_string(s.trim()).expect("string serialises"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("key serialises"));
                out.push(':');
                write_value(out, v);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &serde_json::Number) {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return;
    }
    // Round floats to 10 decimal places.  Values that come out integral
    // after rounding still print with serde's shortest representation so
    // `2.0000000000001` and `2.0` agree.
    let f = n.as_f64().unwrap_or(0.0);
    let rounded = (f * 1e10).round() / 1e10;
    match serde_json::Number::from_f64(rounded) {
        Some(num) => out.push_str(&num.to_string()),
        None => out.push_str("null"),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted() {
        let a = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"query":"X","limit":5}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"limit":5,"query":"X"}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn strings_are_trimmed() {
        let a = json!({"q": "  X  "});
        let b = json!({"q": "X"});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn floats_round_to_ten_places() {
        let a = json!({"v": 0.30000000000004});
        let b = json!({"v": 0.3});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        // Differences above the precision floor survive.
        let c = json!({"v": 0.31});
        assert_ne!(canonical_json(&a), canonical_json(&c));
    }

    #[test]
    fn arrays_keep_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn integers_do_not_become_floats() {
        assert_eq!(canonical_json(&json!({"n": 5})), r#"{"n":5}"#);
        assert_eq!(canonical_json(&json!({"n": -5})), r#"{"n":-5}"#);
    }

    #[test]
    fn escaping_survives_canonicalisation() {
        let v = json!({"s": "line\nbreak \"quoted\""});
        let round: Value = serde_json::from_str(&canonical_json(&v)).unwrap();
        assert_eq!(round["s"], "line\nbreak \"quoted\"");
    }

    #[test]
    fn null_and_bool_literals() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(true)), "true");
        assert_eq!(canonical_json(&json!({"a": null})), r#"{"a":null}"#);
    }
}
