//! Deterministic content hashing of job inputs.
//!
//! Two jobs with semantically equal inputs must produce equal digests across
//! processes, so the hash runs over a canonical rendering of the value:
//!
//! - mapping keys sorted lexicographically
//! - keys with `null` values elided
//! - integral floats rendered as integers
//!
//! The digest is hex-encoded SHA-256.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of the canonical form of `input`.
pub fn fingerprint(input: &Value) -> String {
    let mut buf = String::new();
    write_canonical(&mut buf, input);

    let mut hasher = Sha256::new();
    hasher.update(buf.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical rendering of a JSON value. Exposed for tests and debugging.
pub fn canonical(input: &Value) -> String {
    let mut buf = String::new();
    write_canonical(&mut buf, input);
    buf
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            // Integral floats collapse to their integer rendering so 1.0 and
            // 1 fingerprint identically.
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                    out.push_str(&(f as i64).to_string());
                } else {
                    out.push_str(&f.to_string());
                }
            }
        }
        Value::String(s) => write_escaped(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's default map preserves sorted key order (BTreeMap),
            // but sort explicitly so the rendering never depends on a build
            // flag like preserve_order.
            let mut keys: Vec<&String> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k)
                .collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_canonical(out, &map[*key]);
            }
            out.push('}');
        }
    }
}

fn write_escaped(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
