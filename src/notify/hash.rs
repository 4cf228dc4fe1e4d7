//! Canonical content hashing of response bodies.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 (lowercase hex) of a response body.
///
/// Strings are hashed as their raw bytes, absent bodies as empty input and
/// everything else as compact JSON with object keys sorted at every depth, so
/// the hash does not depend on field order.
pub fn content_hash(body: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    match body {
        None => {}
        Some(Value::String(s)) => hasher.update(s.as_bytes()),
        Some(other) => {
            let mut canonical = String::new();
            write_canonical(other, &mut canonical);
            hasher.update(canonical.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
