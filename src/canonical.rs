//! Request canonicalization for idempotency fingerprints.
//!
//! Every instance of the service must derive the same fingerprint for the
//! same logical request, so nothing here may depend on map iteration order,
//! process state or locale.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Joins the mount path and the sub-path of a request into a normalized route.
///
/// Runs of `/` collapse into one and trailing slashes are dropped. An empty
/// result becomes `"/"`.
pub fn canonical_route(base: &str, path: &str) -> String {
    let mut route = String::with_capacity(base.len() + path.len());
    let mut previous_slash = false;
    for ch in base.chars().chain(path.chars()) {
        if ch == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        route.push(ch);
    }
    while route.ends_with('/') {
        route.pop();
    }
    if route.is_empty() {
        return "/".to_string();
    }
    route
}

/// Serializes JSON with object keys sorted at every depth.
///
/// Arrays keep their element order.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 of the stable serialization, as 64 lower-case hex characters.
///
/// A missing body hashes the same as `{}`.
pub fn body_hash(body: Option<&Value>) -> String {
    let canonical = match body {
        Some(value) => stable_stringify(value),
        None => "{}".to_string(),
    };
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
