//! JSON value helpers.
//!
//! Chunk payloads are plain [`serde_json::Value`]s. Cache budgets and B-tree
//! node bounds are expressed in bytes, so every value needs a size estimate
//! that is cheap to compute and stable across runs.

pub use serde_json::Value;

const TAG: usize = 1;
const LEN: usize = 4;
const SMALL_INT: usize = 4;
const INT32: usize = 5;
const FLOAT: usize = 8;

/// Estimated encoded size of `value` in bytes.
///
/// Strings cost a tag, a length prefix, and their UTF-8 bytes. Numbers cost
/// less when they fit a small integer. Arrays and objects cost a tag, a
/// length, their members, and an end marker.
pub fn size_of_value(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => TAG,
        Value::String(s) => size_of_string(s),
        Value::Number(n) => TAG + size_of_number(n),
        Value::Array(items) => {
            TAG + LEN + items.iter().map(size_of_value).sum::<usize>() + TAG
        }
        Value::Object(map) => {
            TAG + LEN
                + map
                    .iter()
                    .map(|(k, v)| size_of_string(k) + size_of_value(v))
                    .sum::<usize>()
                + TAG
        }
    }
}

fn size_of_string(s: &str) -> usize {
    TAG + LEN + s.len()
}

fn size_of_number(n: &serde_json::Number) -> usize {
    let int = n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64)
            .map(|f| f as i64)
    });
    match int {
        Some(i) if i >= i32::MIN as i64 && i <= i32::MAX as i64 => {
            if i <= -(1 << 30) || i >= (1 << 30) - 1 {
                INT32
            } else {
                SMALL_INT
            }
        }
        _ => FLOAT,
    }
}
