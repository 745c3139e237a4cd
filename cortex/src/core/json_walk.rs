//! Generic transforms over JSON argument trees.

use serde_json::{Map, Value};

/// Rebuild `value` with every string leaf passed through `rewrite`.
///
/// Object keys are left untouched; only string values (at any depth, inside
/// objects and arrays) are rewritten.
pub fn map_strings<F>(value: &Value, rewrite: &mut F) -> Value
where
    F: FnMut(&str) -> String,
{
    match value {
        Value::String(s) => Value::String(rewrite(s)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| map_strings(v, rewrite)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, rewrite)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Visit every string leaf without rebuilding the tree.
pub fn for_each_string<F>(value: &Value, visit: &mut F)
where
    F: FnMut(&str),
{
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| for_each_string(v, visit)),
        Value::Object(map) => map.values().for_each(|v| for_each_string(v, visit)),
        _ => {}
    }
}

/// Serialize with object keys sorted at every level.
pub fn canonical_string(value: &Value) -> String {
    let mut buf = String::new();
    write_canonical(value, &mut buf);
    buf
}

fn write_canonical(value: &Value, buf: &mut String) {
    match value {
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                write_canonical(item, buf);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&Value::String(key.clone()).to_string());
                buf.push(':');
                write_canonical(&map[key], buf);
            }
            buf.push('}');
        }
        scalar => buf.push_str(&scalar.to_string()),
    }
}
