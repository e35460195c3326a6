//! JSON Schema transforms. Every function returns a new tree and leaves its
//! input untouched.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::adapter::Protocol;

/// Nesting limit for `$ref` inlining; deeper references collapse to `{}`.
pub const MAX_REF_DEPTH: usize = 8;

/// Realtime providers reject longer descriptions.
pub const MAX_REALTIME_DESCRIPTION: usize = 1024;

const REF_PREFIX: &str = "#/components/schemas/";

/// Replace local `#/components/schemas/*` references with their targets.
/// Unknown or non-local references are left as they are.
pub fn inline_refs(schema: &Value, components: &BTreeMap<String, Value>) -> Value {
    inline_at(schema, components, 0)
}

fn inline_at(schema: &Value, components: &BTreeMap<String, Value>, depth: usize) -> Value {
    match schema {
        Value::Object(map) => {
            if let Some(target) = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix(REF_PREFIX))
                && let Some(resolved) = components.get(target)
            {
                if depth >= MAX_REF_DEPTH {
                    return Value::Object(Map::new());
                }
                return inline_at(resolved, components, depth + 1);
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), inline_at(v, components, depth)))
                    .collect(),
            )
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| inline_at(v, components, depth))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Give every array a usable `items` schema for the target protocol.
pub fn normalize(schema: &Value, protocol: Protocol) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), normalize(v, protocol)))
                .collect();
            if is_array_type(map.get("type")) {
                let unconstrained = match out.get("items") {
                    None => true,
                    Some(Value::Object(items)) => items.is_empty(),
                    Some(Value::Array(items)) => items.is_empty(),
                    Some(_) => false,
                };
                if unconstrained {
                    out.insert("items".into(), default_items(protocol));
                }
            }
            Value::Object(out)
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, protocol)).collect()),
        other => other.clone(),
    }
}

fn is_array_type(ty: Option<&Value>) -> bool {
    match ty {
        Some(Value::String(s)) => s == "array",
        Some(Value::Array(types)) => types.iter().any(|t| t == "array"),
        _ => false,
    }
}

fn default_items(protocol: Protocol) -> Value {
    match protocol {
        Protocol::ToolCalling => json!({"type": "string"}),
        Protocol::Realtime => json!({"type": ["string", "number", "boolean", "object", "array"]}),
    }
}

/// Clip descriptions and drop vendor extensions and examples.
pub fn trim_for_realtime(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with("x-") && *k != "example" && *k != "examples")
                .map(|(k, v)| {
                    let v = match (k.as_str(), v) {
                        ("description", Value::String(s)) => {
                            Value::String(clip(s, MAX_REALTIME_DESCRIPTION))
                        },
                        _ => trim_for_realtime(v),
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(trim_for_realtime).collect()),
        other => other.clone(),
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
