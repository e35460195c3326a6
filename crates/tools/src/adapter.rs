//! Capability spec → tool descriptors.

use {
    serde_json::{Map, Value, json},
    tracing::debug,
};

use {
    embody_agents::{CapabilitySpec, OperationRef, spec::ParameterLocation},
    embody_protocol::ToolDescriptor,
};

use crate::{naming::tool_name, schema};

/// Target protocol for descriptor generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// MCP-style tool calling (lenient schema consumers).
    ToolCalling,
    /// Realtime voice sessions (strict schema consumers).
    Realtime,
}

/// One descriptor per operation, in the spec's (path, method) order.
pub fn to_tool_descriptors(spec: &CapabilitySpec, protocol: Protocol) -> Vec<ToolDescriptor> {
    let tools: Vec<ToolDescriptor> = spec
        .operations()
        .map(|op| describe(spec, &op, protocol))
        .collect();
    debug!(count = tools.len(), ?protocol, "built tool descriptors");
    tools
}

/// Resolve a tool name back to the operation it was generated from.
pub fn find_operation<'a>(spec: &'a CapabilitySpec, name: &str) -> Option<OperationRef<'a>> {
    spec.operations().find(|op| tool_name(op) == name)
}

fn describe(spec: &CapabilitySpec, op: &OperationRef<'_>, protocol: Protocol) -> ToolDescriptor {
    let description = [&op.operation.summary, &op.operation.description]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{} {}", op.method, op.path));

    let raw = input_schema(spec, op);
    let mut input_schema = schema::normalize(&raw, protocol);
    let description = match protocol {
        Protocol::ToolCalling => description,
        Protocol::Realtime => {
            input_schema = schema::trim_for_realtime(&input_schema);
            schema::clip(&description, schema::MAX_REALTIME_DESCRIPTION)
        },
    };

    ToolDescriptor {
        name: tool_name(op),
        description,
        input_schema,
    }
}

/// Object schema of the operation's arguments: query and path parameters,
/// plus flattened body properties for body-bearing methods.
fn input_schema(spec: &CapabilitySpec, op: &OperationRef<'_>) -> Value {
    let components = &spec.components.schemas;
    let mut properties = Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in op.parameters() {
        if !matches!(
            param.location,
            ParameterLocation::Query | ParameterLocation::Path
        ) {
            continue;
        }
        let mut prop = param
            .schema
            .as_ref()
            .map(|s| schema::inline_refs(s, components))
            .unwrap_or_else(|| json!({"type": "string"}));
        if let (Some(desc), Value::Object(map)) = (&param.description, &mut prop) {
            map.entry("description")
                .or_insert_with(|| Value::String(desc.clone()));
        }
        properties.insert(param.name.clone(), prop);
        // Path parameters are always required.
        if param.required || param.location == ParameterLocation::Path {
            push_unique(&mut required, &param.name);
        }
    }

    if op.method.has_body()
        && let Some(body) = op.body_schema()
    {
        let body = schema::inline_refs(body, components);
        if let Some(Value::Object(body_props)) = body.get("properties") {
            for (name, prop) in body_props {
                properties.insert(name.clone(), prop.clone());
            }
        }
        if let Some(Value::Array(names)) = body.get("required") {
            for name in names.iter().filter_map(Value::as_str) {
                push_unique(&mut required, name);
            }
        }
    }

    let mut out = json!({
        "type": "object",
        "properties": Value::Object(properties),
    });
    if !required.is_empty() {
        out["required"] = json!(required);
    }
    out
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_string());
    }
}
