//! Realtime protocol messages: client event builders and server event
//! parsing.

use {
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::warn,
};

pub fn session_update(instructions: &str, tools: Vec<Value>, voice: &str) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "instructions": instructions,
            "voice": voice,
            "tools": tools,
            "tool_choice": "auto",
        }
    })
}

pub fn response_create(instructions: Option<&str>) -> Value {
    match instructions {
        Some(text) => json!({"type": "response.create", "response": {"instructions": text}}),
        None => json!({"type": "response.create"}),
    }
}

pub fn function_call_output(call_id: &str, output: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        }
    })
}

// ── Server events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    response: Option<ResponsePayload>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// A function call requested by the model in a completed response.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl ServerEvent {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Function calls carried by a `response.done` event, in output order.
    pub fn function_calls(&self) -> Vec<FunctionCall> {
        if self.kind != "response.done" {
            return Vec::new();
        }
        let Some(response) = &self.response else {
            return Vec::new();
        };
        response
            .output
            .iter()
            .filter(|item| item.kind == "function_call")
            .filter_map(|item| {
                let (Some(call_id), Some(name)) = (&item.call_id, &item.name) else {
                    warn!("function call without call_id or name");
                    return None;
                };
                let arguments = item
                    .arguments
                    .as_deref()
                    .filter(|a| !a.trim().is_empty())
                    .map(|a| serde_json::from_str(a).unwrap_or_else(|_| json!({})))
                    .unwrap_or_else(|| json!({}));
                Some(FunctionCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments,
                })
            })
            .collect()
    }
}
