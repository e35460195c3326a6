use serde_json::{Map, Value};

use crate::spec::{Method, OperationRef, ParameterLocation};

/// One request against the Agent's invocation contract.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCall {
    pub method: Method,
    /// Concrete path with path parameters substituted.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CallError {
    #[error("tool arguments must be a JSON object")]
    ArgumentsNotObject,
    #[error("missing required path parameter '{0}'")]
    MissingPathParameter(String),
}

impl AgentCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Map tool-call arguments onto an operation: path parameters are
    /// substituted, declared query parameters go to the query string, and
    /// everything else goes to the body (or the query for body-less methods).
    pub fn from_arguments(op: &OperationRef<'_>, arguments: &Value) -> Result<Self, CallError> {
        let mut remaining: Map<String, Value> = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(CallError::ArgumentsNotObject),
        };

        let mut path = op.path.to_string();
        let mut query = Vec::new();

        for param in op.parameters() {
            match param.location {
                ParameterLocation::Path => {
                    let value = remaining
                        .remove(&param.name)
                        .ok_or_else(|| CallError::MissingPathParameter(param.name.clone()))?;
                    let encoded = urlencoding::encode(&scalar_to_string(&value)).into_owned();
                    path = path.replace(&format!("{{{}}}", param.name), &encoded);
                },
                ParameterLocation::Query => {
                    if let Some(value) = remaining.remove(&param.name) {
                        push_query(&mut query, &param.name, &value);
                    }
                },
                ParameterLocation::Header | ParameterLocation::Cookie => {
                    remaining.remove(&param.name);
                },
            }
        }

        let body = if op.method.has_body() {
            Some(Value::Object(remaining))
        } else {
            for (name, value) in &remaining {
                push_query(&mut query, name, value);
            }
            None
        };

        Ok(Self {
            method: op.method,
            path,
            query,
            body,
        })
    }
}

fn push_query(query: &mut Vec<(String, String)>, name: &str, value: &Value) {
    match value {
        Value::Null => {},
        Value::Array(items) => {
            for item in items {
                query.push((name.to_string(), scalar_to_string(item)));
            }
        },
        other => query.push((name.to_string(), scalar_to_string(other))),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
