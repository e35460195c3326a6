//! Capability spec: the machine-readable description of an Agent's
//! operations (an OpenAPI 3 subset).

use std::{collections::BTreeMap, fmt, path::Path, str::FromStr};

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openapi: Option<String>,
    pub info: SpecInfo,
    pub paths: BTreeMap<String, PathItem>,
    pub components: Components,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecInfo {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Components {
    pub schemas: BTreeMap<String, serde_json::Value>,
}

/// Operations available on one path, plus parameters shared by all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathItem {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub put: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Operation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Operation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Query,
    Path,
    Header,
    Cookie,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestBody {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub content: BTreeMap<String, MediaType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaType {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

// ── Methods ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    /// Iteration order used when walking a path item.
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Put,
        Method::Post,
        Method::Delete,
        Method::Patch,
        Method::Head,
        Method::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether arguments travel in a request body rather than the query.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unsupported method: {s}"))
    }
}

impl PathItem {
    pub fn operation(&self, method: Method) -> Option<&Operation> {
        match method {
            Method::Get => self.get.as_ref(),
            Method::Put => self.put.as_ref(),
            Method::Post => self.post.as_ref(),
            Method::Delete => self.delete.as_ref(),
            Method::Patch => self.patch.as_ref(),
            Method::Head => self.head.as_ref(),
            Method::Options => self.options.as_ref(),
        }
    }

    pub fn set_operation(&mut self, method: Method, op: Operation) {
        let slot = match method {
            Method::Get => &mut self.get,
            Method::Put => &mut self.put,
            Method::Post => &mut self.post,
            Method::Delete => &mut self.delete,
            Method::Patch => &mut self.patch,
            Method::Head => &mut self.head,
            Method::Options => &mut self.options,
        };
        *slot = Some(op);
    }
}

// ── Operation view ───────────────────────────────────────────────────────────

/// One operation together with its location in the spec.
#[derive(Debug, Clone, Copy)]
pub struct OperationRef<'a> {
    pub method: Method,
    pub path: &'a str,
    pub operation: &'a Operation,
    path_parameters: &'a [Parameter],
}

impl<'a> OperationRef<'a> {
    /// Effective parameters: path-level ones overridden by operation-level
    /// ones with the same name and location.
    pub fn parameters(&self) -> Vec<&'a Parameter> {
        let mut params: Vec<&Parameter> = self
            .path_parameters
            .iter()
            .filter(|shared| {
                !self
                    .operation
                    .parameters
                    .iter()
                    .any(|p| p.name == shared.name && p.location == shared.location)
            })
            .collect();
        params.extend(self.operation.parameters.iter());
        params
    }

    /// JSON request-body schema, preferring `application/json`.
    pub fn body_schema(&self) -> Option<&'a serde_json::Value> {
        let body = self.operation.request_body.as_ref()?;
        body.content
            .get("application/json")
            .or_else(|| body.content.values().next())
            .and_then(|m| m.schema.as_ref())
    }
}

impl CapabilitySpec {
    /// Parse a spec from JSON or YAML text.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match serde_json::from_str(raw) {
            Ok(spec) => Ok(spec),
            Err(json_err) => serde_yaml::from_str(raw)
                .with_context(|| format!("capability spec is neither JSON ({json_err}) nor YAML")),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read capability spec {}", path.display()))?;
        Self::parse(&raw)
    }

    /// All operations in deterministic (path, method) order.
    pub fn operations(&self) -> impl Iterator<Item = OperationRef<'_>> {
        self.paths.iter().flat_map(|(path, item)| {
            Method::ALL.into_iter().filter_map(move |method| {
                item.operation(method).map(|operation| OperationRef {
                    method,
                    path: path.as_str(),
                    operation,
                    path_parameters: &item.parameters,
                })
            })
        })
    }

    pub fn operation(&self, method: Method, path: &str) -> Option<OperationRef<'_>> {
        self.operations()
            .find(|op| op.method == method && op.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "openapi": "3.0.1",
        "info": {"title": "Weather", "description": "Forecasts"},
        "paths": {
            "/forecast/{city}": {
                "parameters": [{"name": "city", "in": "path", "required": true}],
                "get": {
                    "operationId": "get_forecast",
                    "parameters": [{"name": "days", "in": "query"}]
                }
            },
            "/alerts": {
                "post": {
                    "summary": "Create alert",
                    "requestBody": {"content": {"application/json": {"schema": {"type": "object"}}}}
                },
                "get": {}
            }
        }
    }"#;

    #[test]
    fn operations_are_ordered_by_path_then_method() {
        let spec = CapabilitySpec::parse(SPEC).unwrap();
        let ops: Vec<_> = spec
            .operations()
            .map(|op| format!("{} {}", op.method, op.path))
            .collect();
        assert_eq!(ops, vec![
            "GET /alerts",
            "POST /alerts",
            "GET /forecast/{city}"
        ]);
    }

    #[test]
    fn merges_path_level_parameters() {
        let spec = CapabilitySpec::parse(SPEC).unwrap();
        let op = spec.operation(Method::Get, "/forecast/{city}").unwrap();
        let names: Vec<_> = op.parameters().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["city", "days"]);
    }

    #[test]
    fn parses_yaml() {
        let yaml = "info:\n  title: Y\npaths:\n  /ping:\n    get:\n      summary: Ping\n";
        let spec = CapabilitySpec::parse(yaml).unwrap();
        assert_eq!(spec.info.title, "Y");
        assert!(spec.operation(Method::Get, "/ping").is_some());
    }

    #[test]
    fn method_parsing_is_case_insensitive() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert!("TRACE".parse::<Method>().is_err());
        assert!(Method::Patch.has_body());
        assert!(!Method::Delete.has_body());
    }
}
