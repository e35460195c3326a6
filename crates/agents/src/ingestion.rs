//! Default file-ingestion capability for attachment-bearing chat requests.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::json;

use crate::spec::{CapabilitySpec, MediaType, Method, Operation, RequestBody};

pub const INGEST_PATH: &str = "/_embody/ingest";
pub const INGEST_OPERATION_ID: &str = "ingest_attachment";

fn ingestion_operation() -> Operation {
    Operation {
        operation_id: Some(INGEST_OPERATION_ID.into()),
        summary: Some("Read an attached file so its contents can be used in the answer".into()),
        description: None,
        parameters: Vec::new(),
        request_body: Some(RequestBody {
            required: true,
            description: None,
            content: BTreeMap::from([("application/json".to_string(), MediaType {
                schema: Some(json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "URL of the attached file"},
                        "name": {"type": "string"}
                    },
                    "required": ["url"]
                })),
            })]),
        }),
    }
}

/// Return a spec that also carries the ingestion operation. The input is
/// shared when the operation is already present.
pub fn with_file_ingestion(spec: &Arc<CapabilitySpec>) -> Arc<CapabilitySpec> {
    if spec.operation(Method::Post, INGEST_PATH).is_some() {
        return Arc::clone(spec);
    }
    let mut extended = CapabilitySpec::clone(spec);
    extended
        .paths
        .entry(INGEST_PATH.to_string())
        .or_default()
        .set_operation(Method::Post, ingestion_operation());
    Arc::new(extended)
}
