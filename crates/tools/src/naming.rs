use embody_agents::OperationRef;

/// Providers reject function names longer than this.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Tool name for an operation: its `operationId`, else a slug of
/// `<method>_<path>`.
pub fn tool_name(op: &OperationRef<'_>) -> String {
    match op.operation.operation_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => slug(&format!("{}_{}", op.method.as_str(), op.path)),
    }
}

/// Lowercase, non-alphanumerics collapsed to single `_`, trimmed and capped.
fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    trimmed
        .chars()
        .take(MAX_TOOL_NAME_LEN)
        .collect::<String>()
        .trim_end_matches('_')
        .to_string()
}
