// COCO Engine — Filesystem Tools
// read_file / write_file, jailed to the workspace via path validation.

use super::ToolDeps;
use crate::atoms::error::CoreError;
use crate::atoms::types::truncate_utf8;
use crate::engine::config::CocoConfig;
use crate::engine::registry::{Tool, ToolRegistry};
use crate::engine::workspace::validate_path;
use serde_json::{json, Value};

/// Cap on file content returned to the model.
const READ_LIMIT_BYTES: usize = 50_000;

fn require_str(input: &Value, key: &str) -> Result<String, CoreError> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::Other(format!("missing required '{}' parameter", key)))
}

pub fn register(registry: &ToolRegistry, _config: &CocoConfig, deps: &ToolDeps) {
    let workspace = deps.workspace.clone();
    registry.register(
        Tool::new(
            "read_file",
            "Read a text file from the workspace. Returns the file contents.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace"}
                },
                "required": ["path"]
            }),
        )
        .category("filesystem")
        .handler(move |input| {
            let workspace = workspace.clone();
            async move {
                let path = require_str(&input, "path")?;
                let resolved = validate_path(&path, &workspace).map_err(CoreError::Other)?;
                let content = tokio::fs::read_to_string(&resolved)
                    .await
                    .map_err(|e| CoreError::Other(format!("cannot read '{}': {}", path, e)))?;
                let truncated = content.len() > READ_LIMIT_BYTES;
                let mut out = truncate_utf8(&content, READ_LIMIT_BYTES).to_string();
                if truncated {
                    out.push_str("\n… (truncated)");
                }
                Ok(Value::String(out))
            }
        }),
    );

    let workspace = deps.workspace.clone();
    registry.register(
        Tool::new(
            "write_file",
            "Write content to a file in the workspace. Creates or overwrites.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace"},
                    "content": {"type": "string", "description": "The content to write"}
                },
                "required": ["path", "content"]
            }),
        )
        .category("filesystem")
        .handler(move |input| {
            let workspace = workspace.clone();
            async move {
                let path = require_str(&input, "path")?;
                let content = require_str(&input, "content")?;
                let resolved = validate_path(&path, &workspace).map_err(CoreError::Other)?;
                tokio::fs::write(&resolved, &content)
                    .await
                    .map_err(|e| CoreError::Other(format!("cannot write '{}': {}", path, e)))?;
                Ok(Value::String(format!(
                    "Wrote {} bytes to {}",
                    content.len(),
                    path
                )))
            }
        }),
    );
}
