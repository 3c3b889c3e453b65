// COCO Engine — Shell Tool
// execute_bash: run a command in the workspace with a bounded runtime.
// The per-tool timeout is enforced by the registry; overruns surface to the
// model as ToolTimeout observations.

use super::ToolDeps;
use crate::atoms::error::CoreError;
use crate::atoms::types::truncate_utf8;
use crate::engine::config::CocoConfig;
use crate::engine::registry::{Tool, ToolRegistry};
use serde_json::{json, Value};
use std::time::Duration;

/// Cap on combined stdout/stderr handed back to the model.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

pub fn register(registry: &ToolRegistry, config: &CocoConfig, deps: &ToolDeps) {
    let workspace = deps.workspace.clone();
    registry.register(
        Tool::new(
            "execute_bash",
            "Run a shell command in the workspace directory. Returns stdout and stderr.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute"}
                },
                "required": ["command"]
            }),
        )
        .category("system")
        .timeout(Duration::from_secs(config.planner.bash_timeout_secs))
        .handler(move |input| {
            let workspace = workspace.clone();
            async move {
                let command = input
                    .get("command")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::Other("missing required 'command' parameter".into()))?
                    .to_string();

                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .current_dir(&workspace)
                    .output()
                    .await
                    .map_err(|e| CoreError::Other(format!("cannot spawn shell: {}", e)))?;

                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut combined = String::new();
                if !output.status.success() {
                    combined.push_str(&format!(
                        "Error: command exited with {}\n",
                        output.status
                    ));
                }
                combined.push_str(stdout.trim_end());
                if !stderr.trim().is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(stderr.trim_end());
                }
                if combined.is_empty() {
                    combined.push_str("(no output)");
                }
                Ok(Value::String(
                    truncate_utf8(&combined, OUTPUT_LIMIT_BYTES).to_string(),
                ))
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tools::test_support::deps_in;

    fn setup() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let config = CocoConfig {
            workspace: dir.path().to_path_buf(),
            ..CocoConfig::default()
        };
        register(&registry, &config, &deps_in(dir.path()));
        (dir, registry)
    }

    #[tokio::test]
    async fn runs_commands_in_the_workspace() {
        let (dir, registry) = setup();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let result = registry
            .execute("execute_bash", json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_an_error_marker() {
        let (_dir, registry) = setup();
        let result = registry
            .execute("execute_bash", json!({"command": "exit 3"}))
            .await
            .unwrap();
        assert!(result.as_str().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn silent_commands_still_answer() {
        let (_dir, registry) = setup();
        let result = registry
            .execute("execute_bash", json!({"command": "true"}))
            .await
            .unwrap();
        assert_eq!(result.as_str().unwrap(), "(no output)");
    }
}
