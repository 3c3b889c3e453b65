// COCO Engine — Tool Registry
// Single registration point per tool: schema, handler, and dispatch live
// together. Tools registered without a handler (missing credentials or
// libraries) are tracked but hidden from the model so it cannot hallucinate
// calls into them.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::ToolDefinition;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type HandlerFuture = Pin<Box<dyn Future<Output = CoreResult<Value>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// One registered tool. `handler: None` marks the tool unavailable.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Option<ToolHandler>,
    pub category: String,
    /// Optional per-call timeout; overrun surfaces as ToolTimeout.
    pub timeout: Option<Duration>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: None,
            category: "general".into(),
            timeout: None,
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach an async handler.
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |input| Box::pin(f(input))));
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    /// Register a tool. Idempotent by name; the last registration wins.
    pub fn register(&self, tool: Tool) {
        let mut tools = self.tools.write();
        if tools.contains_key(&tool.name) {
            warn!(
                "[registry] Tool '{}' re-registered — last registration wins",
                tool.name
            );
        }
        info!(
            "[registry] Registered '{}' (category={}, available={})",
            tool.name,
            tool.category,
            tool.handler.is_some()
        );
        tools.insert(tool.name.clone(), tool);
    }

    /// Tool definitions for the model. Only tools with a working handler
    /// appear here.
    pub fn get_api_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .filter(|t| t.handler.is_some())
            .map(Tool::definition)
            .collect()
    }

    /// Execute a tool by name.
    ///
    /// - Unregistered name → `UnknownTool`.
    /// - Registered without a handler → the user-facing unavailability string.
    /// - Handler errors are wrapped as `ToolExecution` carrying the message.
    /// - A declared timeout overrun → `ToolTimeout`.
    pub async fn execute(&self, name: &str, input: Value) -> CoreResult<Value> {
        let (handler, timeout) = {
            let tools = self.tools.read();
            let tool = tools
                .get(name)
                .ok_or_else(|| CoreError::UnknownTool(name.to_string()))?;
            match &tool.handler {
                Some(h) => (h.clone(), tool.timeout),
                None => {
                    return Ok(Value::String(format!(
                        "Tool '{}' is not available (missing configuration)",
                        name
                    )));
                }
            }
        };

        let fut = handler(input);
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r,
                Err(_) => {
                    return Err(CoreError::ToolTimeout {
                        tool: name.to_string(),
                        timeout_secs: limit.as_secs(),
                    });
                }
            },
            None => fut.await,
        };

        result.map_err(|e| match e {
            err @ CoreError::ToolTimeout { .. } => err,
            err @ CoreError::ToolExecution { .. } => err,
            other => CoreError::tool(name, other.to_string()),
        })
    }

    // ── Introspection helpers ──────────────────────────────────────────────

    /// Names of all registered tools, available or not.
    pub fn list_tools(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.tools
            .read()
            .values()
            .filter(|t| t.handler.is_some())
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn unavailable_tools(&self) -> Vec<String> {
        self.tools
            .read()
            .values()
            .filter(|t| t.handler.is_none())
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn get_tools_by_category(&self, category: &str) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .filter(|t| t.category == category)
            .map(Tool::definition)
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .tools
            .read()
            .values()
            .map(|t| t.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool(name: &str) -> Tool {
        Tool::new(name, "echo the input back", json!({"type": "object"}))
            .handler(|input| async move { Ok(input) })
    }

    #[tokio::test]
    async fn unavailable_tools_are_hidden_but_answer_politely() {
        let registry = ToolRegistry::new();
        registry.register(Tool::new(
            "generate_image",
            "Generate an image from a prompt",
            json!({"type": "object"}),
        ));
        registry.register(echo_tool("read_file"));

        let defs = registry.get_api_definitions();
        assert!(defs.iter().all(|d| d.name != "generate_image"));
        assert!(defs.iter().any(|d| d.name == "read_file"));

        let result = registry
            .execute("generate_image", json!({"prompt": "a cat"}))
            .await
            .unwrap();
        assert_eq!(
            result,
            Value::String(
                "Tool 'generate_image' is not available (missing configuration)".into()
            )
        );

        assert_eq!(registry.unavailable_tools(), vec!["generate_image"]);
        assert_eq!(registry.available_tools(), vec!["read_file"]);
    }

    #[tokio::test]
    async fn unknown_tools_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("never_registered", json!({})).await;
        assert!(matches!(err, Err(CoreError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn handler_errors_are_wrapped_with_the_original_message() {
        let registry = ToolRegistry::new();
        registry.register(
            Tool::new("flaky", "always fails", json!({"type": "object"})).handler(
                |_input| async move { Err::<Value, _>(CoreError::Other("disk on fire".into())) },
            ),
        );

        let err = registry.execute("flaky", json!({})).await.unwrap_err();
        match err {
            CoreError::ToolExecution { tool, message } => {
                assert_eq!(tool, "flaky");
                assert!(message.contains("disk on fire"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeouts_surface_as_tool_timeout() {
        let registry = ToolRegistry::new();
        registry.register(
            Tool::new("slow", "sleeps forever", json!({"type": "object"}))
                .timeout(Duration::from_millis(20))
                .handler(|_input| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }),
        );

        let err = registry.execute("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::ToolTimeout { .. }));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("dup"));
        registry.register(
            Tool::new("dup", "replacement", json!({"type": "object"}))
                .handler(|_input| async move { Ok(Value::String("replaced".into())) }),
        );

        assert_eq!(registry.len(), 1);
        let result = registry.execute("dup", json!({})).await.unwrap();
        assert_eq!(result, Value::String("replaced".into()));
    }

    #[tokio::test]
    async fn categories_group_tools() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool("read_file").category("filesystem"));
        registry.register(echo_tool("write_file").category("filesystem"));
        registry.register(echo_tool("search_web").category("web"));

        assert_eq!(registry.get_tools_by_category("filesystem").len(), 2);
        assert_eq!(registry.categories(), vec!["filesystem", "web"]);
    }
}
