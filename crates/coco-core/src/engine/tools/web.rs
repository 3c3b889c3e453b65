// COCO Engine — Web Search Tool
// search_web via the Tavily API. Registers without a handler when no key is
// configured, so the capability degrades instead of the model hallucinating
// web access.

use super::ToolDeps;
use crate::atoms::error::CoreError;
use crate::engine::config::CocoConfig;
use crate::engine::registry::{Tool, ToolRegistry};
use log::info;
use serde_json::{json, Value};
use std::sync::Arc;
use zeroize::Zeroizing;

const SEARCH_URL: &str = "https://api.tavily.com/search";

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": "The search query"}
        },
        "required": ["query"]
    })
}

pub fn register(registry: &ToolRegistry, config: &CocoConfig, _deps: &ToolDeps) {
    let Some(key) = config.web_search_api_key.clone() else {
        info!("[tools] No web search key — registering search_web unavailable");
        registry.register(
            Tool::new("search_web", "Search the web for current information.", schema())
                .category("web"),
        );
        return;
    };

    let api_key = Arc::new(Zeroizing::new(key));
    let client = reqwest::Client::new();
    registry.register(
        Tool::new("search_web", "Search the web for current information.", schema())
            .category("web")
            .timeout(std::time::Duration::from_secs(30))
            .handler(move |input| {
                let api_key = api_key.clone();
                let client = client.clone();
                async move {
                    let query = input
                        .get("query")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| {
                            CoreError::Other("missing required 'query' parameter".into())
                        })?
                        .to_string();

                    let body = json!({
                        "api_key": api_key.as_str(),
                        "query": query,
                        "max_results": 5,
                    });
                    let resp = client.post(SEARCH_URL).json(&body).send().await?;
                    if !resp.status().is_success() {
                        return Err(CoreError::Other(format!(
                            "search API returned {}",
                            resp.status()
                        )));
                    }
                    let v: Value = resp.json().await?;

                    let mut lines = Vec::new();
                    if let Some(answer) = v["answer"].as_str() {
                        lines.push(answer.to_string());
                    }
                    if let Some(results) = v["results"].as_array() {
                        for r in results.iter().take(5) {
                            let title = r["title"].as_str().unwrap_or("(untitled)");
                            let url = r["url"].as_str().unwrap_or("");
                            lines.push(format!("- {} ({})", title, url));
                        }
                    }
                    if lines.is_empty() {
                        lines.push("No results found.".into());
                    }
                    Ok(Value::String(lines.join("\n")))
                }
            }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tools::test_support::deps_in;

    #[tokio::test]
    async fn without_a_key_the_tool_is_registered_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let config = CocoConfig {
            workspace: dir.path().to_path_buf(),
            ..CocoConfig::default()
        };
        register(&registry, &config, &deps_in(dir.path()));

        assert!(registry.contains("search_web"));
        assert!(registry.unavailable_tools().contains(&"search_web".into()));
        let result = registry
            .execute("search_web", json!({"query": "anything"}))
            .await
            .unwrap();
        assert_eq!(
            result.as_str().unwrap(),
            "Tool 'search_web' is not available (missing configuration)"
        );
    }

    #[test]
    fn with_a_key_the_tool_is_available() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let config = CocoConfig {
            workspace: dir.path().to_path_buf(),
            web_search_api_key: Some("tvly-test".into()),
            ..CocoConfig::default()
        };
        register(&registry, &config, &deps_in(dir.path()));
        assert!(registry.available_tools().contains(&"search_web".into()));
    }
}
