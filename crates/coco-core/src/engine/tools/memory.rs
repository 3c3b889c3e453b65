// COCO Engine — Memory Tools
// memory_store / memory_search: the model's explicit handles into the fact
// store and semantic index, alongside the automatic extraction pipeline.

use super::ToolDeps;
use crate::atoms::error::CoreError;
use crate::atoms::types::{FactType, NewFact};
use crate::engine::facts::extract::serialize_fact;
use crate::engine::registry::{Tool, ToolRegistry};
use crate::engine::config::CocoConfig;
use serde_json::{json, Value};

pub fn register(registry: &ToolRegistry, _config: &CocoConfig, deps: &ToolDeps) {
    let store_deps = deps.clone();
    registry.register(
        Tool::new(
            "memory_store",
            "Store a fact in long-term memory. Use when the user shares something worth remembering.",
            json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string", "description": "The fact, as one clear sentence"},
                    "fact_type": {
                        "type": "string",
                        "description": "One of: appointment, contact, task, preference, note, topic, generic",
                    },
                    "subject": {"type": "string", "description": "Who or what the fact is about"}
                },
                "required": ["content"]
            }),
        )
        .category("memory")
        .handler(move |input| {
            let deps = store_deps.clone();
            async move {
                let content = input
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::Other("missing required 'content' parameter".into()))?
                    .to_string();
                let fact_type = input
                    .get("fact_type")
                    .and_then(|v| v.as_str())
                    .and_then(FactType::parse)
                    .unwrap_or(FactType::Note);

                let mut fact = NewFact::new(fact_type, content);
                if let Some(subject) = input.get("subject").and_then(|v| v.as_str()) {
                    fact = fact.with_subject(subject);
                }

                let serialized = serialize_fact(&fact);
                let stored = deps.facts.store(std::slice::from_ref(&fact))?;
                let _ = deps.rag.index(&serialized, "tool:memory_store").await;

                Ok(Value::String(if stored > 0 {
                    format!("Remembered: {}", serialized)
                } else {
                    format!("Already knew that (reinforced): {}", serialized)
                }))
            }
        }),
    );

    let search_deps = deps.clone();
    registry.register(
        Tool::new(
            "memory_search",
            "Search long-term memory for facts and past context.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What to look for"}
                },
                "required": ["query"]
            }),
        )
        .category("memory")
        .handler(move |input| {
            let deps = search_deps.clone();
            async move {
                let query = input
                    .get("query")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::Other("missing required 'query' parameter".into()))?
                    .to_string();

                let hits = deps.facts.search(&query, None, 5)?;
                let mut lines: Vec<String> = hits
                    .iter()
                    .map(|h| {
                        format!(
                            "- [{}] {} (importance {:.2})",
                            h.fact.fact_type.as_str(),
                            h.fact.content,
                            h.effective_importance
                        )
                    })
                    .collect();
                for m in deps.rag.retrieve(&query, 3, 0.25).await {
                    lines.push(format!("- (semantic) {}", m.text));
                }
                Ok(Value::String(if lines.is_empty() {
                    "No memories matched.".into()
                } else {
                    lines.join("\n")
                }))
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tools::test_support::deps_in;

    fn setup() -> (tempfile::TempDir, ToolRegistry, ToolDeps) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let config = CocoConfig {
            workspace: dir.path().to_path_buf(),
            ..CocoConfig::default()
        };
        let deps = deps_in(dir.path());
        register(&registry, &config, &deps);
        (dir, registry, deps)
    }

    #[tokio::test]
    async fn store_then_search_round_trips() {
        let (_dir, registry, deps) = setup();
        let stored = registry
            .execute(
                "memory_store",
                json!({"content": "The user's cat is named Miso", "fact_type": "note", "subject": "Miso"}),
            )
            .await
            .unwrap();
        assert!(stored.as_str().unwrap().starts_with("Remembered"));
        assert_eq!(deps.facts.stats().unwrap().total, 1);

        let found = registry
            .execute("memory_search", json!({"query": "cat named Miso"}))
            .await
            .unwrap();
        assert!(found.as_str().unwrap().contains("Miso"));
    }

    #[tokio::test]
    async fn duplicate_store_reports_reinforcement() {
        let (_dir, registry, _deps) = setup();
        let input = json!({"content": "The user works remote on Fridays"});
        registry.execute("memory_store", input.clone()).await.unwrap();
        let second = registry.execute("memory_store", input).await.unwrap();
        assert!(second.as_str().unwrap().contains("reinforced"));
    }

    #[tokio::test]
    async fn empty_search_is_graceful() {
        let (_dir, registry, _deps) = setup();
        let result = registry
            .execute("memory_search", json!({"query": "nothing stored yet"}))
            .await
            .unwrap();
        assert_eq!(result.as_str().unwrap(), "No memories matched.");
    }
}
