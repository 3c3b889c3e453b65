// COCO Engine — Built-in Tool Providers
// Each provider registers its tools through the uniform
// `register(registry, config, deps)` entry point and decides at registration
// time whether its handler is available, based on configuration. Tools whose
// credentials are missing register with no handler so the model never sees
// them.
//
// Module layout:
//   filesystem.rs — read_file / write_file (workspace-jailed)
//   shell.rs      — execute_bash (timeout-bounded)
//   web.rs        — search_web (available only with an API key)
//   memory.rs     — memory_store / memory_search

pub mod filesystem;
pub mod memory;
pub mod shell;
pub mod web;

use crate::engine::config::CocoConfig;
use crate::engine::facts::FactStore;
use crate::engine::rag::SemanticRag;
use crate::engine::registry::{Tool, ToolRegistry};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a tool provider may need, wired explicitly — no globals.
#[derive(Clone)]
pub struct ToolDeps {
    pub workspace: PathBuf,
    pub facts: Arc<FactStore>,
    pub rag: Arc<SemanticRag>,
}

/// Register every built-in provider.
pub fn register_builtin(registry: &ToolRegistry, config: &CocoConfig, deps: &ToolDeps) {
    filesystem::register(registry, config, deps);
    shell::register(registry, config, deps);
    web::register(registry, config, deps);
    memory::register(registry, config, deps);
    register_generation_stubs(registry);
}

/// Media generation needs credentials the core does not manage; the tools
/// register unavailable so they stay hidden from the model but answer
/// politely if something calls them anyway.
fn register_generation_stubs(registry: &ToolRegistry) {
    registry.register(
        Tool::new(
            "generate_image",
            "Generate an image from a text prompt.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "What to draw"}
                },
                "required": ["prompt"]
            }),
        )
        .category("generation"),
    );
    registry.register(
        Tool::new(
            "generate_video",
            "Generate a short video from a text prompt.",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "What to render"}
                },
                "required": ["prompt"]
            }),
        )
        .category("generation"),
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::rag::HashEmbeddingBackend;

    pub fn deps_in(dir: &std::path::Path) -> ToolDeps {
        ToolDeps {
            workspace: dir.to_path_buf(),
            facts: Arc::new(FactStore::open_in_memory().unwrap()),
            rag: Arc::new(
                SemanticRag::open_in_memory(Arc::new(HashEmbeddingBackend::default()), 100, 30.0)
                    .unwrap(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registration_hides_unconfigured_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let config = CocoConfig {
            workspace: dir.path().to_path_buf(),
            ..CocoConfig::default()
        };
        register_builtin(&registry, &config, &test_support::deps_in(dir.path()));

        let available = registry.available_tools();
        assert!(available.contains(&"read_file".to_string()));
        assert!(available.contains(&"write_file".to_string()));
        assert!(available.contains(&"execute_bash".to_string()));
        assert!(available.contains(&"memory_store".to_string()));

        // No web key, no media credentials → hidden from the model.
        let unavailable = registry.unavailable_tools();
        assert!(unavailable.contains(&"search_web".to_string()));
        assert!(unavailable.contains(&"generate_image".to_string()));
        assert!(unavailable.contains(&"generate_video".to_string()));

        let defs = registry.get_api_definitions();
        assert!(defs.iter().all(|d| d.name != "search_web"));
    }
}
