// COCO Engine — Configuration
// Typed configuration + secrets. Missing credentials never fail construction;
// they degrade capabilities (hash embeddings, tools registered unavailable).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_buffer_size() -> usize {
    50
}
fn default_summary_window() -> usize {
    10
}
fn default_summaries_kept() -> usize {
    20
}
fn default_semantic_cap() -> usize {
    10_000
}
fn default_semantic_half_life() -> f64 {
    30.0
}
fn default_identity_budget() -> usize {
    6_000
}
fn default_fact_limit() -> usize {
    8
}
fn default_semantic_k() -> usize {
    5
}
fn default_summary_budget() -> usize {
    4_000
}
fn default_episodic_budget() -> usize {
    8_000
}
fn default_floor() -> usize {
    1_000
}
fn default_total_budget() -> usize {
    32_000
}
fn default_max_rounds() -> u32 {
    8
}
fn default_model_deadline() -> u64 {
    120
}
fn default_bash_timeout() -> u64 {
    30
}
fn default_maintenance_interval() -> u64 {
    10
}

/// Embedding backend settings. When `api_key` is absent the engine falls back
/// to the deterministic hash backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            base_url: "https://api.openai.com".into(),
            model: "text-embedding-3-small".into(),
            api_key: None,
            dim: 1536,
        }
    }
}

/// Capacities and half-lives for the memory layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBudgets {
    /// Episodes kept in the in-memory episodic buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Exchanges per rolling summary window.
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    /// Summaries kept in memory for prompt context.
    #[serde(default = "default_summaries_kept")]
    pub summaries_kept: usize,
    /// Soft cap on semantic memories before eviction.
    #[serde(default = "default_semantic_cap")]
    pub semantic_capacity: usize,
    /// Recency half-life (days) in the semantic effective score.
    #[serde(default = "default_semantic_half_life")]
    pub semantic_half_life_days: f64,
}

impl Default for MemoryBudgets {
    fn default() -> Self {
        MemoryBudgets {
            buffer_size: default_buffer_size(),
            summary_window: default_summary_window(),
            summaries_kept: default_summaries_kept(),
            semantic_capacity: default_semantic_cap(),
            semantic_half_life_days: default_semantic_half_life(),
        }
    }
}

/// Per-section character budgets for the assembled prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBudgets {
    #[serde(default = "default_identity_budget")]
    pub identity_chars: usize,
    #[serde(default = "default_fact_limit")]
    pub fact_limit: usize,
    #[serde(default = "default_semantic_k")]
    pub semantic_k: usize,
    #[serde(default = "default_summary_budget")]
    pub summary_chars: usize,
    #[serde(default = "default_episodic_budget")]
    pub episodic_chars: usize,
    /// Facts and identity are truncated to this floor, never fully dropped.
    #[serde(default = "default_floor")]
    pub floor_chars: usize,
    /// Overall budget for the assembled context.
    #[serde(default = "default_total_budget")]
    pub total_chars: usize,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        ContextBudgets {
            identity_chars: default_identity_budget(),
            fact_limit: default_fact_limit(),
            semantic_k: default_semantic_k(),
            summary_chars: default_summary_budget(),
            episodic_chars: default_episodic_budget(),
            floor_chars: default_floor(),
            total_chars: default_total_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Tool-loop iterations before the planning budget is declared exceeded.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Deadline for a single model call, in seconds.
    #[serde(default = "default_model_deadline")]
    pub model_deadline_secs: u64,
    /// Timeout for the execute_bash tool, in seconds.
    #[serde(default = "default_bash_timeout")]
    pub bash_timeout_secs: u64,
    /// Run decay sweep + semantic compaction every N turns.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_every_turns: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            max_rounds: default_max_rounds(),
            model_deadline_secs: default_model_deadline(),
            bash_timeout_secs: default_bash_timeout(),
            maintenance_every_turns: default_maintenance_interval(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoConfig {
    /// Workspace directory holding all persisted state.
    pub workspace: PathBuf,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub web_search_api_key: Option<String>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub memory: MemoryBudgets,
    #[serde(default)]
    pub context: ContextBudgets,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub debug: bool,
}

impl Default for CocoConfig {
    fn default() -> Self {
        CocoConfig {
            workspace: default_workspace(),
            model: default_model(),
            anthropic_api_key: None,
            web_search_api_key: None,
            embedding: EmbeddingConfig::default(),
            memory: MemoryBudgets::default(),
            context: ContextBudgets::default(),
            planner: PlannerConfig::default(),
            debug: false,
        }
    }
}

fn default_workspace() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coco")
        .join("workspace")
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl CocoConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults. Never fails: absent credentials only narrow capabilities.
    pub fn from_env() -> Self {
        let mut cfg = CocoConfig::default();
        if let Some(ws) = env_nonempty("COCO_WORKSPACE") {
            cfg.workspace = PathBuf::from(ws);
        }
        if let Some(model) = env_nonempty("COCO_MODEL") {
            cfg.model = model;
        }
        cfg.anthropic_api_key = env_nonempty("ANTHROPIC_API_KEY");
        cfg.web_search_api_key = env_nonempty("COCO_WEB_SEARCH_API_KEY");
        cfg.embedding.api_key = env_nonempty("COCO_EMBEDDING_API_KEY");
        if let Some(url) = env_nonempty("COCO_EMBEDDING_BASE_URL") {
            cfg.embedding.base_url = url;
        }
        if let Some(model) = env_nonempty("COCO_EMBEDDING_MODEL") {
            cfg.embedding.model = model;
        }
        cfg.debug = env_nonempty("COCO_DEBUG").is_some();
        cfg
    }
}
