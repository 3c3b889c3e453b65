// COCO Engine — Model Transport
// The model is a subroutine: request in, response with optional tool_use
// blocks out. Retries and SSE plumbing live in the concrete transport; the
// planner owns deadlines and the tool loop, so the transport stays
// replaceable (tests use a scripted fake).

pub mod anthropic;

pub use anthropic::AnthropicTransport;

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Message, TokenUsage, ToolCall, ToolDefinition};
use crate::engine::config::CocoConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// One model call. `system` carries the assembled context; `messages` the
/// per-turn user/assistant/tool exchange; `tools` the registry's available
/// definitions.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
    /// The model name reported by the API, when available.
    pub model: Option<String>,
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: &ModelRequest) -> CoreResult<ModelResponse>;
}

// ── Transport factory ──────────────────────────────────────────────────────

/// Type-erased model transport. Callers hold `AnyTransport` and call
/// `.complete()` without knowing which concrete backend is in use.
#[derive(Clone)]
pub struct AnyTransport(Arc<dyn ModelTransport>);

impl AnyTransport {
    pub fn from_config(config: &CocoConfig) -> CoreResult<Self> {
        let key = config.anthropic_api_key.as_deref().ok_or_else(|| {
            CoreError::Config("ANTHROPIC_API_KEY is not set — the planner cannot run".into())
        })?;
        Ok(AnyTransport(Arc::new(AnthropicTransport::new(key))))
    }

    /// Wrap an arbitrary transport (used by tests to inject a scripted fake).
    pub fn from_transport(transport: Arc<dyn ModelTransport>) -> Self {
        AnyTransport(transport)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn complete(&self, request: &ModelRequest) -> CoreResult<ModelResponse> {
        self.0.complete(request).await
    }
}
