// COCO Engine — Anthropic Messages Transport
// Speaks the Messages API with SSE streaming. Claude-specific event parsing,
// retry classification, and prompt-caching breakpoints all live here.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{truncate_utf8, Message, Role, TokenUsage, ToolCall};
use crate::engine::providers::{ModelRequest, ModelResponse, ModelTransport};
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use zeroize::Zeroizing;

const BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const MAX_RETRIES: u32 = 3;

pub struct AnthropicTransport {
    client: Client,
    base_url: String,
    /// API key wrapped in Zeroizing<> — automatically zeroed from RAM on drop.
    api_key: Zeroizing<String>,
}

// ── Retry helpers ──────────────────────────────────────────────────────────

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

async fn retry_delay(attempt: u32, retry_after: Option<u64>) -> std::time::Duration {
    let delay = match retry_after {
        Some(secs) => std::time::Duration::from_secs(secs.min(30)),
        None => std::time::Duration::from_millis(500 * (1 << attempt)),
    };
    tokio::time::sleep(delay).await;
    delay
}

// ── Streaming accumulator ──────────────────────────────────────────────────

/// A tool_use block under construction: id and name arrive in
/// content_block_start, the input JSON streams in via input_json_delta.
#[derive(Default)]
struct PendingToolUse {
    id: String,
    name: String,
    input_json: String,
}

#[derive(Default)]
struct ResponseAccumulator {
    text: String,
    tool_uses: std::collections::BTreeMap<usize, PendingToolUse>,
    stop_reason: Option<String>,
    usage: TokenUsage,
    model: Option<String>,
}

impl ResponseAccumulator {
    fn apply_event(&mut self, data: &str) {
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            return;
        };
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                let msg = &v["message"];
                if let Some(model) = msg["model"].as_str() {
                    self.model = Some(model.to_string());
                }
                self.usage.input_tokens += msg["usage"]["input_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let index = v["index"].as_u64().unwrap_or(0) as usize;
                    self.tool_uses.insert(
                        index,
                        PendingToolUse {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            input_json: String::new(),
                        },
                    );
                }
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(t) = delta["text"].as_str() {
                            self.text.push_str(t);
                        }
                    }
                    "input_json_delta" => {
                        let index = v["index"].as_u64().unwrap_or(0) as usize;
                        if let (Some(partial), Some(entry)) = (
                            delta["partial_json"].as_str(),
                            self.tool_uses.get_mut(&index),
                        ) {
                            entry.input_json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                self.usage.output_tokens += v["usage"]["output_tokens"].as_u64().unwrap_or(0);
            }
            _ => {}
        }
    }

    fn finish(self) -> ModelResponse {
        let tool_calls = self
            .tool_uses
            .into_values()
            .map(|p| ToolCall {
                id: if p.id.is_empty() {
                    format!("toolu_{}", uuid::Uuid::new_v4())
                } else {
                    p.id
                },
                name: p.name,
                input: serde_json::from_str(&p.input_json).unwrap_or(json!({})),
            })
            .collect();
        ModelResponse {
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
            usage: self.usage,
            model: self.model,
        }
    }
}

// ── Transport ──────────────────────────────────────────────────────────────

impl AnthropicTransport {
    pub fn new(api_key: &str) -> Self {
        AnthropicTransport {
            client: Client::new(),
            base_url: BASE_URL.to_string(),
            api_key: Zeroizing::new(api_key.to_string()),
        }
    }

    fn format_messages(messages: &[Message]) -> Vec<Value> {
        let mut formatted = Vec::new();
        for msg in messages {
            match msg.role {
                Role::System => {
                    // System content travels in the top-level system field.
                }
                Role::Tool => {
                    // Tool results use the user role with a tool_result block.
                    if let Some(call_id) = &msg.tool_call_id {
                        formatted.push(json!({
                            "role": "user",
                            "content": [{
                                "type": "tool_result",
                                "tool_use_id": call_id,
                                "content": msg.content,
                            }]
                        }));
                    }
                }
                Role::Assistant => {
                    if let Some(tool_calls) = &msg.tool_calls {
                        let mut blocks: Vec<Value> = Vec::new();
                        if !msg.content.is_empty() {
                            blocks.push(json!({"type": "text", "text": msg.content}));
                        }
                        for tc in tool_calls {
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": tc.name,
                                "input": tc.input,
                            }));
                        }
                        formatted.push(json!({"role": "assistant", "content": blocks}));
                    } else {
                        formatted.push(json!({"role": "assistant", "content": msg.content}));
                    }
                }
                Role::User => {
                    formatted.push(json!({"role": "user", "content": msg.content}));
                }
            }
        }
        formatted
    }

    fn build_body(request: &ModelRequest, model: &str) -> Value {
        let mut body = json!({
            "model": model,
            "messages": Self::format_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        // Prompt caching: mark the system prompt so Anthropic caches the
        // prefix across the tool loop's repeated calls within a turn.
        if !request.system.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": request.system,
                "cache_control": { "type": "ephemeral" }
            }]);
        }
        if !request.tools.is_empty() {
            let mut tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            // Cache the tools prefix together with the system prompt.
            if let Some(last) = tools.last_mut() {
                if let Some(obj) = last.as_object_mut() {
                    obj.insert("cache_control".into(), json!({"type": "ephemeral"}));
                }
            }
            body["tools"] = json!(tools);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    async fn complete_inner(&self, request: &ModelRequest) -> CoreResult<ModelResponse> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = Self::build_body(request, &request.model);

        let mut last_error = String::new();
        let mut retry_after: Option<u64> = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[model] Anthropic retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self
                .client
                .post(&url)
                .header("anthropic-version", API_VERSION)
                .header("x-api-key", self.api_key.as_str())
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("HTTP request failed: {}", e);
                    if attempt < MAX_RETRIES {
                        continue;
                    }
                    return Err(CoreError::Model(last_error));
                }
            };

            if !response.status().is_success() {
                let status = response.status().as_u16();
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate_utf8(&body_text, 200));
                error!("[model] Anthropic error {}: {}", status, truncate_utf8(&body_text, 500));

                // Auth errors are never retried.
                if status == 401 || status == 403 {
                    return Err(CoreError::Model(last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(CoreError::Model(last_error));
            }

            let mut acc = ResponseAccumulator::default();
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(result) = byte_stream.next().await {
                let bytes =
                    result.map_err(|e| CoreError::Model(format!("stream read error: {}", e)))?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        acc.apply_event(data);
                    }
                }
            }

            let response = acc.finish();
            info!(
                "[model] Anthropic response: {} chars, {} tool calls, stop={:?}",
                response.text.len(),
                response.tool_calls.len(),
                response.stop_reason
            );
            return Ok(response);
        }

        Err(CoreError::Model(last_error))
    }
}

#[async_trait]
impl ModelTransport for AnthropicTransport {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &ModelRequest) -> CoreResult<ModelResponse> {
        self.complete_inner(request).await
    }
}
