// COCO Engine — Planner
// The model↔tool loop that produces one assistant reply per user turn:
// call the model, execute any requested tools, feed observations back, and
// repeat until a final text response or the round cap.
//
// Tool failures never bubble out of the loop — they are converted to
// observations so the model can retry or answer around them. Cancellation is
// cooperative: the flag is checked between phases, and pending tool calls
// are not started once it is set.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Message, Role, TokenUsage, ToolInvocation};
use crate::engine::config::PlannerConfig;
use crate::engine::providers::{AnyTransport, ModelRequest};
use crate::engine::registry::ToolRegistry;
use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The turn state machine. Terminal states: Idle (success) and Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Assembling,
    Calling,
    AwaitingModel,
    Dispatching,
    Observing,
    Responding,
    Recording,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub assistant_text: String,
    pub invocations: Vec<ToolInvocation>,
    pub usage: TokenUsage,
    pub cancelled: bool,
    pub rounds: u32,
}

pub struct Planner {
    transport: AnyTransport,
    registry: Arc<ToolRegistry>,
    config: PlannerConfig,
    model: String,
    cancel: Arc<AtomicBool>,
}

impl Planner {
    pub fn new(
        transport: AnyTransport,
        registry: Arc<ToolRegistry>,
        config: PlannerConfig,
        model: String,
    ) -> Self {
        Planner {
            transport,
            registry,
            config,
            model,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for the UI layer's interrupt (Ctrl-C) wiring.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn enter(&self, phase: TurnPhase) {
        debug!("[planner] → {:?}", phase);
    }

    /// Run one complete turn against an already-assembled system prompt.
    ///
    /// `ModelTimeout` and model transport failures propagate to the caller,
    /// which records a placeholder episode; tool failures stay inside the
    /// loop as observations.
    pub async fn run_turn(&self, system_prompt: &str, user_text: &str) -> CoreResult<TurnOutcome> {
        self.cancel.store(false, Ordering::SeqCst);
        self.enter(TurnPhase::Calling);
        let mut messages = vec![Message::user(user_text)];
        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut usage = TokenUsage::default();
        let deadline = Duration::from_secs(self.config.model_deadline_secs);

        let mut round = 0u32;
        loop {
            round += 1;
            if round > self.config.max_rounds {
                warn!(
                    "[planner] Planning budget exceeded ({} rounds), stopping",
                    self.config.max_rounds
                );
                self.enter(TurnPhase::Responding);
                return Ok(TurnOutcome {
                    assistant_text: format!(
                        "I hit my planning budget for this request ({} tool rounds) before \
                         finishing. Here is what I completed so far: {} tool call(s) ran; \
                         ask me to continue and I will pick up from there.",
                        self.config.max_rounds,
                        invocations.len()
                    ),
                    invocations,
                    usage,
                    cancelled: false,
                    rounds: round - 1,
                });
            }

            if self.cancelled() {
                return Ok(self.cancelled_outcome(invocations, usage, round - 1));
            }

            info!(
                "[planner] Round {}/{} ({} messages)",
                round,
                self.config.max_rounds,
                messages.len()
            );
            self.enter(TurnPhase::AwaitingModel);

            let request = ModelRequest {
                model: self.model.clone(),
                system: system_prompt.to_string(),
                messages: messages.clone(),
                tools: self.registry.get_api_definitions(),
                max_tokens: 4096,
                temperature: None,
            };

            let response = match tokio::time::timeout(deadline, self.transport.complete(&request))
                .await
            {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    self.enter(TurnPhase::Failed);
                    return Err(e);
                }
                Err(_) => {
                    self.enter(TurnPhase::Failed);
                    return Err(CoreError::ModelTimeout {
                        deadline_secs: self.config.model_deadline_secs,
                    });
                }
            };
            usage.add(response.usage);

            // No tool calls: this is the final answer.
            if response.tool_calls.is_empty() {
                self.enter(TurnPhase::Responding);
                messages.push(Message::assistant(response.text.clone()));
                return Ok(TurnOutcome {
                    assistant_text: response.text,
                    invocations,
                    usage,
                    cancelled: false,
                    rounds: round,
                });
            }

            self.enter(TurnPhase::Dispatching);
            messages.push(Message {
                role: Role::Assistant,
                content: response.text.clone(),
                tool_calls: Some(response.tool_calls.clone()),
                tool_call_id: None,
            });

            let mut interrupted = false;
            for call in &response.tool_calls {
                // Once interrupted, pending calls are not started.
                if self.cancelled() {
                    interrupted = true;
                    break;
                }

                info!("[planner] Tool call: {} id={}", call.name, call.id);
                let started_at = Utc::now();
                let started = std::time::Instant::now();
                let result = self.registry.execute(&call.name, call.input.clone()).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let (observation, error) = match result {
                    Ok(Value::String(s)) => (s, None),
                    Ok(other) => (other.to_string(), None),
                    Err(CoreError::UnknownTool(name)) => (
                        format!("Tool '{}' does not exist. Do not call it again.", name),
                        Some(format!("unknown tool: {}", name)),
                    ),
                    Err(e) => {
                        warn!("[planner] Tool '{}' failed: {}", call.name, e);
                        (format!("Error: {}", e), Some(e.to_string()))
                    }
                };

                invocations.push(ToolInvocation {
                    name: call.name.clone(),
                    input: call.input.clone(),
                    result: Some(observation.clone()),
                    error,
                    started_at,
                    duration_ms,
                });

                self.enter(TurnPhase::Observing);
                messages.push(Message::tool_result(call.id.clone(), observation));
            }

            if interrupted {
                return Ok(self.cancelled_outcome(invocations, usage, round));
            }

            // Feed observations back to the model.
            self.enter(TurnPhase::Calling);
        }
    }

    fn cancelled_outcome(
        &self,
        invocations: Vec<ToolInvocation>,
        usage: TokenUsage,
        rounds: u32,
    ) -> TurnOutcome {
        info!("[planner] Turn cancelled by user after {} round(s)", rounds);
        TurnOutcome {
            assistant_text: "(interrupted)".into(),
            invocations,
            usage,
            cancelled: true,
            rounds,
        }
    }
}
